use std::rc::Rc;

use exprc::tree::{BinaryOp, ElementInit, MemberBinding, MemberRef};
use exprc::{compile_lambda, CompileError, CompileOptions, Expr, LambdaExpr, ParamVar};
use exprc_runtime::{Machine, Metadata, Op, Program, Type, Value};

fn counter_type() -> Type {
    Type::Class("Counter".into())
}

fn point_type() -> Type {
    Type::Struct("Point".into())
}

fn list_type() -> Type {
    Type::Class("List".into())
}

fn compile_and_run(lambda: &LambdaExpr, args: Vec<Value>) -> Value {
    let md = Metadata::with_prelude();
    let program = compile_lambda(&md, lambda, &CompileOptions::default()).expect("compile");
    Machine::new(&md)
        .run(&Rc::new(program), args)
        .expect("run")
}

fn new_counter(initial: i32) -> Expr {
    Expr::new_object(
        counter_type(),
        "Counter.ctor(i32)",
        vec![Expr::constant(initial, Type::I32)],
    )
}

fn boxed(value: i32) -> Expr {
    Expr::convert(Expr::constant(value, Type::I32), Type::Object)
}

#[test]
fn instance_methods_mutate_the_receiver() {
    let c = ParamVar::new(0, "c", counter_type());
    let body = Expr::block(
        vec![c.clone()],
        vec![
            Expr::assign(Expr::param(&c), new_counter(0)),
            Expr::call(Some(Expr::param(&c)), "Counter.Bump", vec![], Type::I32),
            Expr::call(Some(Expr::param(&c)), "Counter.Bump", vec![], Type::I32),
        ],
    );
    let lambda = LambdaExpr::new("bump_twice", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(2));
}

#[test]
fn virtual_method_reads_instance_state() {
    let body = Expr::call(Some(new_counter(7)), "Counter.Describe", vec![], Type::String);
    let lambda = LambdaExpr::new("describe", vec![], body, Type::String);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::str("counter 7"));
}

#[test]
fn virtual_dispatch_picks_the_override() {
    let shape = ParamVar::new(0, "s", Type::Class("Shape".into()));
    let body = Expr::block(
        vec![shape.clone()],
        vec![
            Expr::assign(
                Expr::param(&shape),
                Expr::convert(
                    Expr::new_object(
                        Type::Class("Circle".into()),
                        "Circle.ctor",
                        vec![Expr::constant(2.0, Type::F64)],
                    ),
                    Type::Class("Shape".into()),
                ),
            ),
            Expr::call(Some(Expr::param(&shape)), "Shape.Area", vec![], Type::F64),
        ],
    );
    let lambda = LambdaExpr::new("area", vec![], body, Type::F64);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::F64(12.0));
}

#[test]
fn by_ref_argument_updates_a_local() {
    let c = ParamVar::new(0, "c", counter_type());
    let total = ParamVar::new(1, "total", Type::I32);
    let body = Expr::block(
        vec![c.clone(), total.clone()],
        vec![
            Expr::assign(Expr::param(&c), new_counter(5)),
            Expr::assign(Expr::param(&total), Expr::constant(10, Type::I32)),
            Expr::call(
                Some(Expr::param(&c)),
                "Counter.AddTo",
                vec![Expr::param(&total)],
                Type::Void,
            ),
            Expr::param(&total),
        ],
    );
    let lambda = LambdaExpr::new("add_to", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(15));
}

#[test]
fn try_parse_writes_its_out_argument() {
    let n = ParamVar::new(0, "n", Type::I32);
    let body = Expr::block(
        vec![n.clone()],
        vec![
            Expr::call(
                None,
                "Int32.TryParse",
                vec![Expr::constant("42", Type::String), Expr::param(&n)],
                Type::Bool,
            ),
            Expr::param(&n),
        ],
    );
    let lambda = LambdaExpr::new("parse", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(42));
}

#[test]
fn by_ref_property_argument_is_written_back() {
    let c = ParamVar::new(0, "c", counter_type());
    let value = Expr::property(Some(Expr::param(&c)), "Counter.Value", Type::I32);
    let body = Expr::block(
        vec![c.clone()],
        vec![
            Expr::assign(Expr::param(&c), new_counter(3)),
            Expr::call(None, "Int32.Increment", vec![value.clone()], Type::Void),
            value,
        ],
    );
    let lambda = LambdaExpr::new("increment_property", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(4));
}

#[test]
fn by_ref_parameter_is_read_and_written_through_its_address() {
    let slot = ParamVar::by_ref(0, "slot", Type::I32);
    let inner = LambdaExpr::new(
        "double_in_place",
        vec![slot.clone()],
        Expr::assign(
            Expr::param(&slot),
            Expr::binary(
                BinaryOp::Multiply,
                Expr::param(&slot),
                Expr::constant(2, Type::I32),
                Type::I32,
            ),
        ),
        Type::Void,
    );
    let x = ParamVar::new(1, "x", Type::I32);
    let body = Expr::block(
        vec![],
        vec![
            Expr::invoke(Expr::Lambda(inner), vec![Expr::param(&x)], Type::Void),
            Expr::param(&x),
        ],
    );
    let lambda = LambdaExpr::new("double", vec![x], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![Value::I32(21)]), Value::I32(42));
}

#[test]
fn invoked_lambda_literal_is_inlined() {
    let x = ParamVar::new(0, "x", Type::I32);
    let y = ParamVar::new(1, "y", Type::I32);
    let twice = LambdaExpr::new(
        "twice",
        vec![y.clone()],
        Expr::binary(
            BinaryOp::Multiply,
            Expr::param(&y),
            Expr::constant(2, Type::I32),
            Type::I32,
        ),
        Type::I32,
    );
    let body = Expr::invoke(
        Expr::Lambda(twice),
        vec![Expr::binary(
            BinaryOp::Add,
            Expr::param(&x),
            Expr::constant(1, Type::I32),
            Type::I32,
        )],
        Type::I32,
    );
    let lambda = LambdaExpr::new("outer", vec![x], body, Type::I32);

    let md = Metadata::with_prelude();
    let program = compile_lambda(&md, &lambda, &CompileOptions::default()).expect("compile");
    assert_eq!(program.functions.len(), 1);
    assert!(!program
        .entry_function()
        .code
        .iter()
        .any(|op| matches!(op, Op::CallDelegate { .. } | Op::MakeClosure { .. })));
    assert_eq!(compile_and_run(&lambda, vec![Value::I32(4)]), Value::I32(10));
}

/// Method keys and tail flags of every call in the entry function.
fn calls(md: &Metadata, program: &Program) -> Vec<(String, bool)> {
    program
        .entry_function()
        .code
        .iter()
        .filter_map(|op| match op {
            Op::Call(site) => Some((md.method_def(site.method).key.clone(), site.tail)),
            _ => None,
        })
        .collect()
}

#[test]
fn inlined_lambda_in_tail_position_keeps_the_tail_call_unless_writing_back() {
    let md = Metadata::with_prelude();
    let c = ParamVar::new(0, "c", counter_type());
    let at_least_one = |p: &ParamVar| {
        LambdaExpr::new(
            "at_least_one",
            vec![p.clone()],
            Expr::call(
                None,
                "Math.Max",
                vec![Expr::param(p), Expr::constant(1, Type::I32)],
                Type::I32,
            ),
            Type::I32,
        )
    };
    let outer = |inner: LambdaExpr| {
        let value = Expr::property(Some(Expr::param(&c)), "Counter.Value", Type::I32);
        let body = Expr::invoke(Expr::Lambda(inner), vec![value], Type::I32);
        LambdaExpr::new("outer", vec![c.clone()], body, Type::I32).with_tail_call(true)
    };

    let by_value = outer(at_least_one(&ParamVar::new(1, "p", Type::I32)));
    let program = compile_lambda(&md, &by_value, &CompileOptions::default()).expect("compile");
    assert_eq!(
        calls(&md, &program),
        vec![
            ("Counter.get_Value".to_string(), false),
            ("Math.Max".to_string(), true),
        ]
    );

    let by_ref = outer(at_least_one(&ParamVar::by_ref(1, "p", Type::I32)));
    let program = compile_lambda(&md, &by_ref, &CompileOptions::default()).expect("compile");
    assert_eq!(
        calls(&md, &program),
        vec![
            ("Counter.get_Value".to_string(), false),
            ("Math.Max".to_string(), false),
            ("Counter.set_Value".to_string(), false),
        ]
    );
}

#[test]
fn write_backs_run_after_the_call_in_argument_order() {
    let md = Metadata::with_prelude();
    let c = ParamVar::new(0, "c", counter_type());
    let d = ParamVar::new(1, "d", counter_type());
    let value_of = |v: &ParamVar| Expr::property(Some(Expr::param(v)), "Counter.Value", Type::I32);
    let body = Expr::block(
        vec![c.clone(), d.clone()],
        vec![
            Expr::assign(Expr::param(&c), new_counter(1)),
            Expr::assign(Expr::param(&d), new_counter(2)),
            Expr::call(None, "Int32.Swap", vec![value_of(&c), value_of(&d)], Type::Void),
            Expr::binary(
                BinaryOp::Add,
                Expr::binary(
                    BinaryOp::Multiply,
                    value_of(&c),
                    Expr::constant(10, Type::I32),
                    Type::I32,
                ),
                value_of(&d),
                Type::I32,
            ),
        ],
    );
    let lambda = LambdaExpr::new("swap_values", vec![], body, Type::I32);

    let program = compile_lambda(&md, &lambda, &CompileOptions::default()).expect("compile");
    let keys: Vec<String> = calls(&md, &program).into_iter().map(|(key, _)| key).collect();
    assert_eq!(
        &keys[..5],
        &[
            "Counter.get_Value",
            "Counter.get_Value",
            "Int32.Swap",
            "Counter.set_Value",
            "Counter.set_Value",
        ]
    );
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(21));
}

#[test]
fn struct_methods_update_the_variable_in_place() {
    let p = ParamVar::new(0, "p", point_type());
    let body = Expr::block(
        vec![p.clone()],
        vec![
            Expr::assign(
                Expr::param(&p),
                Expr::new_object(
                    point_type(),
                    "Point.ctor",
                    vec![Expr::constant(1, Type::I32), Expr::constant(2, Type::I32)],
                ),
            ),
            Expr::call(
                Some(Expr::param(&p)),
                "Point.Offset",
                vec![Expr::constant(3, Type::I32)],
                Type::Void,
            ),
            Expr::property(Some(Expr::param(&p)), "Point.Sum", Type::I32),
        ],
    );
    let lambda = LambdaExpr::new("offset", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(9));
}

#[test]
fn user_defined_operator_is_called() {
    let p = ParamVar::new(0, "p", point_type());
    let q = ParamVar::new(1, "q", point_type());
    let point = |x: i32, y: i32| {
        Expr::new_object(
            point_type(),
            "Point.ctor",
            vec![Expr::constant(x, Type::I32), Expr::constant(y, Type::I32)],
        )
    };
    let sum = Expr::Binary {
        op: BinaryOp::Add,
        left: Box::new(Expr::param(&p)),
        right: Box::new(Expr::param(&q)),
        ty: point_type(),
        method: Some("Point.op_Addition".into()),
        lifted_to_null: false,
    };
    let body = Expr::block(
        vec![p.clone(), q.clone()],
        vec![
            Expr::assign(Expr::param(&p), point(1, 2)),
            Expr::assign(Expr::param(&q), point(10, 20)),
            Expr::property(Some(sum), "Point.Sum", Type::I32),
        ],
    );
    let lambda = LambdaExpr::new("add_points", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(33));
}

#[test]
fn list_initializer_and_indexer() {
    let list = ParamVar::new(0, "list", list_type());
    let item = |idx: i32| Expr::Index {
        object: Box::new(Expr::param(&list)),
        indexer: Some("List.Item".into()),
        arguments: vec![Expr::constant(idx, Type::I32)],
        ty: Type::Object,
    };
    let body = Expr::block(
        vec![list.clone()],
        vec![
            Expr::assign(
                Expr::param(&list),
                Expr::ListInit {
                    new: Box::new(Expr::new_object(list_type(), "List.ctor", vec![])),
                    initializers: vec![
                        ElementInit {
                            add_method: "List.Add".into(),
                            arguments: vec![boxed(10)],
                        },
                        ElementInit {
                            add_method: "List.Push".into(),
                            arguments: vec![boxed(20)],
                        },
                    ],
                },
            ),
            Expr::assign(item(0), boxed(5)),
            Expr::binary(
                BinaryOp::Add,
                Expr::convert(item(0), Type::I32),
                Expr::convert(item(1), Type::I32),
                Type::I32,
            ),
        ],
    );
    let lambda = LambdaExpr::new("list", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(25));
}

#[test]
fn member_initializer_assigns_and_fills_nested_lists() {
    let c = ParamVar::new(0, "c", counter_type());
    let init = Expr::MemberInit {
        new: Box::new(Expr::new_object(counter_type(), "Counter.ctor", vec![])),
        bindings: vec![
            MemberBinding::Assignment {
                member: MemberRef::Property("Counter.Value".into()),
                expression: Expr::constant(5, Type::I32),
            },
            MemberBinding::ListBinding {
                member: MemberRef::Property("Counter.Tags".into()),
                initializers: vec![
                    ElementInit {
                        add_method: "List.Add".into(),
                        arguments: vec![boxed(1)],
                    },
                    ElementInit {
                        add_method: "List.Add".into(),
                        arguments: vec![boxed(2)],
                    },
                ],
            },
        ],
    };
    let tags = Expr::property(Some(Expr::param(&c)), "Counter.Tags", list_type());
    let body = Expr::block(
        vec![c.clone()],
        vec![
            Expr::assign(Expr::param(&c), init),
            Expr::binary(
                BinaryOp::Add,
                Expr::property(Some(Expr::param(&c)), "Counter.Value", Type::I32),
                Expr::property(Some(tags), "List.Count", Type::I32),
                Type::I32,
            ),
        ],
    );
    let lambda = LambdaExpr::new("init", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(7));
}

#[test]
fn array_initializer_and_element_access() {
    let ints = Type::vector(Type::I32);
    let arr = ParamVar::new(0, "arr", ints.clone());
    let element = |idx: i32| Expr::Index {
        object: Box::new(Expr::param(&arr)),
        indexer: None,
        arguments: vec![Expr::constant(idx, Type::I32)],
        ty: Type::I32,
    };
    let body = Expr::block(
        vec![arr.clone()],
        vec![
            Expr::assign(
                Expr::param(&arr),
                Expr::NewArray {
                    form: exprc::tree::NewArrayForm::Init,
                    ty: ints,
                    expressions: vec![
                        Expr::constant(3, Type::I32),
                        Expr::constant(4, Type::I32),
                    ],
                },
            ),
            Expr::call(None, "Int32.Increment", vec![element(1)], Type::Void),
            Expr::binary(BinaryOp::Multiply, element(0), element(1), Type::I32),
        ],
    );
    let lambda = LambdaExpr::new("array", vec![], body, Type::I32);
    assert_eq!(compile_and_run(&lambda, vec![]), Value::I32(15));
}

#[test]
fn abstract_type_construction_is_rejected() {
    let body = Expr::new_object(Type::Class("Shape".into()), "Shape.ctor", vec![]);
    let lambda = LambdaExpr::new("shape", vec![], body, Type::Class("Shape".into()));
    let md = Metadata::with_prelude();
    let err = compile_lambda(&md, &lambda, &CompileOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::NonAbstractConstructorRequired(ty) if ty == "Shape"));
}

#[test]
fn unknown_members_are_reported_by_key() {
    let body = Expr::call(None, "Math.Nope", vec![], Type::I32);
    let lambda = LambdaExpr::new("nope", vec![], body, Type::I32);
    let md = Metadata::with_prelude();
    let err = compile_lambda(&md, &lambda, &CompileOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::UnknownMethod(key) if key == "Math.Nope"));
}
