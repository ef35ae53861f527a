use std::rc::Rc;

use exprc::tree::UnaryOp;
use exprc::{compile_lambda, lower_expression, CompileOptions, EmitMode, Expr, LambdaExpr, ParamVar};
use exprc_runtime::{Fault, Machine, Metadata, Op, Program, Type, Value};

fn run_program(md: &Metadata, program: Program, args: Vec<Value>) -> Result<Value, Fault> {
    Machine::new(md).run(&Rc::new(program), args)
}

fn run_lambda(lambda: &LambdaExpr, args: Vec<Value>) -> Result<Value, Fault> {
    let md = Metadata::with_prelude();
    let program = compile_lambda(&md, lambda, &CompileOptions::default()).expect("compile");
    run_program(&md, program, args)
}

#[test]
fn negated_constant_leaves_one_value() {
    let md = Metadata::with_prelude();
    let node = Expr::unary(UnaryOp::Negate, Expr::constant(5, Type::I32), Type::I32);
    let lowered = lower_expression(&md, &[], &node, EmitMode::VALUE).expect("lower");
    assert_eq!(lowered.code(), &[Op::LdI32(5), Op::Neg]);
    assert_eq!(lowered.net_stack, 1);
    assert_eq!(
        run_program(&md, lowered.program, vec![]).expect("run"),
        Value::I32(-5)
    );
}

#[test]
fn void_mode_discards_the_value_and_balances_label_blocks() {
    let md = Metadata::with_prelude();
    let node = Expr::call(
        None,
        "Math.Max",
        vec![Expr::constant(1, Type::I32), Expr::constant(2, Type::I32)],
        Type::I32,
    );
    let lowered = lower_expression(&md, &[], &node, EmitMode::VOID).expect("lower");
    assert_eq!(lowered.code().last(), Some(&Op::Pop));
    assert_eq!(lowered.net_stack, 0);
    assert_eq!(lowered.label_pushes, lowered.label_pops);
    assert!(lowered.max_label_depth >= 1);
}

#[test]
fn constants_without_a_literal_form_are_bound() {
    let md = Metadata::with_prelude();
    let node = Expr::constant(7, Type::Object);
    let lowered = lower_expression(&md, &[], &node, EmitMode::VALUE).expect("lower");
    assert_eq!(lowered.code(), &[Op::LdConst(0)]);
    assert_eq!(lowered.program.entry_function().constants, vec![Value::I32(7)]);
    assert_eq!(
        run_program(&md, lowered.program, vec![]).expect("run"),
        Value::I32(7)
    );
}

#[test]
fn numeric_widening_conversion() {
    let x = ParamVar::new(0, "x", Type::I32);
    let lambda = LambdaExpr::new(
        "widen",
        vec![x.clone()],
        Expr::convert(Expr::param(&x), Type::F64),
        Type::F64,
    );
    assert_eq!(run_lambda(&lambda, vec![Value::I32(3)]).expect("run"), Value::F64(3.0));
}

#[test]
fn boxing_through_object_round_trips() {
    let x = ParamVar::new(0, "x", Type::I32);
    let boxed = Expr::convert(Expr::param(&x), Type::Object);
    let lambda = LambdaExpr::new(
        "roundtrip",
        vec![x.clone()],
        Expr::convert(boxed, Type::I32),
        Type::I32,
    );
    let md = Metadata::with_prelude();
    let program = compile_lambda(&md, &lambda, &CompileOptions::default()).expect("compile");
    let code = &program.entry_function().code;
    assert!(code.contains(&Op::Box(Type::I32)));
    assert!(code.contains(&Op::UnboxAny(Type::I32)));
    assert_eq!(
        run_program(&md, program, vec![Value::I32(12)]).expect("run"),
        Value::I32(12)
    );
}

#[test]
fn wrapping_and_unwrapping_nullables() {
    let x = ParamVar::new(0, "x", Type::I32);
    let wrap = LambdaExpr::new(
        "wrap",
        vec![x.clone()],
        Expr::convert(Expr::param(&x), Type::nullable(Type::I32)),
        Type::nullable(Type::I32),
    );
    assert_eq!(run_lambda(&wrap, vec![Value::I32(3)]).expect("run"), Value::I32(3));

    let n = ParamVar::new(0, "n", Type::nullable(Type::I32));
    let unwrap = LambdaExpr::new(
        "unwrap",
        vec![n.clone()],
        Expr::convert(Expr::param(&n), Type::I32),
        Type::I32,
    );
    assert_eq!(run_lambda(&unwrap, vec![Value::I32(8)]).expect("run"), Value::I32(8));
    assert!(matches!(
        run_lambda(&unwrap, vec![Value::Null]),
        Err(Fault::NullableWithoutValue)
    ));
}

#[test]
fn type_test_on_object_checks_at_runtime() {
    let o = ParamVar::new(0, "o", Type::Object);
    let lambda = LambdaExpr::new(
        "is_int",
        vec![o.clone()],
        Expr::TypeIs {
            expression: Box::new(Expr::param(&o)),
            type_operand: Type::I32,
        },
        Type::Bool,
    );
    assert_eq!(run_lambda(&lambda, vec![Value::I32(4)]).expect("run"), Value::Bool(true));
    assert_eq!(run_lambda(&lambda, vec![Value::str("4")]).expect("run"), Value::Bool(false));
    assert_eq!(run_lambda(&lambda, vec![Value::Null]).expect("run"), Value::Bool(false));
}

#[test]
fn type_test_on_a_value_type_is_decided_statically() {
    let md = Metadata::with_prelude();
    let x = ParamVar::new(0, "x", Type::I32);
    let node = Expr::TypeIs {
        expression: Box::new(Expr::param(&x)),
        type_operand: Type::Object,
    };
    let lowered = lower_expression(&md, &[x], &node, EmitMode::VALUE).expect("lower");
    assert_eq!(lowered.code(), &[Op::LdBool(true)]);
}

#[test]
fn closure_reads_a_captured_parameter() {
    let x = ParamVar::new(0, "x", Type::I32);
    let inner = LambdaExpr::new(
        "add_ten",
        vec![],
        Expr::binary(
            exprc::tree::BinaryOp::Add,
            Expr::param(&x),
            Expr::constant(10, Type::I32),
            Type::I32,
        ),
        Type::I32,
    );
    let f = ParamVar::new(1, "f", inner.delegate_type());
    let body = Expr::block(
        vec![f.clone()],
        vec![
            Expr::assign(Expr::param(&f), Expr::Lambda(inner)),
            Expr::invoke(Expr::param(&f), vec![], Type::I32),
        ],
    );
    let lambda = LambdaExpr::new("outer", vec![x], body, Type::I32);

    let md = Metadata::with_prelude();
    let program = compile_lambda(&md, &lambda, &CompileOptions::default()).expect("compile");
    assert_eq!(program.functions.len(), 2);
    assert!(program.entry_function().code.contains(&Op::MakeCell));
    assert_eq!(
        run_program(&md, program, vec![Value::I32(5)]).expect("run"),
        Value::I32(15)
    );
}

#[test]
fn closure_writes_are_seen_by_the_enclosing_function() {
    let x = ParamVar::new(0, "x", Type::I32);
    let bump = LambdaExpr::new(
        "bump",
        vec![],
        Expr::assign(
            Expr::param(&x),
            Expr::binary(
                exprc::tree::BinaryOp::Add,
                Expr::param(&x),
                Expr::constant(1, Type::I32),
                Type::I32,
            ),
        ),
        Type::Void,
    );
    let f = ParamVar::new(1, "f", bump.delegate_type());
    let body = Expr::block(
        vec![f.clone()],
        vec![
            Expr::assign(Expr::param(&f), Expr::Lambda(bump)),
            Expr::invoke(Expr::param(&f), vec![], Type::Void),
            Expr::invoke(Expr::param(&f), vec![], Type::Void),
            Expr::param(&x),
        ],
    );
    let lambda = LambdaExpr::new("twice", vec![x], body, Type::I32);
    assert_eq!(run_lambda(&lambda, vec![Value::I32(1)]).expect("run"), Value::I32(3));
}

#[test]
fn runtime_variables_share_the_variable_cells() {
    let v = ParamVar::new(0, "v", Type::I32);
    let body = Expr::block(
        vec![v.clone()],
        vec![
            Expr::assign(Expr::param(&v), Expr::constant(4, Type::I32)),
            Expr::call(
                None,
                "RuntimeVariables.Get",
                vec![
                    Expr::RuntimeVariables {
                        variables: vec![v.clone()],
                    },
                    Expr::constant(0, Type::I32),
                ],
                Type::Object,
            ),
        ],
    );
    let lambda = LambdaExpr::new("peek", vec![], body, Type::Object);
    assert_eq!(run_lambda(&lambda, vec![]).expect("run"), Value::I32(4));
}

#[test]
fn throw_faults_with_the_thrown_value() {
    let body = Expr::Throw {
        value: Some(Box::new(Expr::constant("boom", Type::String))),
        ty: Type::I32,
    };
    let lambda = LambdaExpr::new("fail", vec![], body, Type::I32);
    match run_lambda(&lambda, vec![]) {
        Err(Fault::Exception(value)) => assert_eq!(value, Value::str("boom")),
        other => panic!("unexpected result {other:?}"),
    }
}
