use std::rc::Rc;

use exprc::tree::{BinaryOp, UnaryOp};
use exprc::{compile_lambda, CompileOptions, Expr, LambdaExpr, ParamVar};
use exprc_runtime::{Machine, Metadata, Op, Type, Value};

fn nullable_i32() -> Type {
    Type::nullable(Type::I32)
}

fn compile_and_run(lambda: &LambdaExpr, args: Vec<Value>) -> Value {
    let md = Metadata::with_prelude();
    let program = compile_lambda(&md, lambda, &CompileOptions::default()).expect("compile");
    Machine::new(&md)
        .run(&Rc::new(program), args)
        .expect("run")
}

/// `(a op b)` over two `i32?` parameters.
fn binary_lambda(op: BinaryOp, ty: Type, lifted_to_null: bool) -> LambdaExpr {
    let a = ParamVar::new(0, "a", nullable_i32());
    let b = ParamVar::new(1, "b", nullable_i32());
    let body = Expr::Binary {
        op,
        left: Box::new(Expr::param(&a)),
        right: Box::new(Expr::param(&b)),
        ty: ty.clone(),
        method: None,
        lifted_to_null,
    };
    LambdaExpr::new("lifted", vec![a, b], body, ty)
}

#[test]
fn lifted_arithmetic_propagates_null() {
    let add = binary_lambda(BinaryOp::Add, nullable_i32(), false);
    assert_eq!(compile_and_run(&add, vec![Value::I32(2), Value::I32(3)]), Value::I32(5));
    assert_eq!(compile_and_run(&add, vec![Value::Null, Value::I32(3)]), Value::Null);
    assert_eq!(compile_and_run(&add, vec![Value::I32(2), Value::Null]), Value::Null);
}

#[test]
fn lifted_comparison_is_false_on_null() {
    let less = binary_lambda(BinaryOp::LessThan, Type::Bool, false);
    assert_eq!(compile_and_run(&less, vec![Value::I32(1), Value::I32(3)]), Value::Bool(true));
    assert_eq!(compile_and_run(&less, vec![Value::Null, Value::I32(3)]), Value::Bool(false));
    assert_eq!(compile_and_run(&less, vec![Value::I32(1), Value::Null]), Value::Bool(false));
}

#[test]
fn comparison_lifted_to_null_yields_null() {
    let less = binary_lambda(BinaryOp::LessThan, Type::nullable(Type::Bool), true);
    assert_eq!(compile_and_run(&less, vec![Value::I32(1), Value::I32(3)]), Value::Bool(true));
    assert_eq!(compile_and_run(&less, vec![Value::Null, Value::I32(3)]), Value::Null);
}

#[test]
fn lifted_equality_treats_two_nulls_as_equal() {
    let equal = binary_lambda(BinaryOp::Equal, Type::Bool, false);
    assert_eq!(compile_and_run(&equal, vec![Value::Null, Value::Null]), Value::Bool(true));
    assert_eq!(compile_and_run(&equal, vec![Value::Null, Value::I32(1)]), Value::Bool(false));
    assert_eq!(compile_and_run(&equal, vec![Value::I32(1), Value::I32(1)]), Value::Bool(true));
    assert_eq!(compile_and_run(&equal, vec![Value::I32(1), Value::I32(2)]), Value::Bool(false));

    let not_equal = binary_lambda(BinaryOp::NotEqual, Type::Bool, false);
    assert_eq!(compile_and_run(&not_equal, vec![Value::Null, Value::Null]), Value::Bool(false));
    assert_eq!(compile_and_run(&not_equal, vec![Value::Null, Value::I32(1)]), Value::Bool(true));
    assert_eq!(compile_and_run(&not_equal, vec![Value::I32(1), Value::I32(2)]), Value::Bool(true));
}

#[test]
fn equality_with_a_non_nullable_operand() {
    let a = ParamVar::new(0, "a", nullable_i32());
    let body = Expr::binary(
        BinaryOp::Equal,
        Expr::param(&a),
        Expr::constant(4, Type::I32),
        Type::Bool,
    );
    let lambda = LambdaExpr::new("is_four", vec![a], body, Type::Bool);
    assert_eq!(compile_and_run(&lambda, vec![Value::I32(4)]), Value::Bool(true));
    assert_eq!(compile_and_run(&lambda, vec![Value::Null]), Value::Bool(false));
}

#[test]
fn comparing_with_null_literal_tests_has_value() {
    let a = ParamVar::new(0, "a", nullable_i32());
    let body = Expr::binary(
        BinaryOp::Equal,
        Expr::param(&a),
        Expr::null(nullable_i32()),
        Type::Bool,
    );
    let lambda = LambdaExpr::new("is_null", vec![a], body, Type::Bool);

    let md = Metadata::with_prelude();
    let program = compile_lambda(&md, &lambda, &CompileOptions::default()).expect("compile");
    assert!(program
        .entry_function()
        .code
        .contains(&Op::HasValue(nullable_i32())));
    assert!(!program.entry_function().code.contains(&Op::LdNull));

    assert_eq!(compile_and_run(&lambda, vec![Value::Null]), Value::Bool(true));
    assert_eq!(compile_and_run(&lambda, vec![Value::I32(0)]), Value::Bool(false));
}

#[test]
fn lifted_negation() {
    let a = ParamVar::new(0, "a", nullable_i32());
    let body = Expr::unary(UnaryOp::Negate, Expr::param(&a), nullable_i32());
    let lambda = LambdaExpr::new("neg", vec![a], body, nullable_i32());
    assert_eq!(compile_and_run(&lambda, vec![Value::I32(4)]), Value::I32(-4));
    assert_eq!(compile_and_run(&lambda, vec![Value::Null]), Value::Null);
}

#[test]
fn lifted_conversion_between_nullables() {
    let a = ParamVar::new(0, "a", nullable_i32());
    let wide = Type::nullable(Type::I64);
    let body = Expr::convert(Expr::param(&a), wide.clone());
    let lambda = LambdaExpr::new("widen", vec![a], body, wide);
    assert_eq!(compile_and_run(&lambda, vec![Value::I32(3)]), Value::I64(3));
    assert_eq!(compile_and_run(&lambda, vec![Value::Null]), Value::Null);
}

#[test]
fn each_operand_is_evaluated_once() {
    let counter = ParamVar::new(0, "c", Type::Class("Counter".into()));
    let bump = Expr::convert(
        Expr::call(Some(Expr::param(&counter)), "Counter.Bump", vec![], Type::I32),
        nullable_i32(),
    );
    let sum = Expr::binary(BinaryOp::Add, bump, Expr::null(nullable_i32()), nullable_i32());
    let body = Expr::block(
        vec![],
        vec![sum, Expr::property(Some(Expr::param(&counter)), "Counter.Value", Type::I32)],
    );
    let c = ParamVar::new(1, "seed", Type::I32);
    let lambda = LambdaExpr::new(
        "once",
        vec![c.clone()],
        Expr::block(
            vec![counter.clone()],
            vec![
                Expr::assign(
                    Expr::param(&counter),
                    Expr::new_object(
                        Type::Class("Counter".into()),
                        "Counter.ctor(i32)",
                        vec![Expr::param(&c)],
                    ),
                ),
                body,
            ],
        ),
        Type::I32,
    );
    assert_eq!(compile_and_run(&lambda, vec![Value::I32(10)]), Value::I32(11));
}
