//! Binary operators: primitive, user-defined, lifted and short-circuit.

use exprc_runtime::{Op, Type};

use super::lift::{LiftCore, LiftFamily};
use super::{EmitMode, LambdaCompiler};
use crate::error::CompileError;
use crate::tree::{BinaryOp, Expr};

impl<'a> LambdaCompiler<'a> {
    pub(super) fn emit_binary(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let Expr::Binary {
            op,
            left,
            right,
            ty,
            method,
            lifted_to_null,
        } = node
        else {
            return Err(CompileError::contract("Binary", "expected a binary node"));
        };
        let (left, right) = (left.as_ref(), right.as_ref());
        let (lt, rt) = (left.ty(), right.ty());

        if matches!(op, BinaryOp::AndAlso | BinaryOp::OrElse) {
            if method.is_some() || lt.is_nullable() {
                return Err(CompileError::unsupported(
                    "Binary",
                    format!("{op:?} over `{lt}` with a user operator or nullable operands"),
                ));
            }
            return self.emit_short_circuit(*op, left, right);
        }

        if let Some(key) = method {
            return self.emit_binary_method(*op, left, right, ty, key, *lifted_to_null, mode);
        }

        if op.is_equality() && matches!(ty.non_nullable(), Type::Bool) {
            let null_left = left.is_null_constant() && !right.is_null_constant() && rt.is_nullable();
            let null_right = right.is_null_constant() && !left.is_null_constant() && lt.is_nullable();
            if null_left || null_right {
                let (null, other) = if null_left { (left, right) } else { (right, left) };
                return self.emit_null_equality(*op, null, other, *lifted_to_null);
            }
        }

        if lt.is_nullable() || rt.is_nullable() {
            if matches!(lt.non_nullable(), Type::Bool) && matches!(op, BinaryOp::And | BinaryOp::Or) {
                return Err(CompileError::unsupported(
                    "Binary",
                    format!("three-valued {op:?} on `{lt}`"),
                ));
            }
            let family = if op.is_equality() && !lifted_to_null {
                LiftFamily::Equality {
                    equal: *op == BinaryOp::Equal,
                }
            } else {
                LiftFamily::Propagate
            };
            let core = LiftCore::Binary {
                op: *op,
                operand: lt.non_nullable().clone(),
            };
            return self.emit_lift(family, ty, core, &[left, right]);
        }

        self.emit_value(left)?;
        self.emit_value(right)?;
        self.emit_binary_operator(*op, &lt)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_binary_method(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        ty: &Type,
        key: &str,
        lifted_to_null: bool,
        mode: EmitMode,
    ) -> Result<(), CompileError> {
        let method = self.method_id(key)?;
        let def = self.md.method_def(method);
        let lifted = [left, right]
            .iter()
            .zip(&def.params)
            .any(|(arg, param)| arg.ty().is_nullable() && !param.is_nullable());
        if !lifted {
            return self.emit_static_call(method, &[left, right], mode);
        }
        let family = if op.is_equality() && !lifted_to_null {
            LiftFamily::Equality {
                equal: op == BinaryOp::Equal,
            }
        } else {
            LiftFamily::Propagate
        };
        self.emit_lift(family, ty, LiftCore::Method(method), &[left, right])
    }

    /// `x == null` on a nullable `x` is just a has-value test.
    fn emit_null_equality(
        &mut self,
        op: BinaryOp,
        null: &Expr,
        other: &Expr,
        lifted_to_null: bool,
    ) -> Result<(), CompileError> {
        if lifted_to_null {
            self.emit_expression_as_void(null, EmitMode::VOID)?;
            self.emit_expression_as_void(other, EmitMode::VOID)?;
            return self.emitter.emit(Op::LdNull);
        }
        let ty = other.ty();
        self.emit_address(other, &ty)?;
        self.emitter.emit(Op::HasValue(ty))?;
        if op == BinaryOp::Equal {
            self.emitter.emit_all([Op::LdBool(false), Op::Ceq])?;
        }
        Ok(())
    }

    fn emit_short_circuit(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<(), CompileError> {
        let end = self.emitter.define_label();
        self.emit_value(left)?;
        self.emitter.emit(Op::Dup)?;
        if op == BinaryOp::AndAlso {
            self.emitter.emit(Op::BrFalse(end))?;
        } else {
            self.emitter.emit(Op::BrTrue(end))?;
        }
        self.emitter.emit(Op::Pop)?;
        self.emit_value(right)?;
        self.emitter.mark(end)
    }

    /// Apply `op` to two unlifted operands of type `operand` on the stack.
    pub(super) fn emit_binary_operator(&mut self, op: BinaryOp, operand: &Type) -> Result<(), CompileError> {
        let ops: &[Op] = match op {
            BinaryOp::Add => &[Op::Add],
            BinaryOp::Subtract => &[Op::Sub],
            BinaryOp::Multiply => &[Op::Mul],
            BinaryOp::Divide => &[Op::Div],
            BinaryOp::Modulo => &[Op::Rem],
            BinaryOp::And => &[Op::And],
            BinaryOp::Or => &[Op::Or],
            BinaryOp::ExclusiveOr => &[Op::Xor],
            BinaryOp::Equal => &[Op::Ceq],
            BinaryOp::NotEqual => &[Op::Ceq, Op::Not],
            BinaryOp::LessThan => &[Op::Clt],
            BinaryOp::GreaterThan => &[Op::Cgt],
            // `!(a > b)` is wrong for NaN; the unordered compare keeps it false.
            BinaryOp::LessThanOrEqual if operand.is_floating() => &[Op::CgtUn, Op::Not],
            BinaryOp::LessThanOrEqual => &[Op::Cgt, Op::Not],
            BinaryOp::GreaterThanOrEqual if operand.is_floating() => &[Op::CltUn, Op::Not],
            BinaryOp::GreaterThanOrEqual => &[Op::Clt, Op::Not],
            BinaryOp::AndAlso | BinaryOp::OrElse | BinaryOp::Assign => {
                return Err(CompileError::contract(
                    "Binary",
                    format!("{op:?} has no primitive form"),
                ))
            }
        };
        self.emitter.emit_all(ops.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use exprc_runtime::{Metadata, Op, Type, Value};

    use crate::compiler::{lower_expression, EmitMode};
    use crate::tree::{BinaryOp, Expr, ParamVar};

    #[test]
    fn float_ordering_uses_unordered_compares() {
        let md = Metadata::with_prelude();
        let a = ParamVar::new(0, "a", Type::F64);
        let b = ParamVar::new(1, "b", Type::F64);
        let node = Expr::binary(
            BinaryOp::LessThanOrEqual,
            Expr::param(&a),
            Expr::param(&b),
            Type::Bool,
        );
        let lowered = lower_expression(&md, &[a, b], &node, EmitMode::VALUE).expect("lower");
        assert_eq!(
            lowered.code(),
            &[Op::LdArg(0), Op::LdArg(1), Op::CgtUn, Op::Not]
        );
    }

    #[test]
    fn comparing_a_nullable_with_null_tests_has_value() {
        let md = Metadata::with_prelude();
        let x = ParamVar::new(0, "x", Type::nullable(Type::I32));
        let node = Expr::binary(
            BinaryOp::Equal,
            Expr::param(&x),
            Expr::constant(Value::Null, Type::nullable(Type::I32)),
            Type::Bool,
        );
        let lowered = lower_expression(&md, &[x.clone()], &node, EmitMode::VALUE).expect("lower");
        assert_eq!(
            lowered.code(),
            &[
                Op::LdArgA(0),
                Op::HasValue(x.ty.clone()),
                Op::LdBool(false),
                Op::Ceq
            ]
        );
        assert_eq!(lowered.net_stack, 1);
    }
}
