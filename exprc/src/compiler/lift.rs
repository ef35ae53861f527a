//! Lifting of operators over nullable operands.
//!
//! Every operand is evaluated exactly once into a temporary holding its
//! underlying value, with null-ness tracked in boolean locals. The core
//! operation then runs on the temporaries, or a null path supplies the
//! result without running it.

use exprc_runtime::{LocalSlot, MethodId, Op, Type};

use super::LambdaCompiler;
use crate::error::CompileError;
use crate::tree::{BinaryOp, Expr, UnaryOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LiftFamily {
    /// Any null operand makes the result null (or `false` for boolean results).
    Propagate,
    /// Lifted `==`/`!=`: two nulls compare equal, one null compares unequal.
    Equality { equal: bool },
}

/// Operation applied to the unwrapped operands.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LiftCore {
    Method(MethodId),
    Binary { op: BinaryOp, operand: Type },
    Unary { op: UnaryOp, operand: Type },
    Convert { from: Type, to: Type, checked: bool },
}

impl LiftCore {
    fn raw_type(&self, compiler: &LambdaCompiler<'_>) -> Type {
        match self {
            LiftCore::Method(method) => compiler.md.method_def(*method).ret.clone(),
            LiftCore::Binary { op, .. } if op.is_comparison() => Type::Bool,
            LiftCore::Binary { operand, .. } | LiftCore::Unary { operand, .. } => operand.clone(),
            LiftCore::Convert { to, .. } => to.clone(),
        }
    }
}

impl<'a> LambdaCompiler<'a> {
    pub(super) fn emit_lift(
        &mut self,
        family: LiftFamily,
        result: &Type,
        core: LiftCore,
        operands: &[&Expr],
    ) -> Result<(), CompileError> {
        log::trace!("lifting {core:?} to `{result}` over {} operands", operands.len());
        if !operands.iter().any(|operand| may_be_null(&operand.ty())) {
            for operand in operands {
                self.emit_value(operand)?;
            }
            return self.emit_lifted_value(&core, result);
        }
        let any_null = self.locals.get_local(&Type::Bool);
        let all_null = match family {
            LiftFamily::Propagate => None,
            LiftFamily::Equality { .. } => Some(self.locals.get_local(&Type::Bool)),
        };
        if let Some(all_null) = all_null {
            self.emitter.emit_all([
                Op::LdBool(false),
                Op::StLoc(any_null),
                Op::LdBool(true),
                Op::StLoc(all_null),
            ])?;
        }

        let exit = self.emitter.define_label();
        let exit_null = self.emitter.define_label();

        let mut temps = Vec::with_capacity(operands.len());
        for operand in operands {
            let ty = operand.ty();
            let temp = self.locals.get_local(ty.non_nullable());
            if ty.is_nullable() {
                self.emit_address(operand, &ty)?;
                self.emitter
                    .emit_all([Op::Dup, Op::HasValue(ty.clone()), Op::LdBool(false), Op::Ceq])?;
                self.record_null(any_null, all_null)?;
                self.emitter.emit(Op::GetValueOrDefault(ty.clone()))?;
            } else {
                self.emit_value(operand)?;
                if !ty.is_value_type() {
                    self.emitter.emit_all([Op::Dup, Op::LdNull, Op::Ceq])?;
                    self.record_null(any_null, all_null)?;
                } else if let Some(all_null) = all_null {
                    self.emitter.emit_all([Op::LdBool(false), Op::StLoc(all_null)])?;
                }
            }
            self.emitter.emit(Op::StLoc(temp))?;
            if family == LiftFamily::Propagate && may_be_null(&ty) {
                self.emitter.emit_all([Op::LdLoc(any_null), Op::BrTrue(exit_null)])?;
            }
            temps.push(temp);
        }
        let exit_all_null = match all_null {
            Some(all_null) => {
                let label = self.emitter.define_label();
                self.emitter.emit_all([
                    Op::LdLoc(all_null),
                    Op::BrTrue(label),
                    Op::LdLoc(any_null),
                    Op::BrTrue(exit_null),
                ])?;
                Some(label)
            }
            None => None,
        };

        for temp in &temps {
            self.emitter.emit(Op::LdLoc(*temp))?;
        }
        self.emit_lifted_value(&core, result)?;
        self.emitter.emit(Op::Br(exit))?;

        self.emitter.mark(exit_null)?;
        match (family, exit_all_null) {
            (LiftFamily::Equality { equal }, Some(exit_all_null)) => {
                self.emitter.emit_all([Op::LdBool(!equal), Op::Br(exit)])?;
                self.emitter.mark(exit_all_null)?;
                self.emitter.emit(Op::LdBool(equal))?;
            }
            _ => self.emit_null_result(result)?,
        }
        self.emitter.mark(exit)?;

        for temp in temps {
            self.locals.free_local(temp)?;
        }
        if let Some(all_null) = all_null {
            self.locals.free_local(all_null)?;
        }
        self.locals.free_local(any_null)
    }

    /// Fold the `is null` flag on top of the stack into the tracking locals.
    fn record_null(&mut self, any_null: LocalSlot, all_null: Option<LocalSlot>) -> Result<(), CompileError> {
        match all_null {
            Some(all_null) => self.emitter.emit_all([
                Op::Dup,
                Op::LdLoc(any_null),
                Op::Or,
                Op::StLoc(any_null),
                Op::LdLoc(all_null),
                Op::And,
                Op::StLoc(all_null),
            ]),
            None => self.emitter.emit(Op::StLoc(any_null)),
        }
    }

    /// Apply `core` to the unwrapped operands on the stack and wrap the
    /// result when the lifted type is nullable.
    fn emit_lifted_value(&mut self, core: &LiftCore, result: &Type) -> Result<(), CompileError> {
        let raw = core.raw_type(self);
        match core {
            LiftCore::Method(method) => self.emit_call_site(*method, None, false, None),
            LiftCore::Binary { op, operand } => self.emit_binary_operator(*op, operand),
            LiftCore::Unary { op, operand } => self.emit_unary_operator(*op, operand),
            LiftCore::Convert { from, to, checked } => self.emit_convert_to_type(from, to, *checked),
        }?;
        if result.is_nullable() && *result != raw {
            self.emitter.emit(Op::NewNullable(result.clone()))?;
        }
        Ok(())
    }

    fn emit_null_result(&mut self, result: &Type) -> Result<(), CompileError> {
        if result.is_nullable() || !result.is_value_type() {
            self.emitter.emit(Op::LdNull)
        } else if matches!(result, Type::Bool) {
            self.emitter.emit(Op::LdBool(false))
        } else {
            Err(CompileError::contract(
                "lift",
                format!("lifted result `{result}` has no null form"),
            ))
        }
    }
}

fn may_be_null(ty: &Type) -> bool {
    ty.is_nullable() || !ty.is_value_type()
}
