//! Static evaluation of type tests.

use exprc_runtime::{Metadata, Op, Type};

use super::{EmitMode, LambdaCompiler};
use crate::error::CompileError;
use crate::tree::Expr;

/// What can be decided about `operand is T` before running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeIsResult {
    KnownFalse,
    KnownTrue,
    /// True exactly when the operand is not null.
    KnownAssignable,
    Unknown,
}

pub(crate) fn analyze_type_is(md: &Metadata, operand: &Type, test: &Type) -> TypeIsResult {
    if operand.is_void() || test.is_void() {
        return if operand == test {
            TypeIsResult::KnownTrue
        } else {
            TypeIsResult::KnownFalse
        };
    }
    if test.is_by_ref() {
        return TypeIsResult::KnownFalse;
    }
    let nn_operand = operand.non_nullable();
    let nn_test = test.non_nullable();
    if md.is_assignable_from(nn_test, nn_operand) {
        if operand.is_value_type() && !operand.is_nullable() {
            return TypeIsResult::KnownTrue;
        }
        return TypeIsResult::KnownAssignable;
    }
    if nn_operand.is_value_type() && nn_test.is_value_type() {
        return TypeIsResult::KnownFalse;
    }
    TypeIsResult::Unknown
}

impl<'a> LambdaCompiler<'a> {
    pub(super) fn emit_type_is(&mut self, expression: &Expr, test: &Type) -> Result<(), CompileError> {
        let operand = expression.ty();
        match analyze_type_is(self.md, &operand, test) {
            result @ (TypeIsResult::KnownTrue | TypeIsResult::KnownFalse) => {
                log::trace!("type test `{operand}` is `{test}` decided statically");
                self.emit_expression_as_void(expression, EmitMode::VOID)?;
                self.emitter.emit(Op::LdBool(result == TypeIsResult::KnownTrue))
            }
            TypeIsResult::KnownAssignable if operand.is_nullable() => {
                self.emit_address(expression, &operand)?;
                self.emitter.emit(Op::HasValue(operand))
            }
            TypeIsResult::KnownAssignable => {
                self.emit_value(expression)?;
                self.emitter.emit_all([Op::LdNull, Op::CgtUn])
            }
            TypeIsResult::Unknown => {
                self.emit_value(expression)?;
                if operand.is_value_type() {
                    self.emitter.emit(Op::Box(operand))?;
                }
                self.emitter
                    .emit_all([Op::IsInst(test.clone()), Op::LdNull, Op::CgtUn])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_types_decide_statically() {
        let md = Metadata::with_prelude();
        assert_eq!(analyze_type_is(&md, &Type::I32, &Type::I32), TypeIsResult::KnownTrue);
        assert_eq!(analyze_type_is(&md, &Type::I32, &Type::Object), TypeIsResult::KnownTrue);
        assert_eq!(analyze_type_is(&md, &Type::I32, &Type::F64), TypeIsResult::KnownFalse);
        assert_eq!(analyze_type_is(&md, &Type::Void, &Type::I32), TypeIsResult::KnownFalse);
    }

    #[test]
    fn nullable_and_reference_operands_need_a_null_check() {
        let md = Metadata::with_prelude();
        let int_opt = Type::nullable(Type::I32);
        assert_eq!(analyze_type_is(&md, &int_opt, &Type::I32), TypeIsResult::KnownAssignable);
        let circle = Type::Class("Circle".into());
        let shape = Type::Class("Shape".into());
        assert_eq!(analyze_type_is(&md, &circle, &shape), TypeIsResult::KnownAssignable);
        assert_eq!(analyze_type_is(&md, &shape, &circle), TypeIsResult::Unknown);
        assert_eq!(analyze_type_is(&md, &Type::Object, &Type::I32), TypeIsResult::Unknown);
    }
}
