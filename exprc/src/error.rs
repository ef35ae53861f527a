use miette::Diagnostic;
use thiserror::Error;

/// Prefix an error message with context for consistent diagnostics.
pub fn format_with_context(context: impl AsRef<str>, message: impl AsRef<str>) -> String {
    let prefix = context.as_ref();
    let message = message.as_ref();
    if prefix.is_empty() {
        message.to_string()
    } else {
        format!("{prefix}: {message}")
    }
}

/// Failure to lower a lambda. Lowering is all-or-nothing: the first error
/// aborts compilation of the whole tree.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    /// The input tree breaks an invariant its builder should have enforced.
    #[error("malformed expression tree: {0}")]
    #[diagnostic(code(exprc::contract))]
    Contract(String),
    #[error("unsupported {0}")]
    #[diagnostic(code(exprc::unsupported))]
    Unsupported(String),
    #[error("unknown method `{0}`")]
    #[diagnostic(code(exprc::unknown_member))]
    UnknownMethod(String),
    #[error("unknown field `{0}`")]
    #[diagnostic(code(exprc::unknown_member))]
    UnknownField(String),
    #[error("unknown property `{0}`")]
    #[diagnostic(code(exprc::unknown_member))]
    UnknownProperty(String),
    #[error("unknown constructor `{0}`")]
    #[diagnostic(code(exprc::unknown_member))]
    UnknownConstructor(String),
    #[error("`{member}` expects {expected} arguments, found {found}")]
    #[diagnostic(code(exprc::argument_count))]
    ArgumentCountMismatch {
        member: String,
        expected: usize,
        found: usize,
    },
    #[error("cannot construct abstract type `{0}`")]
    #[diagnostic(code(exprc::abstract_construction))]
    NonAbstractConstructorRequired(String),
    #[error("accessor `{0}` cannot use a variable argument list")]
    #[diagnostic(code(exprc::var_args))]
    UnexpectedVarArgsCall(String),
    #[error("cannot initialize members of value type `{ty}` through property `{property}`")]
    #[diagnostic(code(exprc::value_type_binding))]
    CannotAutoInitializeValueTypeMemberThroughProperty { ty: String, property: String },
    #[error("cannot initialize elements of value type `{ty}` through property `{property}`")]
    #[diagnostic(code(exprc::value_type_binding))]
    CannotAutoInitializeValueTypeElementThroughProperty { ty: String, property: String },
    #[error("label `{0}` is already defined in an enclosing block")]
    #[diagnostic(code(exprc::label))]
    LabelAlreadyDefined(String),
    #[error("reference to undefined label `{0}`")]
    #[diagnostic(code(exprc::label))]
    LabelUndefined(String),
    #[error("jump to label `{0}` is ambiguous")]
    #[diagnostic(code(exprc::label))]
    AmbiguousJump(String),
    #[error("jump to label `{0}` carries a value but leaves the label's block")]
    #[diagnostic(code(exprc::label))]
    NonLocalJumpWithValue(String),
    #[error("control cannot enter an expression to reach label `{0}`")]
    #[diagnostic(code(exprc::label))]
    CannotEnterExpression(String),
    #[error("control cannot leave the lambda to reach label `{0}`")]
    #[diagnostic(code(exprc::label))]
    CannotLeaveLambda(String),
}

impl CompileError {
    pub fn contract(context: impl AsRef<str>, message: impl AsRef<str>) -> Self {
        CompileError::Contract(format_with_context(context, message))
    }

    pub fn unsupported(context: impl AsRef<str>, message: impl AsRef<str>) -> Self {
        CompileError::Unsupported(format_with_context(context, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefixes_message() {
        assert_eq!(format_with_context("", "boom"), "boom");
        assert_eq!(format_with_context("Index", "boom"), "Index: boom");
        let err = CompileError::contract("Assign", "left side is not assignable");
        assert_eq!(
            err.to_string(),
            "malformed expression tree: Assign: left side is not assignable"
        );
    }
}
