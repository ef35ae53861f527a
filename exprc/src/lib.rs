pub mod compiler;
pub mod error;
pub mod tree;

pub use compiler::{
    compile_lambda, lower_expression, CompileOptions, EmitAs, EmitMode, ExpressionStart,
    LabelScopeKind, Lowered, TailCalls, TailPosition,
};
pub use error::CompileError;
pub use tree::{Expr, LabelTarget, LambdaExpr, ParamVar};
