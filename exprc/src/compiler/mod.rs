//! Lowering of typed expression trees into stack-machine functions.
//!
//! One [`LambdaCompiler`] owns the state of one function being emitted: its
//! instruction buffer, local slots, constant table, variable scopes and
//! label blocks. Nested closures get their own compiler and function;
//! inlined lambdas are emitted into the invoking compiler.

mod address;
mod binary;
mod calls;
mod constants;
mod emitter;
mod expressions;
mod labels;
mod lift;
mod locals;
mod members;
mod scope;
mod statements;
mod type_check;

use std::cell::RefCell;

use exprc_runtime::{Function, Metadata, Op, Program};

use self::constants::BoundConstants;
use self::emitter::Emitter;
use self::labels::LabelTracker;
use self::locals::LocalPool;
use self::scope::{Analysis, LambdaKey, Scope};
use crate::error::CompileError;
use crate::tree::{Expr, LambdaExpr, ParamVar};

pub use self::labels::LabelScopeKind;

/// Whether emitting a node opens its label block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionStart {
    Pending,
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitAs {
    /// Push one value of the node's type.
    Declared,
    /// Leave the stack unchanged.
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailPosition {
    /// Nothing but a return follows the node.
    Tail,
    Middle,
    NoTail,
}

/// How a node is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitMode {
    pub start: ExpressionStart,
    pub as_type: EmitAs,
    pub tail: TailPosition,
}

impl EmitMode {
    pub const VALUE: EmitMode = EmitMode {
        start: ExpressionStart::Pending,
        as_type: EmitAs::Declared,
        tail: TailPosition::NoTail,
    };

    pub const VOID: EmitMode = EmitMode {
        start: ExpressionStart::Pending,
        as_type: EmitAs::Void,
        tail: TailPosition::NoTail,
    };

    pub fn with_start(self, start: ExpressionStart) -> Self {
        Self { start, ..self }
    }

    pub fn with_as(self, as_type: EmitAs) -> Self {
        Self { as_type, ..self }
    }

    pub fn with_tail(self, tail: TailPosition) -> Self {
        Self { tail, ..self }
    }

    pub fn is_void(self) -> bool {
        self.as_type == EmitAs::Void
    }

    pub fn is_tail(self) -> bool {
        self.tail == TailPosition::Tail
    }

    /// Mode handed to a kind emitter: only the tail position survives.
    fn inner(self) -> Self {
        EmitMode {
            start: ExpressionStart::Suppressed,
            as_type: EmitAs::Declared,
            tail: self.tail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TailCalls {
    /// Follow each lambda's `tail_call` flag.
    #[default]
    Declared,
    Always,
    Never,
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub tail_calls: TailCalls,
}

impl CompileOptions {
    fn body_tail(&self, lambda: &LambdaExpr) -> TailPosition {
        let tail = match self.tail_calls {
            TailCalls::Declared => lambda.tail_call,
            TailCalls::Always => true,
            TailCalls::Never => false,
        };
        if tail {
            TailPosition::Tail
        } else {
            TailPosition::NoTail
        }
    }
}

/// Functions of the program under construction, indexed by reservation.
#[derive(Default)]
struct ProgramBuilder {
    functions: RefCell<Vec<Option<Function>>>,
}

impl ProgramBuilder {
    fn reserve(&self) -> u32 {
        let mut functions = self.functions.borrow_mut();
        functions.push(None);
        (functions.len() - 1) as u32
    }

    fn install(&self, index: u32, function: Function) {
        if let Some(slot) = self.functions.borrow_mut().get_mut(index as usize) {
            *slot = Some(function);
        }
    }

    fn finish(self) -> Result<Vec<Function>, CompileError> {
        self.functions
            .into_inner()
            .into_iter()
            .enumerate()
            .map(|(idx, function)| {
                function.ok_or_else(|| {
                    CompileError::contract("program", format!("function {idx} was never emitted"))
                })
            })
            .collect()
    }
}

pub(crate) struct LambdaCompiler<'a> {
    md: &'a Metadata,
    analysis: &'a Analysis,
    options: &'a CompileOptions,
    builder: &'a ProgramBuilder,
    lambda: &'a LambdaExpr,
    /// Lambda whose labels are currently visible; differs from `lambda`
    /// while an inlined body is emitted.
    label_owner: LambdaKey,
    emitter: Emitter,
    locals: LocalPool,
    constants: BoundConstants,
    scope: Scope,
    labels: LabelTracker,
}

impl<'a> LambdaCompiler<'a> {
    fn new(
        md: &'a Metadata,
        analysis: &'a Analysis,
        options: &'a CompileOptions,
        builder: &'a ProgramBuilder,
        lambda: &'a LambdaExpr,
    ) -> Self {
        Self {
            md,
            analysis,
            options,
            builder,
            lambda,
            label_owner: LambdaKey::of(lambda),
            emitter: Emitter::new(!lambda.ret.is_void()),
            locals: LocalPool::new(),
            constants: BoundConstants::new(),
            scope: Scope::default(),
            labels: LabelTracker::new(),
        }
    }

    /// Compile `lambda` into a fresh function of `builder`, returning its index.
    fn compile(
        md: &'a Metadata,
        analysis: &'a Analysis,
        options: &'a CompileOptions,
        builder: &'a ProgramBuilder,
        lambda: &'a LambdaExpr,
    ) -> Result<u32, CompileError> {
        let index = builder.reserve();
        log::debug!("compiling `{}` as function {index}", lambda.display_name());
        let mut compiler = LambdaCompiler::new(md, analysis, options, builder, lambda);
        compiler.emit_lambda_body()?;
        let name = lambda
            .name
            .clone()
            .unwrap_or_else(|| format!("lambda{index}"));
        builder.install(index, compiler.finish(name)?);
        Ok(index)
    }

    fn emit_lambda_body(&mut self) -> Result<(), CompileError> {
        let lambda = self.lambda;
        self.enter_lambda_scope()?;
        self.add_return_label(lambda)?;
        let mode = EmitMode::VALUE.with_tail(self.options.body_tail(lambda));
        if lambda.ret.is_void() {
            self.emit_expression_as_void(&lambda.body, mode)?;
        } else {
            self.emit_expression(&lambda.body, mode)?;
        }
        self.emitter.emit(Op::Ret)?;
        self.exit_scope();
        self.labels.validate_finish()
    }

    fn finish(self, name: String) -> Result<Function, CompileError> {
        let (code, labels, max_stack) = self.emitter.finish()?;
        Ok(Function {
            name,
            params: self.lambda.params.iter().map(ParamVar::storage_type).collect(),
            ret: self.lambda.ret.clone(),
            locals: self.locals.into_types(),
            code,
            labels,
            constants: self.constants.into_values(),
            max_stack,
        })
    }
}

/// Compile a lambda and every closure nested in it.
pub fn compile_lambda(
    md: &Metadata,
    lambda: &LambdaExpr,
    options: &CompileOptions,
) -> Result<Program, CompileError> {
    let analysis = scope::analyze(lambda)?;
    let builder = ProgramBuilder::default();
    let entry = LambdaCompiler::compile(md, &analysis, options, &builder, lambda)?;
    Ok(Program {
        functions: builder.finish()?,
        entry: entry as usize,
    })
}

/// Result of lowering a single node outside of a lambda body.
#[derive(Debug)]
pub struct Lowered {
    /// Runnable program; the entry function has no trailing `Ret`.
    pub program: Program,
    /// Stack depth after the node relative to before it.
    pub net_stack: i64,
    pub label_pushes: usize,
    pub label_pops: usize,
    pub max_label_depth: usize,
}

impl Lowered {
    pub fn code(&self) -> &[Op] {
        &self.program.entry_function().code
    }
}

/// Lower one node in the given mode, with `params` bound as arguments.
pub fn lower_expression(
    md: &Metadata,
    params: &[ParamVar],
    node: &Expr,
    mode: EmitMode,
) -> Result<Lowered, CompileError> {
    let lambda = LambdaExpr {
        name: Some("expression".to_string()),
        params: params.to_vec(),
        body: Box::new(node.clone()),
        ret: if mode.is_void() { exprc_runtime::Type::Void } else { node.ty() },
        tail_call: false,
    };
    let analysis = scope::analyze(&lambda)?;
    let options = CompileOptions::default();
    let builder = ProgramBuilder::default();
    let index = builder.reserve();
    let mut compiler = LambdaCompiler::new(md, &analysis, &options, &builder, &lambda);
    compiler.enter_lambda_scope()?;
    if mode.is_void() {
        compiler.emit_expression_as_void(&lambda.body, mode)?;
    } else {
        compiler.emit_expression(&lambda.body, mode)?;
    }
    compiler.exit_scope();
    compiler.labels.validate_finish()?;
    let net_stack = i64::from(compiler.emitter.depth());
    let label_pushes = compiler.labels.pushes();
    let label_pops = compiler.labels.pops();
    let max_label_depth = compiler.labels.max_depth();
    let function = compiler.finish("expression".to_string())?;
    builder.install(index, function);
    Ok(Lowered {
        program: Program {
            functions: builder.finish()?,
            entry: index as usize,
        },
        net_stack,
        label_pushes,
        label_pops,
        max_label_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_updates_are_independent() {
        let mode = EmitMode::VALUE
            .with_tail(TailPosition::Tail)
            .with_as(EmitAs::Void)
            .with_start(ExpressionStart::Suppressed);
        assert!(mode.is_void());
        assert!(mode.is_tail());
        assert_eq!(mode.start, ExpressionStart::Suppressed);
        let inner = mode.inner();
        assert_eq!(inner.as_type, EmitAs::Declared);
        assert_eq!(inner.tail, TailPosition::Tail);
    }

    #[test]
    fn declared_tail_calls_follow_the_lambda() {
        let body = Expr::constant(1, exprc_runtime::Type::I32);
        let lambda = LambdaExpr::new("f", vec![], body, exprc_runtime::Type::I32).with_tail_call(true);
        let declared = CompileOptions::default();
        let never = CompileOptions {
            tail_calls: TailCalls::Never,
        };
        assert_eq!(declared.body_tail(&lambda), TailPosition::Tail);
        assert_eq!(never.body_tail(&lambda), TailPosition::NoTail);
    }
}
