//! Control flow: blocks, labels, gotos, conditionals and loops.

use exprc_runtime::{Label, Op, Type};

use super::{EmitMode, LambdaCompiler, TailPosition};
use crate::error::CompileError;
use crate::tree::{Expr, LambdaExpr, UnaryOp};

impl<'a> LambdaCompiler<'a> {
    /// Register the label a lambda body ends with, so that jumps to it can
    /// return directly.
    pub(super) fn add_return_label(&mut self, lambda: &LambdaExpr) -> Result<(), CompileError> {
        let mut node: &Expr = &lambda.body;
        loop {
            match node {
                Expr::Label { target, .. } => {
                    let can_return = self.md.is_reference_assignable(&lambda.ret, &target.ty);
                    self.labels.add_return_label(target, can_return);
                    return Ok(());
                }
                Expr::Block { expressions, .. } => {
                    let Some(last) = expressions
                        .iter()
                        .rev()
                        .find(|expr| significant(expr))
                        .or_else(|| expressions.first())
                    else {
                        return Ok(());
                    };
                    node = last;
                }
                _ => return Ok(()),
            }
        }
    }

    pub(super) fn emit_block(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let Expr::Block {
            variables,
            expressions,
            ty,
        } = node
        else {
            return Err(CompileError::contract("Block", "expected a block node"));
        };
        self.enter_block_scope(variables)?;
        let result = self.emit_block_body(expressions, ty, mode);
        self.exit_scope();
        result
    }

    fn emit_block_body(&mut self, expressions: &[Expr], ty: &Type, mode: EmitMode) -> Result<(), CompileError> {
        let Some((last, rest)) = expressions.split_last() else {
            if !mode.is_void() {
                self.emit_default(ty)?;
            }
            return Ok(());
        };
        for (idx, expr) in rest.iter().enumerate() {
            let tail = match mode.tail {
                TailPosition::NoTail => TailPosition::NoTail,
                _ if self.is_plain_return(&expressions[idx + 1]) => TailPosition::Tail,
                _ => TailPosition::Middle,
            };
            self.emit_expression_as_void(expr, EmitMode::VOID.with_tail(tail))?;
        }
        if mode.is_void() || ty.is_void() {
            self.emit_expression_as_void(last, EmitMode::VOID.with_tail(mode.tail))
        } else {
            self.emit_expression_as_type(last, ty, EmitMode::VALUE.with_tail(mode.tail))
        }
    }

    /// A value-less goto that returns from the function.
    fn is_plain_return(&self, node: &Expr) -> bool {
        match node {
            Expr::Goto { target, value, .. } => {
                value.as_deref().map_or(true, |value| !significant(value))
                    && self.labels.is_return_label(target)
            }
            _ => false,
        }
    }

    pub(super) fn emit_goto(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let Expr::Goto {
            target, value, ty, ..
        } = node
        else {
            return Err(CompileError::contract("Goto", "expected a goto node"));
        };
        if let Some(owner) = self.analysis.label_owner(target.id) {
            if owner != self.label_owner {
                return Err(CompileError::CannotLeaveLambda(target.name.clone()));
            }
        }
        let label = self.labels.reference(target)?;
        let tail = match mode.tail {
            TailPosition::NoTail => TailPosition::NoTail,
            _ if self.labels.info(label).can_return() => TailPosition::Tail,
            _ => TailPosition::NoTail,
        };
        let value_mode = EmitMode::VALUE.with_tail(tail);
        match value.as_deref() {
            Some(value) if target.ty.is_void() => self.emit_expression_as_void(value, value_mode)?,
            Some(value) => self.emit_expression(value, value_mode)?,
            None if target.ty.is_void() => {}
            None => {
                return Err(CompileError::contract(
                    "Goto",
                    format!("jump to `{}` of type `{}` carries no value", target.name, target.ty),
                ))
            }
        }
        self.labels.emit_jump(label, &mut self.emitter, &mut self.locals)?;
        self.emit_unreachable(ty, mode.as_type)
    }

    pub(super) fn emit_label(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let Expr::Label { target, default } = node else {
            return Err(CompileError::contract("Label", "expected a label node"));
        };
        let label = match self.labels.defined_in_current_block(target) {
            Some(label) => label,
            None => self.labels.define(target)?,
        };
        let value_mode = EmitMode::VALUE.with_tail(mode.tail);
        match default.as_deref() {
            Some(default) if target.ty.is_void() => self.emit_expression_as_void(default, value_mode)?,
            Some(default) => self.emit_expression(default, value_mode)?,
            None => self.emit_default(&target.ty)?,
        }
        self.labels.mark(label, &mut self.emitter, &mut self.locals)
    }

    pub(super) fn emit_conditional(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let Expr::Conditional {
            test,
            if_true,
            if_false,
            ty,
        } = node
        else {
            return Err(CompileError::contract("Conditional", "expected a conditional node"));
        };
        let if_not = self.emitter.define_label();
        self.emit_expression_and_branch(false, test, if_not)?;
        self.emit_expression_as_type(if_true, ty, mode)?;

        if if_false.is_empty() {
            return self.emitter.mark(if_not);
        }
        let end = self.emitter.define_label();
        if mode.is_tail() {
            self.emitter.emit(Op::Ret)?;
        } else {
            self.emitter.emit(Op::Br(end))?;
        }
        self.emitter.mark(if_not)?;
        self.emit_expression_as_type(if_false, ty, mode)?;
        self.emitter.mark(end)
    }

    /// Evaluate a boolean test and branch to `label` when it equals
    /// `branch_value`. Negations flip the branch instead of emitting `Not`.
    fn emit_expression_and_branch(&mut self, branch_value: bool, test: &Expr, label: Label) -> Result<(), CompileError> {
        match test {
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
                method: None,
                ty: Type::Bool,
            } => {
                let started = self.emit_start(test)?;
                self.emit_expression_and_branch(!branch_value, operand, label)?;
                self.emit_end(started)
            }
            _ => {
                self.emit_value(test)?;
                self.emitter
                    .emit(if branch_value { Op::BrTrue(label) } else { Op::BrFalse(label) })
            }
        }
    }

    pub(super) fn emit_loop(&mut self, node: &Expr) -> Result<(), CompileError> {
        let Expr::Loop {
            body,
            break_label,
            continue_label,
        } = node
        else {
            return Err(CompileError::contract("Loop", "expected a loop node"));
        };
        let break_label = break_label.as_ref().map(|target| self.labels.define(target)).transpose()?;
        let continue_label = match continue_label {
            Some(target) if !target.ty.is_void() => {
                return Err(CompileError::contract(
                    "Loop",
                    format!("continue label `{}` must be void", target.name),
                ))
            }
            Some(target) => Some(self.labels.define(target)?),
            None => None,
        };

        let base = self.emitter.depth();
        let start = match continue_label {
            Some(label) => {
                self.labels.mark_at(label, base, &mut self.emitter, &mut self.locals)?;
                None
            }
            None => {
                let start = self.emitter.define_label();
                self.emitter.mark_at(start, base)?;
                Some(start)
            }
        };
        self.emit_expression_as_void(body, EmitMode::VOID)?;
        match (continue_label, start) {
            (Some(label), _) => self.labels.emit_jump(label, &mut self.emitter, &mut self.locals)?,
            (None, Some(start)) => self.emitter.emit(Op::Br(start))?,
            (None, None) => return Err(CompileError::contract("Loop", "loop has no start")),
        }

        match break_label {
            Some(label) => self.labels.mark_at(label, base, &mut self.emitter, &mut self.locals),
            None => {
                let exit = self.emitter.define_label();
                self.emitter.mark_at(exit, base)
            }
        }
    }
}

/// Whether emitting `node` can have any effect.
fn significant(node: &Expr) -> bool {
    match node {
        Expr::Block { expressions, .. } => expressions.iter().any(significant),
        Expr::DebugInfo => false,
        other => !other.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blocks_and_debug_info_are_insignificant() {
        assert!(!significant(&Expr::DebugInfo));
        assert!(!significant(&Expr::default_of(Type::Void)));
        assert!(!significant(&Expr::block(vec![], vec![Expr::DebugInfo])));
        assert!(significant(&Expr::default_of(Type::I32)));
        assert!(significant(&Expr::block(
            vec![],
            vec![Expr::DebugInfo, Expr::constant(1, Type::I32)]
        )));
    }
}
