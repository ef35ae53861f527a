//! Append-only instruction buffer with static stack accounting.
//!
//! Every op is checked against the evaluation-stack depth as it is appended,
//! so a tree that would underflow or reach a label at an inconsistent depth
//! is rejected at compile time instead of faulting in the machine.

use exprc_runtime::{Label, LabelPos, Op};

use crate::error::CompileError;

#[derive(Debug, Clone, Copy, Default)]
struct LabelState {
    pos: Option<LabelPos>,
    /// Shallowest depth any forward branch reached this label with.
    branch_depth: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct Emitter {
    code: Vec<Op>,
    labels: Vec<LabelState>,
    depth: u32,
    max_depth: u32,
    reachable: bool,
    returns_value: bool,
}

impl Emitter {
    pub(crate) fn new(returns_value: bool) -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            depth: 0,
            max_depth: 0,
            reachable: true,
            returns_value,
        }
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    #[cfg(test)]
    pub(crate) fn max_depth(&self) -> u32 {
        self.max_depth
    }

    #[cfg(test)]
    pub(crate) fn is_reachable(&self) -> bool {
        self.reachable
    }

    #[cfg(test)]
    pub(crate) fn code(&self) -> &[Op] {
        &self.code
    }

    pub(crate) fn define_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelState::default());
        label
    }

    pub(crate) fn emit(&mut self, op: Op) -> Result<(), CompileError> {
        let (pops, pushes) = op.stack_effect(self.returns_value);
        if self.depth < pops {
            return Err(CompileError::contract(
                "emit",
                format!("stack underflow at `{op}` (depth {})", self.depth),
            ));
        }
        self.depth = self.depth - pops + pushes;
        self.max_depth = self.max_depth.max(self.depth);
        if let Some(target) = op.branch_target() {
            self.record_branch(target)?;
        }
        if op.is_terminator() {
            self.reachable = false;
        }
        self.code.push(op);
        Ok(())
    }

    pub(crate) fn emit_all(&mut self, ops: impl IntoIterator<Item = Op>) -> Result<(), CompileError> {
        for op in ops {
            self.emit(op)?;
        }
        Ok(())
    }

    fn record_branch(&mut self, target: Label) -> Result<(), CompileError> {
        let depth = self.depth;
        let state = self.label_mut(target)?;
        match state.pos {
            Some(pos) if depth < pos.depth => Err(CompileError::contract(
                "branch",
                format!("jump to L{} with depth {depth} below label depth {}", target.0, pos.depth),
            )),
            Some(_) => Ok(()),
            None => {
                state.branch_depth = Some(state.branch_depth.map_or(depth, |d| d.min(depth)));
                Ok(())
            }
        }
    }

    /// Bind `label` to the next instruction. Without fallthrough the label
    /// takes the shallowest depth a forward branch reached it with.
    pub(crate) fn mark(&mut self, label: Label) -> Result<(), CompileError> {
        let depth = if self.reachable {
            self.depth
        } else {
            self.label_mut(label)?.branch_depth.unwrap_or(self.depth)
        };
        self.mark_at(label, depth)
    }

    /// Bind `label` to the next instruction at a depth fixed by the enclosing
    /// construct. Branches that arrive deeper are truncated by the machine.
    pub(crate) fn mark_at(&mut self, label: Label, depth: u32) -> Result<(), CompileError> {
        let offset = self.code.len();
        let reachable = self.reachable;
        let current = self.depth;
        let state = self.label_mut(label)?;
        if state.pos.is_some() {
            return Err(CompileError::contract("label", format!("L{} marked twice", label.0)));
        }
        if let Some(branch) = state.branch_depth {
            if branch < depth {
                return Err(CompileError::contract(
                    "label",
                    format!("L{} reached with depth {branch} and {depth}", label.0),
                ));
            }
        }
        if reachable && current != depth {
            return Err(CompileError::contract(
                "label",
                format!("L{} falls through with depth {current} instead of {depth}", label.0),
            ));
        }
        state.pos = Some(LabelPos { offset, depth });
        self.depth = depth;
        self.reachable = true;
        Ok(())
    }

    fn label_mut(&mut self, label: Label) -> Result<&mut LabelState, CompileError> {
        self.labels
            .get_mut(label.0 as usize)
            .ok_or_else(|| CompileError::contract("label", format!("L{} was never defined", label.0)))
    }

    /// Close the buffer; every defined label must have been marked.
    pub(crate) fn finish(self) -> Result<(Vec<Op>, Vec<LabelPos>, u32), CompileError> {
        let labels = self
            .labels
            .iter()
            .enumerate()
            .map(|(idx, state)| {
                state
                    .pos
                    .ok_or_else(|| CompileError::contract("label", format!("L{idx} was never marked")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((self.code, labels, self.max_depth))
    }
}
