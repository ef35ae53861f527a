//! Lexical label scopes and jump validation.
//!
//! Every emitted node may open a label block; gotos are validated against
//! the chain of blocks between the jump and the label definition. Blocks
//! live in an arena and are never removed, so a definition recorded in a
//! block that has already been popped can still be compared against later
//! references.

use std::collections::{HashMap, HashSet};

use exprc_runtime::{Label, LocalSlot, Op};

use super::emitter::Emitter;
use super::locals::LocalPool;
use crate::error::CompileError;
use crate::tree::{Expr, LabelId, LabelTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelScopeKind {
    Lambda,
    Block,
    Statement,
    Loop,
    Expression,
}

impl LabelScopeKind {
    fn can_jump_into(self) -> bool {
        !matches!(self, LabelScopeKind::Expression)
    }
}

#[derive(Debug)]
struct LabelBlock {
    kind: LabelScopeKind,
    parent: Option<usize>,
    labels: HashSet<LabelId>,
}

#[derive(Debug)]
pub(crate) struct LabelInfo {
    target: LabelTarget,
    can_return: bool,
    label: Option<Label>,
    value: Option<LocalSlot>,
    definitions: HashSet<usize>,
    references: Vec<usize>,
    across_block_jump: bool,
    /// Jumps lower to `Ret` instead of a branch.
    returns_directly: bool,
}

impl LabelInfo {
    fn new(target: &LabelTarget, can_return: bool) -> Self {
        Self {
            target: target.clone(),
            can_return,
            label: None,
            value: None,
            definitions: HashSet::new(),
            references: Vec::new(),
            across_block_jump: false,
            returns_directly: false,
        }
    }

    pub(crate) fn can_return(&self) -> bool {
        self.can_return
    }

    fn name(&self) -> String {
        self.target.name.clone()
    }
}

/// Handle to a label known to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LabelRef(usize);

#[derive(Debug)]
pub(crate) struct LabelTracker {
    blocks: Vec<LabelBlock>,
    current: usize,
    infos: Vec<LabelInfo>,
    by_id: HashMap<LabelId, usize>,
    depth: usize,
    max_depth: usize,
    pushes: usize,
    pops: usize,
}

impl LabelTracker {
    pub(crate) fn new() -> Self {
        Self {
            blocks: vec![LabelBlock {
                kind: LabelScopeKind::Lambda,
                parent: None,
                labels: HashSet::new(),
            }],
            current: 0,
            infos: Vec::new(),
            by_id: HashMap::new(),
            depth: 0,
            max_depth: 0,
            pushes: 0,
            pops: 0,
        }
    }

    pub(crate) fn pushes(&self) -> usize {
        self.pushes
    }

    pub(crate) fn pops(&self) -> usize {
        self.pops
    }

    pub(crate) fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub(crate) fn current_kind(&self) -> LabelScopeKind {
        self.blocks[self.current].kind
    }

    pub(crate) fn info(&self, label: LabelRef) -> &LabelInfo {
        &self.infos[label.0]
    }

    /// Open the label block `node` needs, if any.
    pub(crate) fn try_push(&mut self, node: &Expr) -> Result<bool, CompileError> {
        match node {
            Expr::Label { target, .. } => {
                if self.current_kind() == LabelScopeKind::Block
                    && self.blocks[self.current].labels.contains(&target.id)
                {
                    return Ok(false);
                }
                self.push(LabelScopeKind::Statement);
                Ok(true)
            }
            Expr::Block { expressions, .. } => {
                self.push(LabelScopeKind::Block);
                for expr in expressions {
                    if let Expr::Label { target, .. } = expr {
                        self.define(target)?;
                    }
                }
                Ok(true)
            }
            Expr::Conditional { .. } | Expr::Goto { .. } => {
                self.push(LabelScopeKind::Statement);
                Ok(true)
            }
            Expr::Loop { .. } => {
                self.push(LabelScopeKind::Loop);
                Ok(true)
            }
            _ if self.current_kind() != LabelScopeKind::Expression => {
                self.push(LabelScopeKind::Expression);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn push(&mut self, kind: LabelScopeKind) {
        self.blocks.push(LabelBlock {
            kind,
            parent: Some(self.current),
            labels: HashSet::new(),
        });
        self.current = self.blocks.len() - 1;
        self.pushes += 1;
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
    }

    pub(crate) fn pop(&mut self, kind: LabelScopeKind) -> Result<(), CompileError> {
        let block = &self.blocks[self.current];
        let parent = match block.parent {
            Some(parent) if block.kind == kind => parent,
            _ => {
                return Err(CompileError::contract(
                    "label",
                    format!("popped {kind:?} block while in {:?}", block.kind),
                ))
            }
        };
        self.current = parent;
        self.pops += 1;
        self.depth -= 1;
        Ok(())
    }

    /// Label in the current block, when the block defined it on entry.
    pub(crate) fn defined_in_current_block(&self, target: &LabelTarget) -> Option<LabelRef> {
        if self.current_kind() != LabelScopeKind::Block {
            return None;
        }
        if !self.blocks[self.current].labels.contains(&target.id) {
            return None;
        }
        self.by_id.get(&target.id).copied().map(LabelRef)
    }

    /// Register the label a lambda body ends with.
    pub(crate) fn add_return_label(&mut self, target: &LabelTarget, can_return: bool) {
        log::trace!("return label `{}` can_return={can_return}", target.name);
        self.by_id.insert(target.id, self.infos.len());
        self.infos.push(LabelInfo::new(target, can_return));
    }

    /// Whether jumps to `target` return from the function.
    pub(crate) fn is_return_label(&self, target: &LabelTarget) -> bool {
        self.by_id
            .get(&target.id)
            .is_some_and(|idx| self.infos[*idx].can_return)
    }

    fn ensure(&mut self, target: &LabelTarget) -> usize {
        if let Some(idx) = self.by_id.get(&target.id) {
            return *idx;
        }
        let idx = self.infos.len();
        self.infos.push(LabelInfo::new(target, false));
        self.by_id.insert(target.id, idx);
        idx
    }

    pub(crate) fn define(&mut self, target: &LabelTarget) -> Result<LabelRef, CompileError> {
        let idx = self.ensure(target);
        let mut scope = Some(self.current);
        while let Some(block) = scope {
            if self.blocks[block].labels.contains(&target.id) {
                return Err(CompileError::LabelAlreadyDefined(target.name.clone()));
            }
            scope = self.blocks[block].parent;
        }
        let block = self.current;
        self.infos[idx].definitions.insert(block);
        self.blocks[block].labels.insert(target.id);

        if self.infos[idx].definitions.len() == 1 {
            let references = self.infos[idx].references.clone();
            for reference in references {
                self.validate_jump(idx, reference)?;
            }
        } else {
            if self.infos[idx].across_block_jump {
                return Err(CompileError::AmbiguousJump(self.infos[idx].name()));
            }
            let info = &mut self.infos[idx];
            info.label = None;
            info.value = None;
        }
        Ok(LabelRef(idx))
    }

    pub(crate) fn reference(&mut self, target: &LabelTarget) -> Result<LabelRef, CompileError> {
        let idx = self.ensure(target);
        let block = self.current;
        self.infos[idx].references.push(block);
        if !self.infos[idx].definitions.is_empty() {
            self.validate_jump(idx, block)?;
        }
        Ok(LabelRef(idx))
    }

    fn ancestors(&self, block: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(block), |b| self.blocks[*b].parent)
    }

    fn validate_jump(&mut self, idx: usize, reference: usize) -> Result<(), CompileError> {
        let can_return = self.infos[idx].can_return;
        self.infos[idx].returns_directly = can_return;

        let outward = self
            .ancestors(reference)
            .any(|block| self.infos[idx].definitions.contains(&block));
        if outward {
            return Ok(());
        }

        let info = &mut self.infos[idx];
        info.across_block_jump = true;
        if !info.target.ty.is_void() {
            return Err(CompileError::NonLocalJumpWithValue(info.name()));
        }
        if info.definitions.len() > 1 {
            return Err(CompileError::AmbiguousJump(info.name()));
        }
        let Some(&definition) = info.definitions.iter().next() else {
            return Ok(());
        };
        let name = info.name();

        let reference_chain: HashSet<usize> = self.ancestors(reference).collect();
        for block in self.ancestors(definition) {
            if reference_chain.contains(&block) {
                break;
            }
            if !self.blocks[block].kind.can_jump_into() {
                return Err(CompileError::CannotEnterExpression(name));
            }
        }
        log::trace!("cross-block jump to `{name}` validated");
        Ok(())
    }

    /// Every referenced label must have been defined somewhere.
    pub(crate) fn validate_finish(&self) -> Result<(), CompileError> {
        for info in &self.infos {
            if !info.references.is_empty() && info.definitions.is_empty() {
                return Err(CompileError::LabelUndefined(info.name()));
            }
        }
        Ok(())
    }

    fn ensure_label(
        &mut self,
        label: LabelRef,
        emitter: &mut Emitter,
        locals: &mut LocalPool,
    ) -> Label {
        let info = &mut self.infos[label.0];
        if let Some(existing) = info.label {
            return existing;
        }
        let allocated = emitter.define_label();
        info.label = Some(allocated);
        if !info.target.ty.is_void() {
            info.value = Some(locals.declare(info.target.ty.clone(), &info.target.name));
        }
        allocated
    }

    fn store_value(
        &mut self,
        label: LabelRef,
        emitter: &mut Emitter,
        locals: &mut LocalPool,
    ) -> Result<Label, CompileError> {
        let allocated = self.ensure_label(label, emitter, locals);
        if let Some(slot) = self.infos[label.0].value {
            emitter.emit(Op::StLoc(slot))?;
        }
        Ok(allocated)
    }

    /// Jump to `label`, carrying the value on top of the stack for typed labels.
    pub(crate) fn emit_jump(
        &mut self,
        label: LabelRef,
        emitter: &mut Emitter,
        locals: &mut LocalPool,
    ) -> Result<(), CompileError> {
        if self.infos[label.0].returns_directly {
            return emitter.emit(Op::Ret);
        }
        let target = self.store_value(label, emitter, locals)?;
        emitter.emit(Op::Br(target))
    }

    /// Mark a label reached by fallthrough; a typed label takes the value on
    /// top of the stack.
    pub(crate) fn mark(
        &mut self,
        label: LabelRef,
        emitter: &mut Emitter,
        locals: &mut LocalPool,
    ) -> Result<(), CompileError> {
        if self.infos[label.0].can_return {
            if self.infos[label.0].label.is_none() {
                return Ok(());
            }
            emitter.emit(Op::Ret)?;
        } else {
            self.store_value(label, emitter, locals)?;
        }
        let depth = emitter.depth();
        self.mark_at(label, depth, emitter, locals)
    }

    /// Mark a label at `depth`, the stack height of the construct that owns
    /// it. Jumps from inside an operand leave extra values that the branch
    /// discards.
    pub(crate) fn mark_at(
        &mut self,
        label: LabelRef,
        depth: u32,
        emitter: &mut Emitter,
        locals: &mut LocalPool,
    ) -> Result<(), CompileError> {
        let allocated = self.ensure_label(label, emitter, locals);
        emitter.mark_at(allocated, depth)?;
        if let Some(slot) = self.infos[label.0].value {
            emitter.emit(Op::LdLoc(slot))?;
        }
        Ok(())
    }
}
