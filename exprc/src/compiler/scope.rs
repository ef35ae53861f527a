//! Variable binding and storage.
//!
//! A pre-pass over the whole lambda decides which variables must live in
//! heap cells: those read or written by a nested closure and those exposed
//! through a `RuntimeVariables` node. Every other variable stays in an
//! argument or a local slot of the function that declares it. Inlined
//! lambdas bind their parameters in the invoking function.

use std::collections::{HashMap, HashSet};

use exprc_runtime::{LocalSlot, Op, Type};

use super::LambdaCompiler;
use crate::error::CompileError;
use crate::tree::{Expr, LabelId, LambdaExpr, ParamVar, VarId};

/// Identity of a lambda node within the tree being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LambdaKey(usize);

impl LambdaKey {
    pub(crate) fn of(lambda: &LambdaExpr) -> Self {
        Self(lambda as *const LambdaExpr as usize)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Analysis {
    hoisted: HashSet<VarId>,
    captures: HashMap<LambdaKey, Vec<ParamVar>>,
    label_owners: HashMap<LabelId, LambdaKey>,
}

impl Analysis {
    pub(crate) fn is_hoisted(&self, var: VarId) -> bool {
        self.hoisted.contains(&var)
    }

    /// Variables a compiled lambda reads from its closure, in capture order.
    pub(crate) fn captures(&self, lambda: &LambdaExpr) -> &[ParamVar] {
        self.captures
            .get(&LambdaKey::of(lambda))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Lambda (compiled or inlined) whose body defines the label.
    pub(crate) fn label_owner(&self, label: LabelId) -> Option<LambdaKey> {
        self.label_owners.get(&label).copied()
    }
}

struct BinderScope {
    function: usize,
    vars: HashSet<VarId>,
}

struct FunctionFrame {
    key: LambdaKey,
    captures: Vec<ParamVar>,
}

#[derive(Default)]
struct Binder {
    analysis: Analysis,
    scopes: Vec<BinderScope>,
    functions: Vec<FunctionFrame>,
    owners: Vec<LambdaKey>,
}

pub(crate) fn analyze(root: &LambdaExpr) -> Result<Analysis, CompileError> {
    let mut binder = Binder::default();
    binder.visit_function(root)?;
    Ok(binder.analysis)
}

impl Binder {
    fn visit_function(&mut self, lambda: &LambdaExpr) -> Result<(), CompileError> {
        let key = LambdaKey::of(lambda);
        self.functions.push(FunctionFrame {
            key,
            captures: Vec::new(),
        });
        self.owners.push(key);
        self.push_scope(&lambda.params);
        self.visit(&lambda.body)?;
        self.scopes.pop();
        self.owners.pop();
        if let Some(frame) = self.functions.pop() {
            self.analysis.captures.insert(frame.key, frame.captures);
        }
        Ok(())
    }

    fn push_scope(&mut self, vars: &[ParamVar]) {
        self.scopes.push(BinderScope {
            function: self.functions.len() - 1,
            vars: vars.iter().map(|var| var.id).collect(),
        });
    }

    fn owner(&self) -> Option<LambdaKey> {
        self.owners.last().copied()
    }

    fn define_label(&mut self, label: LabelId) {
        if let Some(owner) = self.owner() {
            self.analysis.label_owners.insert(label, owner);
        }
    }

    fn resolve(&mut self, var: &ParamVar) -> Result<(), CompileError> {
        let Some(scope) = self.scopes.iter().rev().find(|scope| scope.vars.contains(&var.id)) else {
            return Err(CompileError::contract(
                "Parameter",
                format!("variable `{}` is not in scope", var.name),
            ));
        };
        let defining = scope.function;
        let current = self.functions.len() - 1;
        if defining == current {
            return Ok(());
        }
        self.analysis.hoisted.insert(var.id);
        for frame in &mut self.functions[defining + 1..] {
            if !frame.captures.iter().any(|known| known.id == var.id) {
                frame.captures.push(var.clone());
            }
        }
        Ok(())
    }

    fn visit(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Parameter(var) => self.resolve(var),
            Expr::RuntimeVariables { variables } => {
                for var in variables {
                    self.resolve(var)?;
                    self.analysis.hoisted.insert(var.id);
                }
                Ok(())
            }
            Expr::Lambda(lambda) => self.visit_function(lambda),
            Expr::Invoke {
                target, arguments, ..
            } => {
                for arg in arguments {
                    self.visit(arg)?;
                }
                match target.as_ref() {
                    Expr::Lambda(lambda) => {
                        self.owners.push(LambdaKey::of(lambda));
                        self.push_scope(&lambda.params);
                        self.visit(&lambda.body)?;
                        self.scopes.pop();
                        self.owners.pop();
                        Ok(())
                    }
                    other => self.visit(other),
                }
            }
            Expr::Block {
                variables,
                expressions,
                ..
            } => {
                self.push_scope(variables);
                for expr in expressions {
                    self.visit(expr)?;
                }
                self.scopes.pop();
                Ok(())
            }
            Expr::Label { target, default } => {
                self.define_label(target.id);
                match default {
                    Some(default) => self.visit(default),
                    None => Ok(()),
                }
            }
            Expr::Loop {
                body,
                break_label,
                continue_label,
            } => {
                for label in [break_label, continue_label].into_iter().flatten() {
                    self.define_label(label.id);
                }
                self.visit(body)
            }
            other => {
                for child in other.children() {
                    self.visit(child)?;
                }
                Ok(())
            }
        }
    }
}

/// Where a variable lives in the function being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Storage {
    Argument(u16),
    Local(LocalSlot),
    /// Local slot holding the variable's cell.
    Cell(LocalSlot),
    /// Closure capture holding the variable's cell.
    Captured(u16),
}

/// Nested variable scopes of one function.
#[derive(Debug, Default)]
pub(crate) struct Scope {
    frames: Vec<HashMap<VarId, Storage>>,
}

impl Scope {
    pub(crate) fn enter(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub(crate) fn exit(&mut self) {
        self.frames.pop();
    }

    pub(crate) fn bind(&mut self, var: VarId, storage: Storage) {
        if self.frames.is_empty() {
            self.enter();
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(var, storage);
        }
    }

    pub(crate) fn lookup(&self, var: &ParamVar) -> Result<Storage, CompileError> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(&var.id).copied())
            .ok_or_else(|| {
                CompileError::contract(
                    "Parameter",
                    format!("variable `{}` is not bound in this function", var.name),
                )
            })
    }
}

impl<'a> LambdaCompiler<'a> {
    /// Bind the compiled lambda's parameters and captures.
    pub(super) fn enter_lambda_scope(&mut self) -> Result<(), CompileError> {
        self.scope.enter();
        for (idx, var) in self.analysis.captures(self.lambda).iter().enumerate() {
            self.scope.bind(var.id, Storage::Captured(idx as u16));
        }
        for (idx, var) in self.lambda.params.iter().enumerate() {
            let idx = u16::try_from(idx)
                .map_err(|_| CompileError::unsupported("lambda", "more than 65535 parameters"))?;
            if self.analysis.is_hoisted(var.id) {
                self.check_hoistable(var)?;
                let cell = self.locals.declare(Type::Object, &var.name);
                self.emitter.emit_all([Op::LdArg(idx), Op::MakeCell, Op::StLoc(cell)])?;
                self.scope.bind(var.id, Storage::Cell(cell));
            } else {
                self.scope.bind(var.id, Storage::Argument(idx));
            }
        }
        Ok(())
    }

    /// Open a block scope declaring `variables`.
    pub(super) fn enter_block_scope(&mut self, variables: &[ParamVar]) -> Result<(), CompileError> {
        self.scope.enter();
        for var in variables {
            if var.by_ref {
                return Err(CompileError::unsupported(
                    "Block",
                    format!("by-reference block variable `{}`", var.name),
                ));
            }
            if self.analysis.is_hoisted(var.id) {
                let cell = self.locals.declare(Type::Object, &var.name);
                self.emit_default(&var.ty)?;
                self.emitter.emit_all([Op::MakeCell, Op::StLoc(cell)])?;
                self.scope.bind(var.id, Storage::Cell(cell));
            } else {
                let slot = self.locals.declare(var.ty.clone(), &var.name);
                self.scope.bind(var.id, Storage::Local(slot));
            }
        }
        Ok(())
    }

    /// Bind the parameters of an inlined lambda, consuming the argument
    /// values from the stack (last argument on top).
    pub(super) fn enter_inlined_scope(&mut self, params: &[ParamVar]) -> Result<(), CompileError> {
        self.scope.enter();
        for var in params.iter().rev() {
            let hoisted = self.analysis.is_hoisted(var.id);
            if hoisted {
                self.check_hoistable(var)?;
            }
            let slot = self.locals.declare(
                if hoisted { Type::Object } else { var.storage_type() },
                &var.name,
            );
            if hoisted {
                self.emitter.emit(Op::MakeCell)?;
                self.scope.bind(var.id, Storage::Cell(slot));
            } else {
                self.scope.bind(var.id, Storage::Local(slot));
            }
            self.emitter.emit(Op::StLoc(slot))?;
        }
        Ok(())
    }

    pub(super) fn exit_scope(&mut self) {
        self.scope.exit();
    }

    fn check_hoistable(&self, var: &ParamVar) -> Result<(), CompileError> {
        if var.by_ref {
            return Err(CompileError::unsupported(
                "closure",
                format!("capturing by-reference variable `{}`", var.name),
            ));
        }
        Ok(())
    }

    /// Push the variable's storage content: its value, or the address a
    /// by-reference variable holds.
    fn emit_raw_load(&mut self, storage: Storage) -> Result<(), CompileError> {
        match storage {
            Storage::Argument(idx) => self.emitter.emit(Op::LdArg(idx)),
            Storage::Local(slot) => self.emitter.emit(Op::LdLoc(slot)),
            Storage::Cell(slot) => self.emitter.emit_all([Op::LdLoc(slot), Op::LdCell]),
            Storage::Captured(idx) => self.emitter.emit_all([Op::LdCapture(idx), Op::LdCell]),
        }
    }

    pub(super) fn emit_load_var(&mut self, var: &ParamVar) -> Result<(), CompileError> {
        let storage = self.scope.lookup(var)?;
        self.emit_raw_load(storage)?;
        if var.by_ref {
            self.emitter.emit(Op::LdInd(var.ty.clone()))?;
        }
        Ok(())
    }

    pub(super) fn emit_var_address(&mut self, var: &ParamVar) -> Result<(), CompileError> {
        let storage = self.scope.lookup(var)?;
        if var.by_ref {
            return self.emit_raw_load(storage);
        }
        match storage {
            Storage::Argument(idx) => self.emitter.emit(Op::LdArgA(idx)),
            Storage::Local(slot) => self.emitter.emit(Op::LdLocA(slot)),
            Storage::Cell(slot) => self.emitter.emit_all([Op::LdLoc(slot), Op::LdCellA]),
            Storage::Captured(idx) => self.emitter.emit_all([Op::LdCapture(idx), Op::LdCellA]),
        }
    }

    /// Store the value on top of the stack into `var`.
    pub(super) fn emit_store_var(&mut self, var: &ParamVar) -> Result<(), CompileError> {
        let storage = self.scope.lookup(var)?;
        if var.by_ref {
            let temp = self.locals.get_local(&var.ty);
            self.emitter.emit(Op::StLoc(temp))?;
            self.emit_raw_load(storage)?;
            self.emitter.emit_all([Op::LdLoc(temp), Op::StInd(var.ty.clone())])?;
            return self.locals.free_local(temp);
        }
        match storage {
            Storage::Argument(idx) => self.emitter.emit(Op::StArg(idx)),
            Storage::Local(slot) => self.emitter.emit(Op::StLoc(slot)),
            Storage::Cell(slot) => self.emitter.emit_all([Op::LdLoc(slot), Op::StCell]),
            Storage::Captured(idx) => self.emitter.emit_all([Op::LdCapture(idx), Op::StCell]),
        }
    }

    /// Push the cell backing a hoisted variable.
    pub(super) fn emit_var_cell(&mut self, var: &ParamVar) -> Result<(), CompileError> {
        match self.scope.lookup(var)? {
            Storage::Cell(slot) => self.emitter.emit(Op::LdLoc(slot)),
            Storage::Captured(idx) => self.emitter.emit(Op::LdCapture(idx)),
            Storage::Argument(_) | Storage::Local(_) => Err(CompileError::contract(
                "closure",
                format!("variable `{}` is not hoisted", var.name),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::LabelTarget;

    fn var(id: u32, name: &str) -> ParamVar {
        ParamVar::new(id, name, Type::I32)
    }

    #[test]
    fn closure_captures_hoist_outer_variables() {
        let x = var(0, "x");
        let y = var(1, "y");
        let inner = LambdaExpr::new(
            "inner",
            vec![y.clone()],
            Expr::binary(crate::tree::BinaryOp::Add, Expr::param(&x), Expr::param(&y), Type::I32),
            Type::I32,
        );
        let root = LambdaExpr::new("outer", vec![x.clone()], Expr::Lambda(inner), Type::Void);
        let analysis = analyze(&root).expect("analyze");
        assert!(analysis.is_hoisted(x.id));
        assert!(!analysis.is_hoisted(y.id));
        let Expr::Lambda(inner) = root.body.as_ref() else {
            panic!("body is a lambda");
        };
        assert_eq!(analysis.captures(inner), &[x]);
        assert!(analysis.captures(&root).is_empty());
    }

    #[test]
    fn captures_propagate_through_intermediate_lambdas() {
        let x = var(0, "x");
        let innermost = LambdaExpr::new("c", vec![], Expr::param(&x), Type::I32);
        let middle = LambdaExpr::new(
            "b",
            vec![],
            Expr::Lambda(innermost),
            Type::delegate(vec![], Type::I32),
        );
        let root = LambdaExpr::new("a", vec![x.clone()], Expr::Lambda(middle), Type::Void);
        let analysis = analyze(&root).expect("analyze");
        let Expr::Lambda(middle) = root.body.as_ref() else {
            panic!("middle");
        };
        let Expr::Lambda(innermost) = middle.body.as_ref() else {
            panic!("innermost");
        };
        assert_eq!(analysis.captures(middle).len(), 1);
        assert_eq!(analysis.captures(innermost).len(), 1);
    }

    #[test]
    fn inlined_lambda_parameters_stay_local() {
        let x = var(0, "x");
        let arg = var(1, "arg");
        let inlined = LambdaExpr::new("inline", vec![arg.clone()], Expr::param(&arg), Type::I32);
        let body = Expr::invoke(Expr::Lambda(inlined), vec![Expr::param(&x)], Type::I32);
        let root = LambdaExpr::new("root", vec![x.clone()], body, Type::I32);
        let analysis = analyze(&root).expect("analyze");
        assert!(!analysis.is_hoisted(x.id));
        assert!(!analysis.is_hoisted(arg.id));
    }

    #[test]
    fn runtime_variables_hoist_and_labels_record_owner() {
        let x = var(0, "x");
        let done = LabelTarget::new(0, "done", Type::Void);
        let body = Expr::block(
            vec![x.clone()],
            vec![
                Expr::RuntimeVariables {
                    variables: vec![x.clone()],
                },
                Expr::label(&done, None),
            ],
        );
        let root = LambdaExpr::new("root", vec![], body, Type::Void);
        let analysis = analyze(&root).expect("analyze");
        assert!(analysis.is_hoisted(x.id));
        assert_eq!(analysis.label_owner(done.id), Some(LambdaKey::of(&root)));
    }

    #[test]
    fn unbound_variable_is_a_contract_violation() {
        let stray = var(9, "stray");
        let root = LambdaExpr::new("root", vec![], Expr::param(&stray), Type::I32);
        let err = analyze(&root).expect_err("unbound");
        assert!(matches!(err, CompileError::Contract(_)));
    }
}
