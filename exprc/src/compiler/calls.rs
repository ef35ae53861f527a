//! Method calls, delegate invocation and inlining of invoked lambda literals.

use exprc_runtime::{CallSite, CtorId, FieldId, MethodId, Op, PropertyId, Type};

use super::labels::LabelTracker;
use super::scope::LambdaKey;
use super::{EmitMode, ExpressionStart, LambdaCompiler, TailPosition};
use crate::error::CompileError;
use crate::tree::{Expr, LambdaExpr, ParamVar};

impl<'a> LambdaCompiler<'a> {
    pub(super) fn method_id(&self, key: &str) -> Result<MethodId, CompileError> {
        self.md
            .method(key)
            .ok_or_else(|| CompileError::UnknownMethod(key.to_string()))
    }

    pub(super) fn field_id(&self, key: &str) -> Result<FieldId, CompileError> {
        self.md
            .field(key)
            .ok_or_else(|| CompileError::UnknownField(key.to_string()))
    }

    pub(super) fn property_id(&self, key: &str) -> Result<PropertyId, CompileError> {
        self.md
            .property(key)
            .ok_or_else(|| CompileError::UnknownProperty(key.to_string()))
    }

    pub(super) fn ctor_id(&self, key: &str) -> Result<CtorId, CompileError> {
        self.md
            .constructor(key)
            .ok_or_else(|| CompileError::UnknownConstructor(key.to_string()))
    }

    /// Emit the call instruction for `method` with receiver and arguments
    /// already on the stack. Instance methods of reference types are always
    /// called virtually; a value-type receiver of such a call is constrained.
    pub(super) fn emit_call_site(
        &mut self,
        method: MethodId,
        receiver: Option<&Type>,
        tail: bool,
        argc: Option<usize>,
    ) -> Result<(), CompileError> {
        let def = self.md.method_def(method);
        let virtual_call = !def.is_static && !def.declared_on_value_type();
        let constrained = match receiver {
            Some(ty) if virtual_call && ty.is_value_type() => Some(ty.clone()),
            _ => None,
        };
        let argc = u16::try_from(argc.unwrap_or(def.params.len()))
            .map_err(|_| CompileError::unsupported("Call", format!("too many arguments to `{}`", def.key)))?;
        let site = CallSite {
            method,
            virtual_call,
            tail,
            constrained,
            argc,
            has_this: !def.is_static,
            returns_value: !def.ret.is_void(),
        };
        self.emitter.emit(Op::Call(site))
    }

    /// Call a property accessor; accessors take a fixed argument list.
    pub(super) fn emit_accessor_call(&mut self, method: MethodId, receiver: Option<&Type>) -> Result<(), CompileError> {
        let def = self.md.method_def(method);
        if def.var_args {
            return Err(CompileError::UnexpectedVarArgsCall(def.key.clone()));
        }
        self.emit_call_site(method, receiver, false, None)
    }

    pub(super) fn emit_method_call(
        &mut self,
        object: Option<&Expr>,
        key: &str,
        arguments: &[Expr],
        mode: EmitMode,
    ) -> Result<(), CompileError> {
        let method = self.method_id(key)?;
        let is_static = self.md.method_def(method).is_static;
        self.check_static_access(key, is_static, object.is_some())?;
        let receiver = match object {
            Some(object) => Some(self.emit_instance(object)?),
            None => None,
        };
        let mode = if receiver.as_ref().is_some_and(Type::is_value_type) {
            mode.with_tail(TailPosition::NoTail)
        } else {
            mode
        };
        let arguments: Vec<&Expr> = arguments.iter().collect();
        self.emit_call_with_arguments(method, receiver.as_ref(), &arguments, mode)
    }

    pub(super) fn emit_static_call(
        &mut self,
        method: MethodId,
        arguments: &[&Expr],
        mode: EmitMode,
    ) -> Result<(), CompileError> {
        self.emit_call_with_arguments(method, None, arguments, mode)
    }

    /// Arguments, the call itself, then any write-backs. The receiver, if
    /// any, is already on the stack.
    pub(super) fn emit_call_with_arguments(
        &mut self,
        method: MethodId,
        receiver: Option<&Type>,
        arguments: &[&Expr],
        mode: EmitMode,
    ) -> Result<(), CompileError> {
        let md = self.md;
        let def = md.method_def(method);
        let write_backs = self.emit_arguments(&def.key, &def.params, def.var_args, arguments)?;
        let tail = mode.is_tail() && !def.has_by_ref_param();
        self.emit_call_site(method, receiver, tail, Some(arguments.len()))?;
        self.emit_write_backs(write_backs)
    }

    pub(super) fn emit_invoke(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let Expr::Invoke {
            target, arguments, ..
        } = node
        else {
            return Err(CompileError::contract("Invoke", "expected an invocation node"));
        };
        let arguments: Vec<&Expr> = arguments.iter().collect();
        if let Expr::Lambda(lambda) = target.as_ref() {
            return self.emit_inlined_invoke(lambda, &arguments, mode);
        }

        let delegate = target.ty();
        let signature = delegate.signature().cloned().ok_or_else(|| {
            CompileError::contract("Invoke", format!("`{delegate}` is not a delegate type"))
        })?;
        self.emit_value(target)?;
        let write_backs = self.emit_arguments("Invoke", &signature.params, false, &arguments)?;
        let argc = u16::try_from(arguments.len())
            .map_err(|_| CompileError::unsupported("Invoke", "more than 65535 arguments"))?;
        self.emitter.emit(Op::CallDelegate {
            argc,
            tail: false,
            returns_value: !signature.ret.is_void(),
        })?;
        self.emit_write_backs(write_backs)
    }

    /// Emit the body of an invoked lambda literal in place. Arguments are
    /// evaluated in the enclosing scope; the body gets its own labels but
    /// shares slots and variable scopes with the enclosing function.
    fn emit_inlined_invoke(
        &mut self,
        lambda: &LambdaExpr,
        arguments: &[&Expr],
        mode: EmitMode,
    ) -> Result<(), CompileError> {
        log::debug!("inlining `{}`", lambda.display_name());
        let params: Vec<Type> = lambda.params.iter().map(ParamVar::storage_type).collect();
        let write_backs = self.emit_arguments(lambda.display_name(), &params, false, arguments)?;
        let mode = if write_backs.is_empty() {
            mode
        } else {
            mode.with_tail(TailPosition::NoTail)
        };

        let outer_labels = std::mem::replace(&mut self.labels, LabelTracker::new());
        let outer_owner = std::mem::replace(&mut self.label_owner, LambdaKey::of(lambda));
        let body = self.emit_inlined_body(lambda, mode);
        self.labels = outer_labels;
        self.label_owner = outer_owner;
        body?;

        self.emit_write_backs(write_backs)
    }

    fn emit_inlined_body(&mut self, lambda: &LambdaExpr, mode: EmitMode) -> Result<(), CompileError> {
        self.enter_inlined_scope(&lambda.params)?;
        let mode = mode.with_start(ExpressionStart::Pending);
        if lambda.ret.is_void() {
            self.emit_expression_as_void(&lambda.body, mode)?;
        } else {
            self.emit_expression(&lambda.body, mode)?;
        }
        self.exit_scope();
        self.labels.validate_finish()
    }

    pub(super) fn check_static_access(&self, key: &str, is_static: bool, has_instance: bool) -> Result<(), CompileError> {
        match (is_static, has_instance) {
            (true, true) => Err(CompileError::contract(
                "member",
                format!("static member `{key}` accessed through an instance"),
            )),
            (false, false) => Err(CompileError::contract(
                "member",
                format!("instance member `{key}` accessed without an instance"),
            )),
            _ => Ok(()),
        }
    }
}
