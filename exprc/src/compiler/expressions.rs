//! Node dispatch and the value-level emitters that need no control flow:
//! constants, defaults, unary operators, conversions, closures.

use exprc_runtime::{Op, Type, Value};

use super::constants::literal_ops;
use super::lift::{LiftCore, LiftFamily};
use super::{EmitAs, EmitMode, ExpressionStart, LabelScopeKind, LambdaCompiler};
use crate::error::CompileError;
use crate::tree::{BinaryOp, Expr, LambdaExpr, ParamVar, UnaryOp};

impl<'a> LambdaCompiler<'a> {
    /// Open the label block of `node`, returning the kind to close later.
    pub(super) fn emit_start(&mut self, node: &Expr) -> Result<Option<LabelScopeKind>, CompileError> {
        if self.labels.try_push(node)? {
            Ok(Some(self.labels.current_kind()))
        } else {
            Ok(None)
        }
    }

    pub(super) fn emit_end(&mut self, started: Option<LabelScopeKind>) -> Result<(), CompileError> {
        match started {
            Some(kind) => self.labels.pop(kind),
            None => Ok(()),
        }
    }

    /// Emit `node` so that it pushes exactly one value of its type (nothing
    /// for void nodes).
    pub(super) fn emit_expression(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let started = match mode.start {
            ExpressionStart::Pending => self.emit_start(node)?,
            ExpressionStart::Suppressed => None,
        };
        self.dispatch(node, mode.inner())?;
        self.emit_end(started)
    }

    pub(super) fn emit_value(&mut self, node: &Expr) -> Result<(), CompileError> {
        self.emit_expression(node, EmitMode::VALUE)
    }

    /// Emit `node` for its side effects only.
    pub(super) fn emit_expression_as_void(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let started = self.emit_start(node)?;
        let void = mode.inner().with_as(EmitAs::Void);
        match node {
            Expr::Binary {
                op: BinaryOp::Assign,
                left,
                right,
                ..
            } => self.emit_assign(left, right, EmitAs::Void)?,
            Expr::Block { .. } => self.emit_block(node, void)?,
            Expr::Throw { value, ty } => self.emit_throw(value.as_deref(), ty, EmitAs::Void)?,
            Expr::Goto { .. } => self.emit_goto(node, void)?,
            Expr::Constant { .. } | Expr::Default { .. } | Expr::Parameter(_) => {}
            other if other.ty().is_void() => {
                self.emit_expression(other, mode.with_start(ExpressionStart::Suppressed))?
            }
            other => {
                self.emit_expression(other, EmitMode::VALUE.with_start(ExpressionStart::Suppressed))?;
                self.emitter.emit(Op::Pop)?;
            }
        }
        self.emit_end(started)
    }

    /// Emit `node` as a value of `ty`; a differing reference type is cast.
    pub(super) fn emit_expression_as_type(
        &mut self,
        node: &Expr,
        ty: &Type,
        mode: EmitMode,
    ) -> Result<(), CompileError> {
        if ty.is_void() {
            return self.emit_expression_as_void(node, mode);
        }
        if node.ty() != *ty {
            self.emit_value(node)?;
            return self.emitter.emit(Op::CastClass(ty.clone()));
        }
        self.emit_expression(node, mode.with_start(ExpressionStart::Pending))
    }

    fn dispatch(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        match node {
            Expr::Constant { value, ty } => self.emit_constant(value, ty),
            Expr::Parameter(var) => self.emit_load_var(var),
            Expr::Binary {
                op: BinaryOp::Assign,
                left,
                right,
                ..
            } => self.emit_assign(left, right, EmitAs::Declared),
            Expr::Binary { .. } => self.emit_binary(node, mode),
            Expr::Unary {
                op: UnaryOp::Convert | UnaryOp::ConvertChecked,
                ..
            } => self.emit_convert(node, mode),
            Expr::Unary { .. } => self.emit_unary(node, mode),
            Expr::Member { instance, member, .. } => self.emit_member_get(instance.as_deref(), member),
            Expr::Index { .. } => self.emit_index(node),
            Expr::Call {
                object,
                method,
                arguments,
                ..
            } => self.emit_method_call(object.as_deref(), method, arguments, mode),
            Expr::New {
                ty,
                constructor,
                arguments,
            } => self.emit_new(ty, constructor.as_deref(), arguments),
            Expr::NewArray { .. } => self.emit_new_array(node),
            Expr::ListInit { new, initializers } => self.emit_list_init(new, initializers),
            Expr::MemberInit { new, bindings } => self.emit_member_init(new, bindings),
            Expr::Invoke { .. } => self.emit_invoke(node, mode),
            Expr::Lambda(lambda) => self.emit_closure(lambda),
            Expr::TypeIs {
                expression,
                type_operand,
            } => self.emit_type_is(expression, type_operand),
            Expr::RuntimeVariables { variables } => self.emit_runtime_variables(variables),
            Expr::DebugInfo => Ok(()),
            Expr::Throw { value, ty } => self.emit_throw(value.as_deref(), ty, EmitAs::Declared),
            Expr::Goto { .. } => self.emit_goto(node, mode),
            Expr::Label { .. } => self.emit_label(node, mode),
            Expr::Block { .. } => self.emit_block(node, mode),
            Expr::Conditional { .. } => self.emit_conditional(node, mode),
            Expr::Loop { .. } => self.emit_loop(node),
            Expr::Default { ty } => self.emit_default(ty),
        }
    }

    pub(super) fn emit_constant(&mut self, value: &Value, ty: &Type) -> Result<(), CompileError> {
        match literal_ops(value, ty)? {
            Some(ops) => self.emitter.emit_all(ops),
            None => {
                let idx = self.constants.add(value);
                self.emitter.emit(Op::LdConst(idx))
            }
        }
    }

    /// Push the zero value of `ty`; void pushes nothing.
    pub(super) fn emit_default(&mut self, ty: &Type) -> Result<(), CompileError> {
        match ty {
            Type::Void => Ok(()),
            Type::Bool => self.emitter.emit(Op::LdBool(false)),
            Type::I32 => self.emitter.emit(Op::LdI32(0)),
            Type::I64 => self.emitter.emit(Op::LdI64(0)),
            Type::F64 => self.emitter.emit(Op::LdF64(0.0)),
            Type::Struct(_) => {
                let temp = self.locals.get_local(ty);
                self.emitter
                    .emit_all([Op::LdLocA(temp), Op::InitObj(ty.clone()), Op::LdLoc(temp)])?;
                self.locals.free_local(temp)
            }
            Type::ByRef(_) => Err(CompileError::contract(
                "Default",
                format!("no default value for by-reference type `{ty}`"),
            )),
            _ => self.emitter.emit(Op::LdNull),
        }
    }

    fn emit_unary(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let Expr::Unary {
            op,
            operand,
            ty,
            method,
        } = node
        else {
            return Err(CompileError::contract("Unary", "expected a unary node"));
        };
        let operand_ty = operand.ty();
        if let Some(key) = method {
            let method = self.method_id(key)?;
            let param_is_nullable = self
                .md
                .method_def(method)
                .params
                .first()
                .is_some_and(Type::is_nullable);
            if operand_ty.is_nullable() && !param_is_nullable {
                return self.emit_lift(LiftFamily::Propagate, ty, LiftCore::Method(method), &[operand.as_ref()]);
            }
            return self.emit_static_call(method, &[operand.as_ref()], mode);
        }
        if operand_ty.is_nullable() {
            let core = LiftCore::Unary {
                op: *op,
                operand: operand_ty.non_nullable().clone(),
            };
            return self.emit_lift(LiftFamily::Propagate, ty, core, &[operand.as_ref()]);
        }
        self.emit_value(operand)?;
        self.emit_unary_operator(*op, &operand_ty)
    }

    /// Apply a unary operator to the unlifted value on top of the stack.
    pub(super) fn emit_unary_operator(&mut self, op: UnaryOp, operand: &Type) -> Result<(), CompileError> {
        match op {
            UnaryOp::Negate if operand.is_numeric() => self.emitter.emit(Op::Neg),
            UnaryOp::Not if matches!(operand, Type::Bool) || operand.is_integral() => {
                self.emitter.emit(Op::Not)
            }
            UnaryOp::ArrayLength if operand.is_vector() => self.emitter.emit(Op::LdLen),
            UnaryOp::Convert | UnaryOp::ConvertChecked => Err(CompileError::contract(
                "Unary",
                "conversions are not plain unary operators",
            )),
            other => Err(CompileError::unsupported(
                "Unary",
                format!("{other:?} on `{operand}`"),
            )),
        }
    }

    fn emit_convert(&mut self, node: &Expr, mode: EmitMode) -> Result<(), CompileError> {
        let Expr::Unary {
            op,
            operand,
            ty,
            method,
        } = node
        else {
            return Err(CompileError::contract("Convert", "expected a conversion node"));
        };
        let checked = *op == UnaryOp::ConvertChecked;
        let from = operand.ty();
        if let Some(key) = method {
            let method = self.method_id(key)?;
            let def = self.md.method_def(method);
            let param = def.params.first().cloned().unwrap_or(Type::Void);
            let raw = def.ret.clone();
            if from.is_nullable() && !param.is_nullable() {
                let lifted = raw.to_nullable();
                self.emit_lift(LiftFamily::Propagate, &lifted, LiftCore::Method(method), &[operand.as_ref()])?;
                return self.emit_convert_to_type(&lifted, ty, false);
            }
            return self.emit_static_call(method, &[operand.as_ref()], mode);
        }
        if ty.is_void() {
            return self.emit_expression_as_void(operand, mode);
        }
        if from == *ty {
            return self.emit_expression(operand, mode);
        }
        if from.is_nullable() && ty.is_nullable() {
            let core = LiftCore::Convert {
                from: from.non_nullable().clone(),
                to: ty.non_nullable().clone(),
                checked,
            };
            return self.emit_lift(LiftFamily::Propagate, ty, core, &[operand.as_ref()]);
        }
        self.emit_value(operand)?;
        self.emit_convert_to_type(&from, ty, checked)
    }

    /// Convert the value on top of the stack from `from` to `to`.
    pub(super) fn emit_convert_to_type(&mut self, from: &Type, to: &Type, checked: bool) -> Result<(), CompileError> {
        if from == to {
            return Ok(());
        }
        if from.is_void() || to.is_void() {
            return Err(CompileError::contract(
                "Convert",
                format!("cannot convert `{from}` to `{to}`"),
            ));
        }
        let involves_object = matches!(from, Type::Object) || matches!(to, Type::Object);
        if involves_object || (!from.is_value_type() && !to.is_value_type()) {
            self.emit_cast_to_type(from, to)
        } else if from.is_nullable() || to.is_nullable() {
            self.emit_nullable_conversion(from, to, checked)
        } else if from.is_numeric() && to.is_numeric() {
            self.emitter.emit(Op::Conv {
                to: to.clone(),
                checked,
            })
        } else {
            Err(CompileError::unsupported(
                "Convert",
                format!("conversion from `{from}` to `{to}`"),
            ))
        }
    }

    fn emit_cast_to_type(&mut self, from: &Type, to: &Type) -> Result<(), CompileError> {
        if from.is_value_type() {
            self.emitter.emit(Op::Box(from.clone()))?;
            if !matches!(to, Type::Object) {
                self.emitter.emit(Op::CastClass(to.clone()))?;
            }
            Ok(())
        } else if to.is_value_type() {
            self.emitter.emit(Op::UnboxAny(to.clone()))
        } else {
            self.emitter.emit(Op::CastClass(to.clone()))
        }
    }

    fn emit_nullable_conversion(&mut self, from: &Type, to: &Type, checked: bool) -> Result<(), CompileError> {
        match (from.is_nullable(), to.is_nullable()) {
            (true, true) => {
                let temp = self.locals.get_local(from);
                let if_null = self.emitter.define_label();
                let end = self.emitter.define_label();
                self.emitter.emit_all([
                    Op::StLoc(temp),
                    Op::LdLocA(temp),
                    Op::HasValue(from.clone()),
                    Op::BrFalse(if_null),
                    Op::LdLocA(temp),
                    Op::GetValueOrDefault(from.clone()),
                ])?;
                self.locals.free_local(temp)?;
                self.emit_convert_to_type(from.non_nullable(), to.non_nullable(), checked)?;
                self.emitter.emit_all([Op::NewNullable(to.clone()), Op::Br(end)])?;
                self.emitter.mark(if_null)?;
                self.emitter.emit(Op::LdNull)?;
                self.emitter.mark(end)
            }
            (true, false) if to.is_value_type() => {
                let temp = self.locals.get_local(from);
                self.emitter
                    .emit_all([Op::StLoc(temp), Op::LdLocA(temp), Op::NullableValue(from.clone())])?;
                self.locals.free_local(temp)?;
                self.emit_convert_to_type(from.non_nullable(), to, checked)
            }
            (true, false) => self.emitter.emit(Op::Box(from.clone())),
            (false, _) => {
                self.emit_convert_to_type(from, to.non_nullable(), checked)?;
                self.emitter.emit(Op::NewNullable(to.clone()))
            }
        }
    }

    /// Compile a nested lambda into its own function and push a closure.
    fn emit_closure(&mut self, lambda: &LambdaExpr) -> Result<(), CompileError> {
        let analysis = self.analysis;
        let function = LambdaCompiler::compile(self.md, analysis, self.options, self.builder, lambda)?;
        let captures = analysis.captures(lambda);
        for var in captures {
            self.emit_var_cell(var)?;
        }
        let count = u16::try_from(captures.len())
            .map_err(|_| CompileError::unsupported("Lambda", "more than 65535 captured variables"))?;
        self.emitter.emit(Op::MakeClosure {
            function,
            captures: count,
        })
    }

    fn emit_runtime_variables(&mut self, variables: &[ParamVar]) -> Result<(), CompileError> {
        for var in variables {
            self.emit_var_cell(var)?;
        }
        let count = u16::try_from(variables.len())
            .map_err(|_| CompileError::unsupported("RuntimeVariables", "more than 65535 variables"))?;
        self.emitter.emit(Op::MakeRuntimeVariables(count))
    }

    fn emit_throw(&mut self, value: Option<&Expr>, ty: &Type, emit_as: EmitAs) -> Result<(), CompileError> {
        let Some(value) = value else {
            return Err(CompileError::unsupported("Throw", "rethrow outside of a handler"));
        };
        self.emit_value(value)?;
        self.emitter.emit(Op::Throw)?;
        self.emit_unreachable(ty, emit_as)
    }

    /// Keep the stack shape of a typed node whose code never completes.
    pub(super) fn emit_unreachable(&mut self, ty: &Type, emit_as: EmitAs) -> Result<(), CompileError> {
        if !ty.is_void() && emit_as != EmitAs::Void {
            self.emit_default(ty)?;
        }
        Ok(())
    }
}
