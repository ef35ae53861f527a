//! Member access and assignment, object construction and initializers.

use exprc_runtime::{FieldId, MethodId, Op, Type};

use super::{EmitAs, EmitMode, LambdaCompiler, TailPosition};
use crate::error::CompileError;
use crate::tree::{ElementInit, Expr, MemberBinding, MemberRef, NewArrayForm};

/// Resolved target of a member store.
enum MemberTarget {
    Field { field: FieldId, is_static: bool },
    Property { setter: MethodId },
}

impl<'a> LambdaCompiler<'a> {
    pub(super) fn emit_member_get(&mut self, instance: Option<&Expr>, member: &MemberRef) -> Result<(), CompileError> {
        match member {
            MemberRef::Field(key) => {
                let field = self.field_id(key)?;
                let md = self.md;
                let def = md.field_def(field);
                if let Some(value) = &def.literal {
                    if instance.is_some() {
                        return Err(CompileError::contract(
                            "Member",
                            format!("literal field `{key}` accessed through an instance"),
                        ));
                    }
                    return self.emit_constant(value, &def.ty);
                }
                self.check_static_access(key, def.is_static, instance.is_some())?;
                match instance {
                    Some(instance) => {
                        self.emit_instance(instance)?;
                        self.emitter.emit(Op::LdFld(field))
                    }
                    None => self.emitter.emit(Op::LdSFld(field)),
                }
            }
            MemberRef::Property(key) => {
                let getter = self.property_getter(key)?;
                let receiver = self.emit_accessor_receiver(key, getter, instance)?;
                self.emit_accessor_call(getter, receiver.as_ref())
            }
        }
    }

    fn property_getter(&self, key: &str) -> Result<MethodId, CompileError> {
        let property = self.property_id(key)?;
        self.md
            .property_def(property)
            .getter
            .ok_or_else(|| CompileError::contract("Member", format!("property `{key}` has no getter")))
    }

    fn property_setter(&self, key: &str) -> Result<MethodId, CompileError> {
        let property = self.property_id(key)?;
        self.md
            .property_def(property)
            .setter
            .ok_or_else(|| CompileError::contract("Member", format!("property `{key}` has no setter")))
    }

    /// Push the receiver an accessor needs, checking it matches the accessor's staticness.
    fn emit_accessor_receiver(
        &mut self,
        key: &str,
        accessor: MethodId,
        instance: Option<&Expr>,
    ) -> Result<Option<Type>, CompileError> {
        let is_static = self.md.method_def(accessor).is_static;
        self.check_static_access(key, is_static, instance.is_some())?;
        match instance {
            Some(instance) => Ok(Some(self.emit_instance(instance)?)),
            None => Ok(None),
        }
    }

    fn member_target(&self, member: &MemberRef) -> Result<MemberTarget, CompileError> {
        match member {
            MemberRef::Field(key) => {
                let field = self.field_id(key)?;
                let def = self.md.field_def(field);
                if def.literal.is_some() {
                    return Err(CompileError::contract(
                        "Assign",
                        format!("cannot assign to literal field `{key}`"),
                    ));
                }
                Ok(MemberTarget::Field {
                    field,
                    is_static: def.is_static,
                })
            }
            MemberRef::Property(key) => Ok(MemberTarget::Property {
                setter: self.property_setter(key)?,
            }),
        }
    }

    pub(super) fn emit_index(&mut self, node: &Expr) -> Result<(), CompileError> {
        let Expr::Index {
            object,
            indexer,
            arguments,
            ty,
        } = node
        else {
            return Err(CompileError::contract("Index", "expected an index node"));
        };
        match indexer {
            Some(key) => {
                let getter = self.property_getter(key)?;
                let receiver = self.emit_instance(object)?;
                self.emit_index_arguments(getter, arguments)?;
                self.emit_accessor_call(getter, Some(&receiver))
            }
            None => {
                let array = object.ty();
                self.emit_value(object)?;
                for argument in arguments {
                    self.emit_value(argument)?;
                }
                if array.is_vector() {
                    self.emitter.emit(Op::LdElem(ty.clone()))
                } else {
                    self.emitter.emit(Op::ArrGet { rank: array.rank() })
                }
            }
        }
    }

    /// Index arguments of an indexer accessor, checked against its leading parameters.
    fn emit_index_arguments(&mut self, accessor: MethodId, arguments: &[Expr]) -> Result<(), CompileError> {
        let md = self.md;
        let def = md.method_def(accessor);
        let params = &def.params[..arguments.len().min(def.params.len())];
        let arguments: Vec<&Expr> = arguments.iter().collect();
        let write_backs = self.emit_arguments(&def.key, params, false, &arguments)?;
        if !write_backs.is_empty() {
            return Err(CompileError::unsupported(
                "Index",
                format!("by-reference index parameter of `{}`", def.key),
            ));
        }
        Ok(())
    }

    pub(super) fn emit_assign(&mut self, left: &Expr, right: &Expr, emit_as: EmitAs) -> Result<(), CompileError> {
        match left {
            Expr::Parameter(var) => {
                self.emit_value(right)?;
                if emit_as == EmitAs::Declared {
                    self.emitter.emit(Op::Dup)?;
                }
                self.emit_store_var(var)
            }
            Expr::Member {
                instance,
                member,
                ty,
            } => {
                let target = self.member_target(member)?;
                let receiver = match &target {
                    MemberTarget::Field { is_static, .. } => {
                        self.check_static_access(member.key(), *is_static, instance.is_some())?;
                        match instance {
                            Some(instance) => Some(self.emit_instance(instance)?),
                            None => None,
                        }
                    }
                    MemberTarget::Property { setter } => {
                        self.emit_accessor_receiver(member.key(), *setter, instance.as_deref())?
                    }
                };
                self.emit_value(right)?;
                let temp = self.emit_keep_assigned(ty, emit_as)?;
                match target {
                    MemberTarget::Field { field, is_static } => {
                        self.emitter.emit(if is_static { Op::StSFld(field) } else { Op::StFld(field) })?
                    }
                    MemberTarget::Property { setter } => self.emit_setter_call(setter, receiver.as_ref())?,
                }
                self.emit_load_assigned(temp)
            }
            Expr::Index {
                object,
                indexer,
                arguments,
                ty,
            } => {
                let setter = indexer.as_deref().map(|key| self.property_setter(key)).transpose()?;
                let receiver = match setter {
                    Some(setter) => {
                        let receiver = self.emit_instance(object)?;
                        self.emit_index_arguments(setter, arguments)?;
                        Some(receiver)
                    }
                    None => {
                        self.emit_value(object)?;
                        for argument in arguments {
                            self.emit_value(argument)?;
                        }
                        None
                    }
                };
                self.emit_value(right)?;
                let temp = self.emit_keep_assigned(ty, emit_as)?;
                match setter {
                    Some(setter) => self.emit_setter_call(setter, receiver.as_ref())?,
                    None => {
                        let array = object.ty();
                        if array.is_vector() {
                            self.emitter.emit(Op::StElem(ty.clone()))?
                        } else {
                            self.emitter.emit(Op::ArrSet { rank: array.rank() })?
                        }
                    }
                }
                self.emit_load_assigned(temp)
            }
            _ => Err(CompileError::contract("Assign", "left side is not assignable")),
        }
    }

    /// Copy the assigned value aside when the assignment's value is used.
    fn emit_keep_assigned(&mut self, ty: &Type, emit_as: EmitAs) -> Result<Option<exprc_runtime::LocalSlot>, CompileError> {
        if emit_as == EmitAs::Void {
            return Ok(None);
        }
        let temp = self.locals.get_local(ty);
        self.emitter.emit_all([Op::Dup, Op::StLoc(temp)])?;
        Ok(Some(temp))
    }

    fn emit_load_assigned(&mut self, temp: Option<exprc_runtime::LocalSlot>) -> Result<(), CompileError> {
        match temp {
            Some(temp) => {
                self.emitter.emit(Op::LdLoc(temp))?;
                self.locals.free_local(temp)
            }
            None => Ok(()),
        }
    }

    pub(super) fn emit_new(&mut self, ty: &Type, constructor: Option<&str>, arguments: &[Expr]) -> Result<(), CompileError> {
        let Some(key) = constructor else {
            if !arguments.is_empty() || !ty.is_value_type() {
                return Err(CompileError::contract(
                    "New",
                    format!("`{ty}` needs a constructor"),
                ));
            }
            return self.emit_default(ty);
        };
        let ctor = self.ctor_id(key)?;
        let md = self.md;
        let def = md.ctor_def(ctor);
        if md.is_abstract(&def.declaring) {
            return Err(CompileError::NonAbstractConstructorRequired(def.declaring.to_string()));
        }
        let arguments: Vec<&Expr> = arguments.iter().collect();
        let write_backs = self.emit_arguments(&def.key, &def.params, false, &arguments)?;
        let argc = u16::try_from(arguments.len())
            .map_err(|_| CompileError::unsupported("New", "more than 65535 arguments"))?;
        self.emitter.emit(Op::NewObj { ctor, argc })?;
        self.emit_write_backs(write_backs)
    }

    pub(super) fn emit_new_array(&mut self, node: &Expr) -> Result<(), CompileError> {
        let Expr::NewArray {
            form,
            ty,
            expressions,
        } = node
        else {
            return Err(CompileError::contract("NewArray", "expected an array creation node"));
        };
        let element = ty
            .element()
            .cloned()
            .ok_or_else(|| CompileError::contract("NewArray", format!("`{ty}` is not an array type")))?;
        match form {
            NewArrayForm::Init => {
                if !ty.is_vector() {
                    return Err(CompileError::contract(
                        "NewArray",
                        "element initialisation needs a one-dimensional array",
                    ));
                }
                let count = i32::try_from(expressions.len())
                    .map_err(|_| CompileError::unsupported("NewArray", "too many elements"))?;
                self.emitter.emit_all([Op::LdI32(count), Op::NewArr(element.clone())])?;
                for (idx, expression) in (0..count).zip(expressions) {
                    self.emitter.emit_all([Op::Dup, Op::LdI32(idx)])?;
                    self.emit_value(expression)?;
                    self.emitter.emit(Op::StElem(element.clone()))?;
                }
                Ok(())
            }
            NewArrayForm::Bounds => {
                for bound in expressions {
                    self.emit_value(bound)?;
                    self.emit_convert_to_type(&bound.ty(), &Type::I32, true)?;
                }
                if ty.is_vector() {
                    self.emitter.emit(Op::NewArr(element))
                } else {
                    let rank = u32::try_from(expressions.len())
                        .map_err(|_| CompileError::unsupported("NewArray", "too many dimensions"))?;
                    self.emitter.emit(Op::NewArrBounds { ty: ty.clone(), rank })
                }
            }
        }
    }

    /// Push the constructed object, or the address of a temporary holding
    /// it for value types. Returns the temporary to reload afterwards.
    fn emit_initialized_object(&mut self, new: &Expr) -> Result<Option<exprc_runtime::LocalSlot>, CompileError> {
        self.emit_value(new)?;
        let ty = new.ty();
        if !ty.is_value_type() {
            return Ok(None);
        }
        let temp = self.locals.get_local(&ty);
        self.emitter.emit_all([Op::StLoc(temp), Op::LdLocA(temp)])?;
        Ok(Some(temp))
    }

    pub(super) fn emit_list_init(&mut self, new: &Expr, initializers: &[ElementInit]) -> Result<(), CompileError> {
        let temp = self.emit_initialized_object(new)?;
        self.emit_element_inits(initializers, temp.is_none(), &new.ty())?;
        if let Some(temp) = temp {
            self.emitter.emit(Op::LdLoc(temp))?;
            self.locals.free_local(temp)?;
        }
        Ok(())
    }

    pub(super) fn emit_member_init(&mut self, new: &Expr, bindings: &[MemberBinding]) -> Result<(), CompileError> {
        let temp = self.emit_initialized_object(new)?;
        self.emit_member_bindings(bindings, temp.is_none(), &new.ty())?;
        if let Some(temp) = temp {
            self.emitter.emit(Op::LdLoc(temp))?;
            self.locals.free_local(temp)?;
        }
        Ok(())
    }

    /// Apply initializers to the receiver on top of the stack, which is
    /// consumed unless `keep_on_stack`.
    fn emit_element_inits(
        &mut self,
        initializers: &[ElementInit],
        keep_on_stack: bool,
        receiver: &Type,
    ) -> Result<(), CompileError> {
        if initializers.is_empty() && !keep_on_stack {
            return self.emitter.emit(Op::Pop);
        }
        let last = initializers.len().saturating_sub(1);
        for (idx, init) in initializers.iter().enumerate() {
            if keep_on_stack || idx < last {
                self.emitter.emit(Op::Dup)?;
            }
            let method = self.method_id(&init.add_method)?;
            let arguments: Vec<&Expr> = init.arguments.iter().collect();
            let mode = EmitMode::VALUE.with_tail(TailPosition::NoTail);
            self.emit_call_with_arguments(method, Some(receiver), &arguments, mode)?;
            if !self.md.method_def(method).ret.is_void() {
                self.emitter.emit(Op::Pop)?;
            }
        }
        Ok(())
    }

    fn emit_member_bindings(
        &mut self,
        bindings: &[MemberBinding],
        keep_on_stack: bool,
        receiver: &Type,
    ) -> Result<(), CompileError> {
        if bindings.is_empty() && !keep_on_stack {
            return self.emitter.emit(Op::Pop);
        }
        let last = bindings.len().saturating_sub(1);
        for (idx, binding) in bindings.iter().enumerate() {
            if keep_on_stack || idx < last {
                self.emitter.emit(Op::Dup)?;
            }
            self.emit_binding(binding, receiver)?;
        }
        Ok(())
    }

    /// Consume the receiver on top of the stack by applying one binding.
    fn emit_binding(&mut self, binding: &MemberBinding, receiver: &Type) -> Result<(), CompileError> {
        match binding {
            MemberBinding::Assignment { member, expression } => {
                let target = self.member_target(member)?;
                self.emit_value(expression)?;
                match target {
                    MemberTarget::Field { field, is_static: false } => self.emitter.emit(Op::StFld(field)),
                    MemberTarget::Field { is_static: true, .. } => Err(CompileError::contract(
                        "MemberInit",
                        format!("static field `{}` in an object initializer", member.key()),
                    )),
                    MemberTarget::Property { setter } => self.emit_setter_call(setter, Some(receiver)),
                }
            }
            MemberBinding::MemberBinding { member, bindings } => {
                let ty = self.emit_bound_member(member, receiver, false)?;
                self.emit_member_bindings(bindings, false, &ty)
            }
            MemberBinding::ListBinding { member, initializers } => {
                let ty = self.emit_bound_member(member, receiver, true)?;
                self.emit_element_inits(initializers, false, &ty)
            }
        }
    }

    /// Replace the receiver with the member a nested binding initialises:
    /// its address for value types, its value otherwise.
    fn emit_bound_member(&mut self, member: &MemberRef, receiver: &Type, elements: bool) -> Result<Type, CompileError> {
        match member {
            MemberRef::Field(key) => {
                let field = self.field_id(key)?;
                let def = self.md.field_def(field);
                let ty = def.ty.clone();
                if def.is_static || def.literal.is_some() {
                    return Err(CompileError::contract(
                        "MemberInit",
                        format!("`{key}` is not an instance field"),
                    ));
                }
                self.emitter.emit(if ty.is_value_type() {
                    Op::LdFldA(field)
                } else {
                    Op::LdFld(field)
                })?;
                Ok(ty)
            }
            MemberRef::Property(key) => {
                let property = self.property_id(key)?;
                let ty = self.md.property_def(property).ty.clone();
                if ty.is_value_type() {
                    let (ty, property) = (ty.to_string(), key.clone());
                    return Err(if elements {
                        CompileError::CannotAutoInitializeValueTypeElementThroughProperty { ty, property }
                    } else {
                        CompileError::CannotAutoInitializeValueTypeMemberThroughProperty { ty, property }
                    });
                }
                let getter = self.property_getter(key)?;
                self.emit_accessor_call(getter, Some(receiver))?;
                Ok(ty)
            }
        }
    }
}
