//! Addresses of storage locations, and arguments for by-reference parameters.
//!
//! A by-reference argument that names a writable property or indexer is
//! passed as the address of a temporary; the temporary is written back
//! through the setter once the call returns. Variables, fields and array
//! elements are passed by their own address. Anything else is spilled.

use exprc_runtime::{LocalSlot, MethodId, Op, PropertyId, Type};

use super::{EmitMode, ExpressionStart, LambdaCompiler};
use crate::error::CompileError;
use crate::tree::{Expr, MemberRef};

/// Store deferred until after a call with by-reference arguments.
#[derive(Debug)]
pub(crate) enum WriteBack {
    Property {
        argument: usize,
        /// Saved receiver and its static type; `None` for static properties.
        instance: Option<(LocalSlot, Type)>,
        setter: MethodId,
        value: LocalSlot,
    },
    Indexer {
        argument: usize,
        instance: (LocalSlot, Type),
        arguments: Vec<LocalSlot>,
        setter: MethodId,
        value: LocalSlot,
    },
}

impl<'a> LambdaCompiler<'a> {
    /// Push the receiver of a member access: value types by address.
    pub(super) fn emit_instance(&mut self, instance: &Expr) -> Result<Type, CompileError> {
        let ty = instance.ty();
        if ty.is_value_type() {
            self.emit_address(instance, &ty)?;
        } else {
            self.emit_value(instance)?;
        }
        Ok(ty)
    }

    /// Push the address of `node` viewed as `ty`.
    pub(super) fn emit_address(&mut self, node: &Expr, ty: &Type) -> Result<(), CompileError> {
        let started = self.emit_start(node)?;
        self.emit_address_core(node, ty)?;
        self.emit_end(started)
    }

    fn emit_address_core(&mut self, node: &Expr, ty: &Type) -> Result<(), CompileError> {
        match node {
            Expr::Parameter(var) if var.ty == *ty => self.emit_var_address(var),
            Expr::Member {
                instance,
                member: MemberRef::Field(key),
                ty: field_ty,
            } if field_ty == ty => {
                let field = self.field_id(key)?;
                let def = self.md.field_def(field);
                if def.literal.is_some() {
                    return self.emit_expression_address(node, ty);
                }
                let is_static = def.is_static;
                self.check_static_access(key, is_static, instance.is_some())?;
                match instance {
                    Some(instance) => {
                        self.emit_instance(instance)?;
                        self.emitter.emit(Op::LdFldA(field))
                    }
                    None => self.emitter.emit(Op::LdSFldA(field)),
                }
            }
            Expr::Index {
                object,
                indexer: None,
                arguments,
                ty: element,
            } if element == ty => {
                let array = object.ty();
                self.emit_value(object)?;
                for argument in arguments {
                    self.emit_value(argument)?;
                }
                if array.is_vector() {
                    self.emitter.emit(Op::LdElemA(ty.clone()))
                } else {
                    self.emitter.emit(Op::ArrAddr { rank: array.rank() })
                }
            }
            _ => self.emit_expression_address(node, ty),
        }
    }

    /// Spill the value of `node` and push the address of the spill slot.
    fn emit_expression_address(&mut self, node: &Expr, ty: &Type) -> Result<(), CompileError> {
        self.emit_expression(node, EmitMode::VALUE.with_start(ExpressionStart::Suppressed))?;
        // The address may be held past this node, so the slot stays borrowed.
        let temp = self.locals.get_local(ty);
        self.emitter.emit_all([Op::StLoc(temp), Op::LdLocA(temp)])
    }

    /// Push call arguments left to right, by address for by-reference
    /// parameters, returning the write-backs to apply after the call.
    pub(super) fn emit_arguments(
        &mut self,
        member: &str,
        params: &[Type],
        var_args: bool,
        arguments: &[&Expr],
    ) -> Result<Vec<WriteBack>, CompileError> {
        let count_ok = if var_args {
            arguments.len() >= params.len()
        } else {
            arguments.len() == params.len()
        };
        if !count_ok {
            return Err(CompileError::ArgumentCountMismatch {
                member: member.to_string(),
                expected: params.len(),
                found: arguments.len(),
            });
        }
        let mut write_backs = Vec::new();
        for (idx, argument) in arguments.iter().enumerate() {
            match params.get(idx) {
                Some(Type::ByRef(element)) => {
                    if let Some(write_back) = self.emit_address_write_back(argument, element, idx)? {
                        write_backs.push(write_back);
                    }
                }
                _ => self.emit_value(argument)?,
            }
        }
        Ok(write_backs)
    }

    fn emit_address_write_back(
        &mut self,
        node: &Expr,
        ty: &Type,
        argument: usize,
    ) -> Result<Option<WriteBack>, CompileError> {
        let started = self.emit_start(node)?;
        let write_back = match node {
            Expr::Member {
                instance,
                member: MemberRef::Property(key),
                ty: property_ty,
            } if property_ty == ty => match self.writable_property(key)? {
                Some((property, setter)) => {
                    Some(self.emit_property_write_back(instance.as_deref(), property, setter, argument)?)
                }
                None => None,
            },
            Expr::Index {
                object,
                indexer: Some(key),
                arguments,
                ty: item_ty,
            } if item_ty == ty => match self.writable_property(key)? {
                Some((property, setter)) => {
                    Some(self.emit_indexer_write_back(object, arguments, property, setter, argument)?)
                }
                None => None,
            },
            _ => None,
        };
        if write_back.is_none() {
            self.emit_address_core(node, ty)?;
        }
        self.emit_end(started)?;
        Ok(write_back)
    }

    fn writable_property(&self, key: &str) -> Result<Option<(PropertyId, MethodId)>, CompileError> {
        let property = self.property_id(key)?;
        Ok(self.md.property_def(property).setter.map(|setter| (property, setter)))
    }

    fn getter_of(&self, property: PropertyId) -> Result<MethodId, CompileError> {
        let def = self.md.property_def(property);
        def.getter.ok_or_else(|| {
            CompileError::contract("property", format!("`{}` has no getter", def.key))
        })
    }

    /// Push the receiver and keep a copy of it for the write-back.
    fn emit_saved_instance(&mut self, instance: &Expr) -> Result<(LocalSlot, Type), CompileError> {
        let ty = self.emit_instance(instance)?;
        let slot_ty = if ty.is_value_type() {
            Type::by_ref(ty.clone())
        } else {
            ty.clone()
        };
        let slot = self.locals.get_local(&slot_ty);
        self.emitter.emit_all([Op::Dup, Op::StLoc(slot)])?;
        Ok((slot, ty))
    }

    /// Call the getter, then replace its result with the address of a temporary holding it.
    fn emit_value_temp_address(&mut self, getter: MethodId, receiver: Option<&Type>) -> Result<LocalSlot, CompileError> {
        self.emit_accessor_call(getter, receiver)?;
        let ty = self.md.method_def(getter).ret.clone();
        let value = self.locals.get_local(&ty);
        self.emitter.emit_all([Op::StLoc(value), Op::LdLocA(value)])?;
        Ok(value)
    }

    fn emit_property_write_back(
        &mut self,
        instance: Option<&Expr>,
        property: PropertyId,
        setter: MethodId,
        argument: usize,
    ) -> Result<WriteBack, CompileError> {
        let getter = self.getter_of(property)?;
        let instance = match instance {
            Some(instance) => Some(self.emit_saved_instance(instance)?),
            None => None,
        };
        let value = self.emit_value_temp_address(getter, instance.as_ref().map(|(_, ty)| ty))?;
        Ok(WriteBack::Property {
            argument,
            instance,
            setter,
            value,
        })
    }

    fn emit_indexer_write_back(
        &mut self,
        object: &Expr,
        arguments: &[Expr],
        property: PropertyId,
        setter: MethodId,
        argument: usize,
    ) -> Result<WriteBack, CompileError> {
        let getter = self.getter_of(property)?;
        let instance = self.emit_saved_instance(object)?;
        let mut saved = Vec::with_capacity(arguments.len());
        for index in arguments {
            self.emit_value(index)?;
            let slot = self.locals.get_local(&index.ty());
            self.emitter.emit_all([Op::Dup, Op::StLoc(slot)])?;
            saved.push(slot);
        }
        let value = self.emit_value_temp_address(getter, Some(&instance.1))?;
        Ok(WriteBack::Indexer {
            argument,
            instance,
            arguments: saved,
            setter,
            value,
        })
    }

    pub(super) fn emit_write_backs(&mut self, write_backs: Vec<WriteBack>) -> Result<(), CompileError> {
        for write_back in write_backs {
            match write_back {
                WriteBack::Property {
                    argument,
                    instance,
                    setter,
                    value,
                } => {
                    log::debug!(
                        "write-back of argument {argument} through `{}`",
                        self.md.method_def(setter).key
                    );
                    if let Some((slot, _)) = &instance {
                        self.emitter.emit(Op::LdLoc(*slot))?;
                    }
                    self.emitter.emit(Op::LdLoc(value))?;
                    self.emit_setter_call(setter, instance.as_ref().map(|(_, ty)| ty))?;
                    if let Some((slot, _)) = instance {
                        self.locals.free_local(slot)?;
                    }
                    self.locals.free_local(value)?;
                }
                WriteBack::Indexer {
                    argument,
                    instance: (instance, receiver),
                    arguments,
                    setter,
                    value,
                } => {
                    log::debug!(
                        "write-back of argument {argument} through `{}`",
                        self.md.method_def(setter).key
                    );
                    self.emitter.emit(Op::LdLoc(instance))?;
                    for slot in &arguments {
                        self.emitter.emit(Op::LdLoc(*slot))?;
                    }
                    self.emitter.emit(Op::LdLoc(value))?;
                    self.emit_setter_call(setter, Some(&receiver))?;
                    self.locals.free_local(instance)?;
                    for slot in arguments {
                        self.locals.free_local(slot)?;
                    }
                    self.locals.free_local(value)?;
                }
            }
        }
        Ok(())
    }

    /// Call a setter for its effect only.
    pub(super) fn emit_setter_call(&mut self, setter: MethodId, receiver: Option<&Type>) -> Result<(), CompileError> {
        self.emit_accessor_call(setter, receiver)?;
        if !self.md.method_def(setter).ret.is_void() {
            self.emitter.emit(Op::Pop)?;
        }
        Ok(())
    }
}
