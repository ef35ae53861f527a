//! Member metadata registry.
//!
//! Trees refer to members by qualified key (`"Type.member"`); the compiler
//! resolves keys to ids here, and the machine uses the same registry to run
//! native member bodies.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::machine::{Fault, Machine};
use crate::types::Type;
use crate::value::{StructValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtorId(pub u32);

/// Native member body. Instance members receive the receiver as `args[0]`
/// (an address for value-type receivers); by-ref parameters arrive as
/// `Value::Addr`.
pub type NativeFn = Rc<dyn Fn(&mut Machine<'_>, &[Value]) -> Result<Value, Fault>>;

pub fn native<F>(body: F) -> NativeFn
where
    F: Fn(&mut Machine<'_>, &[Value]) -> Result<Value, Fault> + 'static,
{
    Rc::new(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDefKind {
    Class,
    Struct,
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeDefKind,
    pub base: Option<String>,
    pub is_abstract: bool,
}

#[derive(Clone)]
pub struct MethodDef {
    pub key: String,
    pub name: String,
    /// `None` only for free-standing helpers.
    pub declaring: Option<Type>,
    pub is_static: bool,
    pub is_virtual: bool,
    pub var_args: bool,
    pub params: Vec<Type>,
    pub ret: Type,
    pub body: NativeFn,
}

impl MethodDef {
    pub fn has_by_ref_param(&self) -> bool {
        self.params.iter().any(Type::is_by_ref)
    }

    pub fn declared_on_value_type(&self) -> bool {
        self.declaring.as_ref().is_some_and(Type::is_value_type)
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("key", &self.key)
            .field("is_static", &self.is_static)
            .field("is_virtual", &self.is_virtual)
            .field("params", &self.params)
            .field("ret", &self.ret)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub key: String,
    pub name: String,
    pub declaring: Type,
    pub ty: Type,
    pub is_static: bool,
    /// Compile-time constant; the compiler loads the value instead of the field.
    pub literal: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub key: String,
    pub name: String,
    pub declaring: Type,
    pub ty: Type,
    pub getter: Option<MethodId>,
    pub setter: Option<MethodId>,
    /// Non-empty for indexers.
    pub index_params: Vec<Type>,
}

#[derive(Clone)]
pub struct CtorDef {
    pub key: String,
    pub declaring: Type,
    pub params: Vec<Type>,
    pub body: NativeFn,
}

impl fmt::Debug for CtorDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtorDef")
            .field("key", &self.key)
            .field("params", &self.params)
            .finish()
    }
}

#[derive(Default)]
pub struct Metadata {
    types: HashMap<String, TypeDef>,
    methods: Vec<MethodDef>,
    fields: Vec<FieldDef>,
    properties: Vec<PropertyDef>,
    ctors: Vec<CtorDef>,
    method_keys: HashMap<String, MethodId>,
    field_keys: HashMap<String, FieldId>,
    property_keys: HashMap<String, PropertyId>,
    ctor_keys: HashMap<String, CtorId>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_class(&mut self, name: &str, base: Option<&str>, is_abstract: bool) -> Type {
        self.types.insert(
            name.to_string(),
            TypeDef {
                name: name.to_string(),
                kind: TypeDefKind::Class,
                base: base.map(str::to_string),
                is_abstract,
            },
        );
        Type::Class(name.to_string())
    }

    pub fn define_struct(&mut self, name: &str) -> Type {
        self.types.insert(
            name.to_string(),
            TypeDef {
                name: name.to_string(),
                kind: TypeDefKind::Struct,
                base: None,
                is_abstract: false,
            },
        );
        Type::Struct(name.to_string())
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn is_abstract(&self, ty: &Type) -> bool {
        ty.def_name()
            .and_then(|name| self.types.get(name))
            .is_some_and(|def| def.is_abstract)
    }

    pub fn add_method(&mut self, def: MethodDef) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.method_keys.insert(def.key.clone(), id);
        self.methods.push(def);
        id
    }

    /// Register a static method under `"{owner}.{name}"`.
    pub fn add_static_method(
        &mut self,
        owner: &str,
        name: &str,
        params: Vec<Type>,
        ret: Type,
        body: NativeFn,
    ) -> MethodId {
        self.add_method(MethodDef {
            key: format!("{owner}.{name}"),
            name: name.to_string(),
            declaring: self.types.get(owner).map(|def| def_type(def)),
            is_static: true,
            is_virtual: false,
            var_args: false,
            params,
            ret,
            body,
        })
    }

    pub fn add_instance_method(
        &mut self,
        declaring: &Type,
        name: &str,
        params: Vec<Type>,
        ret: Type,
        is_virtual: bool,
        body: NativeFn,
    ) -> MethodId {
        self.add_method(MethodDef {
            key: format!("{declaring}.{name}"),
            name: name.to_string(),
            declaring: Some(declaring.clone()),
            is_static: false,
            is_virtual,
            var_args: false,
            params,
            ret,
            body,
        })
    }

    pub fn add_field(&mut self, declaring: &Type, name: &str, ty: Type) -> FieldId {
        self.push_field(declaring, name, ty, false, None)
    }

    pub fn add_static_field(&mut self, declaring: &Type, name: &str, ty: Type) -> FieldId {
        self.push_field(declaring, name, ty, true, None)
    }

    pub fn add_literal_field(&mut self, declaring: &Type, name: &str, ty: Type, value: Value) -> FieldId {
        self.push_field(declaring, name, ty, true, Some(value))
    }

    fn push_field(
        &mut self,
        declaring: &Type,
        name: &str,
        ty: Type,
        is_static: bool,
        literal: Option<Value>,
    ) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        let key = format!("{declaring}.{name}");
        self.field_keys.insert(key.clone(), id);
        self.fields.push(FieldDef {
            key,
            name: name.to_string(),
            declaring: declaring.clone(),
            ty,
            is_static,
            literal,
        });
        id
    }

    pub fn add_property(
        &mut self,
        declaring: &Type,
        name: &str,
        ty: Type,
        getter: Option<MethodId>,
        setter: Option<MethodId>,
    ) -> PropertyId {
        self.add_indexer(declaring, name, ty, Vec::new(), getter, setter)
    }

    pub fn add_indexer(
        &mut self,
        declaring: &Type,
        name: &str,
        ty: Type,
        index_params: Vec<Type>,
        getter: Option<MethodId>,
        setter: Option<MethodId>,
    ) -> PropertyId {
        let id = PropertyId(self.properties.len() as u32);
        let key = format!("{declaring}.{name}");
        self.property_keys.insert(key.clone(), id);
        self.properties.push(PropertyDef {
            key,
            name: name.to_string(),
            declaring: declaring.clone(),
            ty,
            getter,
            setter,
            index_params,
        });
        id
    }

    /// Register a constructor under `"{declaring}.{name}"` (conventionally `ctor`).
    pub fn add_constructor(
        &mut self,
        declaring: &Type,
        name: &str,
        params: Vec<Type>,
        body: NativeFn,
    ) -> CtorId {
        let id = CtorId(self.ctors.len() as u32);
        let key = format!("{declaring}.{name}");
        self.ctor_keys.insert(key.clone(), id);
        self.ctors.push(CtorDef {
            key,
            declaring: declaring.clone(),
            params,
            body,
        });
        id
    }

    pub fn method(&self, key: &str) -> Option<MethodId> {
        self.method_keys.get(key).copied()
    }

    pub fn field(&self, key: &str) -> Option<FieldId> {
        self.field_keys.get(key).copied()
    }

    pub fn property(&self, key: &str) -> Option<PropertyId> {
        self.property_keys.get(key).copied()
    }

    pub fn constructor(&self, key: &str) -> Option<CtorId> {
        self.ctor_keys.get(key).copied()
    }

    pub fn method_def(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.0 as usize]
    }

    pub fn field_def(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn property_def(&self, id: PropertyId) -> &PropertyDef {
        &self.properties[id.0 as usize]
    }

    pub fn ctor_def(&self, id: CtorId) -> &CtorDef {
        &self.ctors[id.0 as usize]
    }

    /// Class names from `name` up to the root of its hierarchy.
    pub fn class_chain<'a>(&'a self, name: &'a str) -> Vec<&'a str> {
        let mut chain = vec![name];
        let mut current = name;
        while let Some(base) = self.types.get(current).and_then(|def| def.base.as_deref()) {
            if chain.contains(&base) {
                break;
            }
            chain.push(base);
            current = base;
        }
        chain
    }

    /// Static assignability (`target = source` needs no conversion other than a reference widening).
    pub fn is_assignable_from(&self, target: &Type, source: &Type) -> bool {
        if target == source {
            return true;
        }
        match (target, source) {
            (Type::Object, source) => !source.is_void() && !source.is_by_ref(),
            (Type::Class(target), Type::Class(source)) => {
                self.class_chain(source).contains(&target.as_str())
            }
            _ => false,
        }
    }

    pub fn is_reference_assignable(&self, target: &Type, source: &Type) -> bool {
        if target == source {
            return true;
        }
        !target.is_value_type() && !source.is_value_type() && self.is_assignable_from(target, source)
    }

    /// Dynamic instance test, the `isinst` semantics.
    pub fn is_instance(&self, value: &Value, ty: &Type) -> bool {
        match (value, ty) {
            (Value::Null, _) => false,
            (Value::Addr(_), _) | (Value::Cell(_), _) => false,
            (_, Type::Object) => true,
            (value, Type::Nullable(inner)) => self.is_instance(value, inner),
            (Value::Bool(_), Type::Bool)
            | (Value::I32(_), Type::I32)
            | (Value::I64(_), Type::I64)
            | (Value::F64(_), Type::F64)
            | (Value::Str(_), Type::String)
            | (Value::Variables(_), Type::RuntimeVariables) => true,
            (Value::Object(obj), Type::Class(name)) => {
                let class = obj.borrow().class.clone();
                self.class_chain(&class).contains(&name.as_str())
            }
            (Value::Struct(st), Type::Struct(name)) => &st.name == name,
            (Value::Array(arr), Type::Array { element, rank }) => {
                let arr = arr.borrow();
                &arr.element == element.as_ref() && arr.lengths.len() == *rank as usize
            }
            (Value::Delegate(closure), Type::Delegate(sig)) => closure
                .program
                .functions
                .get(closure.function)
                .is_some_and(|func| func.params == sig.params && func.ret == sig.ret),
            _ => false,
        }
    }

    pub fn default_value(&self, ty: &Type) -> Value {
        match ty {
            Type::Bool => Value::Bool(false),
            Type::I32 => Value::I32(0),
            Type::I64 => Value::I64(0),
            Type::F64 => Value::F64(0.0),
            Type::Struct(name) => Value::Struct(Box::new(StructValue::new(name.clone()))),
            _ => Value::Null,
        }
    }

    /// Most derived virtual override of `method` visible from `class`.
    pub fn resolve_virtual(&self, method: MethodId, class: &str) -> MethodId {
        let def = self.method_def(method);
        if !def.is_virtual {
            return method;
        }
        for owner in self.class_chain(class) {
            if let Some(id) = self.method(&format!("{owner}.{}", def.name)) {
                if self.method_def(id).is_virtual {
                    return id;
                }
            }
        }
        method
    }
}

fn def_type(def: &TypeDef) -> Type {
    match def.kind {
        TypeDefKind::Class => Type::Class(def.name.clone()),
        TypeDefKind::Struct => Type::Struct(def.name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        let mut md = Metadata::new();
        md.define_class("Shape", None, true);
        md.define_class("Circle", Some("Shape"), false);
        md.define_struct("Point");
        md
    }

    #[test]
    fn class_assignability_follows_base_chain() {
        let md = sample();
        let shape = Type::Class("Shape".into());
        let circle = Type::Class("Circle".into());
        assert!(md.is_assignable_from(&shape, &circle));
        assert!(!md.is_assignable_from(&circle, &shape));
        assert!(md.is_assignable_from(&Type::Object, &Type::Struct("Point".into())));
        assert!(md.is_abstract(&shape));
        assert!(!md.is_abstract(&circle));
    }

    #[test]
    fn virtual_resolution_prefers_most_derived_override() {
        let mut md = sample();
        let shape = Type::Class("Shape".into());
        let circle = Type::Class("Circle".into());
        let base = md.add_instance_method(&shape, "Name", vec![], Type::String, true, native(|_, _| Ok(Value::str("shape"))));
        let derived = md.add_instance_method(&circle, "Name", vec![], Type::String, true, native(|_, _| Ok(Value::str("circle"))));
        assert_eq!(md.resolve_virtual(base, "Circle"), derived);
        assert_eq!(md.resolve_virtual(base, "Shape"), base);
    }

    #[test]
    fn nullable_instance_test_sees_underlying_value() {
        let md = sample();
        assert!(md.is_instance(&Value::I32(3), &Type::nullable(Type::I32)));
        assert!(!md.is_instance(&Value::Null, &Type::Object));
        assert!(!md.is_instance(&Value::I64(3), &Type::I32));
    }
}
