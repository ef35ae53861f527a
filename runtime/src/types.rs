//! Static type model shared by the compiler and the machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A static type as seen by trees, metadata and instructions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    Bool,
    I32,
    I64,
    F64,
    String,
    Object,
    /// `Nullable<T>` over a non-nullable value type.
    Nullable(Box<Type>),
    /// User value type registered in metadata.
    Struct(String),
    /// User reference type registered in metadata.
    Class(String),
    /// Rank 1 is a zero-based vector; higher ranks are true multi-dimensional arrays.
    Array { element: Box<Type>, rank: u32 },
    /// Managed pointer; only valid for parameters and locals.
    ByRef(Box<Type>),
    Delegate(Box<Signature>),
    RuntimeVariables,
}

/// Parameter/return shape of a method or delegate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl Signature {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }

    pub fn has_by_ref_param(&self) -> bool {
        self.params.iter().any(Type::is_by_ref)
    }
}

impl Type {
    pub fn nullable(inner: Type) -> Type {
        Type::Nullable(Box::new(inner))
    }

    pub fn by_ref(inner: Type) -> Type {
        Type::ByRef(Box::new(inner))
    }

    pub fn vector(element: Type) -> Type {
        Type::Array {
            element: Box::new(element),
            rank: 1,
        }
    }

    pub fn array(element: Type, rank: u32) -> Type {
        Type::Array {
            element: Box::new(element),
            rank,
        }
    }

    pub fn delegate(params: Vec<Type>, ret: Type) -> Type {
        Type::Delegate(Box::new(Signature::new(params, ret)))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            Type::Bool | Type::I32 | Type::I64 | Type::F64 | Type::Nullable(_) | Type::Struct(_)
        )
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Type::Nullable(_))
    }

    pub fn is_by_ref(&self) -> bool {
        matches!(self, Type::ByRef(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::I32 | Type::I64 | Type::F64)
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, Type::F64)
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, Type::I32 | Type::I64)
    }

    /// A single-dimension, zero-based array.
    pub fn is_vector(&self) -> bool {
        matches!(self, Type::Array { rank: 1, .. })
    }

    /// Strip one `Nullable` wrapper, if any.
    pub fn non_nullable(&self) -> &Type {
        match self {
            Type::Nullable(inner) => inner,
            other => other,
        }
    }

    /// Wrap a non-nullable value type in `Nullable`; other types are returned as-is.
    pub fn to_nullable(&self) -> Type {
        if self.is_value_type() && !self.is_nullable() {
            Type::nullable(self.clone())
        } else {
            self.clone()
        }
    }

    /// Element type of a by-ref or array type.
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::ByRef(inner) => Some(inner),
            Type::Array { element, .. } => Some(element),
            _ => None,
        }
    }

    pub fn rank(&self) -> u32 {
        match self {
            Type::Array { rank, .. } => *rank,
            _ => 0,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Type::Delegate(sig) => Some(sig),
            _ => None,
        }
    }

    /// Name of a user-defined type, if this is one.
    pub fn def_name(&self) -> Option<&str> {
        match self {
            Type::Struct(name) | Type::Class(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F64 => write!(f, "f64"),
            Type::String => write!(f, "string"),
            Type::Object => write!(f, "object"),
            Type::Nullable(inner) => write!(f, "{inner}?"),
            Type::Struct(name) | Type::Class(name) => write!(f, "{name}"),
            Type::Array { element, rank } => {
                write!(f, "{element}[")?;
                for _ in 1..*rank {
                    write!(f, ",")?;
                }
                write!(f, "]")
            }
            Type::ByRef(inner) => write!(f, "{inner}&"),
            Type::Delegate(sig) => {
                write!(f, "fn(")?;
                for (idx, param) in sig.params.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ") -> {}", sig.ret)
            }
            Type::RuntimeVariables => write!(f, "runtime-variables"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nullable_wraps_value_types_only() {
        assert_eq!(Type::I32.to_nullable(), Type::nullable(Type::I32));
        assert_eq!(Type::String.to_nullable(), Type::String);
        assert_eq!(
            Type::nullable(Type::I32).to_nullable(),
            Type::nullable(Type::I32)
        );
        assert_eq!(Type::nullable(Type::F64).non_nullable(), &Type::F64);
    }

    #[test]
    fn display_renders_arrays_and_delegates() {
        assert_eq!(Type::array(Type::I32, 2).to_string(), "i32[,]");
        assert_eq!(
            Type::delegate(vec![Type::by_ref(Type::I32)], Type::Bool).to_string(),
            "fn(i32&) -> bool"
        );
    }
}
