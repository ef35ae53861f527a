//! Runtime values and storage addresses.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::metadata::FieldId;
use crate::program::Program;
use crate::types::Type;

pub type ObjRef = Rc<RefCell<Object>>;
pub type ArrayRef = Rc<RefCell<ArrayObject>>;
pub type CellRef = Rc<RefCell<Value>>;

/// Heap instance of a class. `items` is backing storage for native list-like classes.
#[derive(Debug, Clone)]
pub struct Object {
    pub class: String,
    pub fields: BTreeMap<FieldId, Value>,
    pub items: Vec<Value>,
}

impl Object {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: BTreeMap::new(),
            items: Vec::new(),
        }
    }
}

/// Unboxed user value type. Copied on every load.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub name: String,
    pub fields: BTreeMap<FieldId, Value>,
}

impl StructValue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct ArrayObject {
    pub element: Type,
    pub lengths: Vec<usize>,
    pub items: Vec<Value>,
}

impl ArrayObject {
    /// Row-major flat index for a multi-dimensional access.
    pub fn flat_index(&self, indexes: &[i64]) -> Option<usize> {
        if indexes.len() != self.lengths.len() {
            return None;
        }
        let mut flat = 0usize;
        for (index, len) in indexes.iter().zip(&self.lengths) {
            let index = usize::try_from(*index).ok()?;
            if index >= *len {
                return None;
            }
            flat = flat * len + index;
        }
        Some(flat)
    }
}

/// A compiled function bound to its captured cells.
pub struct Closure {
    pub program: Rc<Program>,
    pub function: usize,
    pub captures: Vec<CellRef>,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .program
            .functions
            .get(self.function)
            .map(|func| func.name.as_str())
            .unwrap_or("?");
        f.debug_struct("Closure")
            .field("function", &name)
            .field("captures", &self.captures.len())
            .finish()
    }
}

/// Storage location produced by address-of instructions.
#[derive(Debug, Clone)]
pub enum Address {
    Local { frame: usize, slot: u32 },
    Arg { frame: usize, index: u16 },
    Cell(CellRef),
    ObjectField(ObjRef, FieldId),
    StructField(Box<Address>, FieldId),
    Element(ArrayRef, usize),
    Static(FieldId),
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(Rc<str>),
    Object(ObjRef),
    Struct(Box<StructValue>),
    Array(ArrayRef),
    Delegate(Rc<Closure>),
    Cell(CellRef),
    Variables(Rc<Vec<CellRef>>),
    Addr(Address),
}

impl Value {
    pub fn str(text: &str) -> Value {
        Value::Str(Rc::from(text))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short description of the dynamic shape, used in fault messages.
    pub fn kind_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::I32(_) => "i32".to_string(),
            Value::I64(_) => "i64".to_string(),
            Value::F64(_) => "f64".to_string(),
            Value::Str(_) => "string".to_string(),
            Value::Object(obj) => obj.borrow().class.clone(),
            Value::Struct(st) => st.name.clone(),
            Value::Array(_) => "array".to_string(),
            Value::Delegate(_) => "delegate".to_string(),
            Value::Cell(_) => "cell".to_string(),
            Value::Variables(_) => "runtime-variables".to_string(),
            Value::Addr(_) => "address".to_string(),
        }
    }

    /// Identity for reference values, structural equality for everything else.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Delegate(a), Value::Delegate(b)) => Rc::ptr_eq(a, b),
            (Value::Cell(a), Value::Cell(b)) => Rc::ptr_eq(a, b),
            (Value::Variables(a), Value::Variables(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}L"),
            Value::F64(v) => write!(f, "{v:?}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Array(arr) => {
                let arr = arr.borrow();
                write!(f, "[")?;
                for (idx, item) in arr.items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            other => write!(f, "<{}>", other.kind_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_index_is_row_major_and_bounds_checked() {
        let arr = ArrayObject {
            element: Type::I32,
            lengths: vec![2, 3],
            items: vec![Value::I32(0); 6],
        };
        assert_eq!(arr.flat_index(&[1, 2]), Some(5));
        assert_eq!(arr.flat_index(&[0, 1]), Some(1));
        assert_eq!(arr.flat_index(&[2, 0]), None);
        assert_eq!(arr.flat_index(&[-1, 0]), None);
        assert_eq!(arr.flat_index(&[0]), None);
    }

    #[test]
    fn references_compare_by_identity() {
        let a = Rc::new(RefCell::new(Object::new("Counter")));
        let b = Rc::new(RefCell::new(Object::new("Counter")));
        assert_eq!(Value::Object(a.clone()), Value::Object(a));
        assert_ne!(Value::Object(b.clone()), Value::Object(Rc::new(RefCell::new(Object::new("Counter")))));
        assert_eq!(Value::str("x"), Value::str("x"));
        assert_eq!(Value::from(None::<i32>), Value::Null);
    }
}
