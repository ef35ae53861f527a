use exprc_runtime::{Op, Type, Value};

use crate::error::CompileError;

/// Side table of constants that have no literal instruction form.
#[derive(Debug, Default)]
pub(crate) struct BoundConstants {
    values: Vec<Value>,
}

impl BoundConstants {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Index of `value`, appending it on first use.
    pub(crate) fn add(&mut self, value: &Value) -> u32 {
        if let Some(idx) = self.values.iter().position(|known| known.same(value)) {
            return idx as u32;
        }
        self.values.push(value.clone());
        (self.values.len() - 1) as u32
    }

    pub(crate) fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Literal instructions loading `value` as `ty`, or `None` when the value
/// must go through the constant table.
pub(crate) fn literal_ops(value: &Value, ty: &Type) -> Result<Option<Vec<Op>>, CompileError> {
    let op = match (value, ty.non_nullable()) {
        (Value::Null, _) if !ty.is_value_type() || ty.is_nullable() => Op::LdNull,
        (Value::Null, _) => {
            return Err(CompileError::contract(
                "Constant",
                format!("null constant of value type `{ty}`"),
            ))
        }
        (Value::Bool(v), Type::Bool) => Op::LdBool(*v),
        (Value::I32(v), Type::I32) => Op::LdI32(*v),
        (Value::I32(v), Type::I64) => Op::LdI64(i64::from(*v)),
        (Value::I32(v), Type::F64) => Op::LdF64(f64::from(*v)),
        (Value::I64(v), Type::I64) => Op::LdI64(*v),
        (Value::I64(v), Type::F64) => Op::LdF64(*v as f64),
        (Value::F64(v), Type::F64) => Op::LdF64(*v),
        (Value::Str(v), Type::String) => Op::LdStr(v.to_string()),
        _ => return Ok(None),
    };
    let wrap = ty.is_nullable() && !value.is_null();
    let mut ops = vec![op];
    if wrap {
        ops.push(Op::NewNullable(ty.clone()));
    }
    Ok(Some(ops))
}
