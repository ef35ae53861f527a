//! Instruction set and compiled program containers.

use std::fmt;

use crate::metadata::{CtorId, FieldId, MethodId};
use crate::types::Type;
use crate::value::Value;

/// Index into a function's local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalSlot(pub u32);

/// Index into a function's label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Operand of a method call instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    pub method: MethodId,
    /// Dispatch through the receiver's class; also null-checks the receiver.
    pub virtual_call: bool,
    pub tail: bool,
    /// Value-type receiver passed by address to a virtual call.
    pub constrained: Option<Type>,
    /// Arguments not counting the receiver.
    pub argc: u16,
    pub has_this: bool,
    pub returns_value: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,
    LdNull,
    LdBool(bool),
    LdI32(i32),
    LdI64(i64),
    LdF64(f64),
    LdStr(String),
    /// Load from the function's bound-constant table.
    LdConst(u32),
    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(LocalSlot),
    LdLocA(LocalSlot),
    StLoc(LocalSlot),
    /// Pop an address, push the value stored there.
    LdInd(Type),
    /// Pop a value, then an address, and store.
    StInd(Type),
    Dup,
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Not,
    And,
    Or,
    Xor,
    Ceq,
    Cgt,
    Clt,
    /// Unordered greater-than: true when either float operand is NaN.
    CgtUn,
    CltUn,
    Conv { to: Type, checked: bool },
    Br(Label),
    BrTrue(Label),
    BrFalse(Label),
    Call(CallSite),
    /// Pops arguments, then the delegate beneath them.
    CallDelegate { argc: u16, tail: bool, returns_value: bool },
    NewObj { ctor: CtorId, argc: u16 },
    /// Pop an address and store the zero value of the type there.
    InitObj(Type),
    LdFld(FieldId),
    LdFldA(FieldId),
    StFld(FieldId),
    LdSFld(FieldId),
    LdSFldA(FieldId),
    StSFld(FieldId),
    /// Pop a length, push a new vector of the element type.
    NewArr(Type),
    /// Pop `rank` lengths, push a new multi-dimensional array of `ty`.
    NewArrBounds { ty: Type, rank: u32 },
    LdLen,
    LdElem(Type),
    LdElemA(Type),
    StElem(Type),
    ArrGet { rank: u32 },
    ArrSet { rank: u32 },
    ArrAddr { rank: u32 },
    Box(Type),
    UnboxAny(Type),
    IsInst(Type),
    CastClass(Type),
    /// Pop the address of a nullable, push whether it holds a value.
    HasValue(Type),
    /// Pop the address of a nullable, push its value or the underlying default.
    GetValueOrDefault(Type),
    /// Pop the address of a nullable, push its value; faults when empty.
    NullableValue(Type),
    /// Wrap the underlying value on top of the stack.
    NewNullable(Type),
    /// Pop a value, push a fresh cell holding it.
    MakeCell,
    LdCell,
    /// Pop a cell, then a value, and store the value in the cell.
    StCell,
    LdCellA,
    LdCapture(u16),
    MakeClosure { function: u32, captures: u16 },
    MakeRuntimeVariables(u16),
    Throw,
    Ret,
}

impl Op {
    /// Values popped and pushed. `Ret` pops the return value when the function has one.
    pub fn stack_effect(&self, returns_value: bool) -> (u32, u32) {
        match self {
            Op::Nop | Op::Br(_) => (0, 0),
            Op::LdNull
            | Op::LdBool(_)
            | Op::LdI32(_)
            | Op::LdI64(_)
            | Op::LdF64(_)
            | Op::LdStr(_)
            | Op::LdConst(_)
            | Op::LdArg(_)
            | Op::LdArgA(_)
            | Op::LdLoc(_)
            | Op::LdLocA(_)
            | Op::LdSFld(_)
            | Op::LdSFldA(_)
            | Op::LdCapture(_) => (0, 1),
            Op::StArg(_) | Op::StLoc(_) | Op::Pop | Op::StSFld(_) => (1, 0),
            Op::BrTrue(_) | Op::BrFalse(_) | Op::InitObj(_) | Op::Throw => (1, 0),
            Op::LdInd(_)
            | Op::Neg
            | Op::Not
            | Op::Conv { .. }
            | Op::LdFld(_)
            | Op::LdFldA(_)
            | Op::NewArr(_)
            | Op::LdLen
            | Op::Box(_)
            | Op::UnboxAny(_)
            | Op::IsInst(_)
            | Op::CastClass(_)
            | Op::HasValue(_)
            | Op::GetValueOrDefault(_)
            | Op::NullableValue(_)
            | Op::NewNullable(_)
            | Op::MakeCell
            | Op::LdCell
            | Op::LdCellA => (1, 1),
            Op::StInd(_) | Op::StFld(_) | Op::StCell => (2, 0),
            Op::Dup => (1, 2),
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Rem
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::Ceq
            | Op::Cgt
            | Op::Clt
            | Op::CgtUn
            | Op::CltUn
            | Op::LdElem(_)
            | Op::LdElemA(_) => (2, 1),
            Op::StElem(_) => (3, 0),
            Op::NewArrBounds { rank, .. } => (*rank, 1),
            Op::ArrGet { rank } | Op::ArrAddr { rank } => (rank + 1, 1),
            Op::ArrSet { rank } => (rank + 2, 0),
            Op::Call(site) => (
                u32::from(site.argc) + u32::from(site.has_this),
                u32::from(site.returns_value),
            ),
            Op::CallDelegate {
                argc, returns_value, ..
            } => (u32::from(*argc) + 1, u32::from(*returns_value)),
            Op::NewObj { argc, .. } => (u32::from(*argc), 1),
            Op::MakeClosure { captures, .. } => (u32::from(*captures), 1),
            Op::MakeRuntimeVariables(count) => (u32::from(*count), 1),
            Op::Ret => (u32::from(returns_value), 0),
        }
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Br(_) | Op::Ret | Op::Throw)
    }

    pub fn branch_target(&self) -> Option<Label> {
        match self {
            Op::Br(label) | Op::BrTrue(label) | Op::BrFalse(label) => Some(*label),
            _ => None,
        }
    }
}

/// Position of a marked label and the evaluation-stack depth there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelPos {
    pub offset: usize,
    pub depth: u32,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub locals: Vec<Type>,
    pub code: Vec<Op>,
    pub labels: Vec<LabelPos>,
    pub constants: Vec<Value>,
    pub max_stack: u32,
}

impl Function {
    pub fn returns_value(&self) -> bool {
        !self.ret.is_void()
    }
}

/// All functions produced by compiling one top-level lambda.
#[derive(Debug, Clone)]
pub struct Program {
    pub functions: Vec<Function>,
    pub entry: usize,
}

impl Program {
    pub fn entry_function(&self) -> &Function {
        &self.functions[self.entry]
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::LdBool(v) => write!(f, "ldbool {v}"),
            Op::LdI32(v) => write!(f, "ldi32 {v}"),
            Op::LdI64(v) => write!(f, "ldi64 {v}"),
            Op::LdF64(v) => write!(f, "ldf64 {v:?}"),
            Op::LdStr(v) => write!(f, "ldstr {v:?}"),
            Op::LdConst(idx) => write!(f, "ldconst #{idx}"),
            Op::LdArg(idx) => write!(f, "ldarg {idx}"),
            Op::LdArgA(idx) => write!(f, "ldarga {idx}"),
            Op::StArg(idx) => write!(f, "starg {idx}"),
            Op::LdLoc(slot) => write!(f, "ldloc {}", slot.0),
            Op::LdLocA(slot) => write!(f, "ldloca {}", slot.0),
            Op::StLoc(slot) => write!(f, "stloc {}", slot.0),
            Op::LdInd(ty) => write!(f, "ldind {ty}"),
            Op::StInd(ty) => write!(f, "stind {ty}"),
            Op::Conv { to, checked } => {
                write!(f, "conv{} {to}", if *checked { ".ovf" } else { "" })
            }
            Op::Br(label) => write!(f, "br L{}", label.0),
            Op::BrTrue(label) => write!(f, "brtrue L{}", label.0),
            Op::BrFalse(label) => write!(f, "brfalse L{}", label.0),
            Op::Call(site) => {
                let opcode = if site.virtual_call { "callvirt" } else { "call" };
                if site.tail {
                    write!(f, "tail.")?;
                }
                if let Some(ty) = &site.constrained {
                    write!(f, "constrained.{ty} ")?;
                }
                write!(f, "{opcode} m{} argc={}", site.method.0, site.argc)
            }
            Op::CallDelegate { argc, tail, .. } => {
                write!(f, "{}calldelegate argc={argc}", if *tail { "tail." } else { "" })
            }
            Op::NewObj { ctor, argc } => write!(f, "newobj c{} argc={argc}", ctor.0),
            Op::InitObj(ty) => write!(f, "initobj {ty}"),
            Op::LdFld(id) => write!(f, "ldfld f{}", id.0),
            Op::LdFldA(id) => write!(f, "ldflda f{}", id.0),
            Op::StFld(id) => write!(f, "stfld f{}", id.0),
            Op::LdSFld(id) => write!(f, "ldsfld f{}", id.0),
            Op::LdSFldA(id) => write!(f, "ldsflda f{}", id.0),
            Op::StSFld(id) => write!(f, "stsfld f{}", id.0),
            Op::NewArr(ty) => write!(f, "newarr {ty}"),
            Op::NewArrBounds { ty, rank } => write!(f, "newarr.bounds {ty} rank={rank}"),
            Op::LdElem(ty) => write!(f, "ldelem {ty}"),
            Op::LdElemA(ty) => write!(f, "ldelema {ty}"),
            Op::StElem(ty) => write!(f, "stelem {ty}"),
            Op::ArrGet { rank } => write!(f, "arr.get rank={rank}"),
            Op::ArrSet { rank } => write!(f, "arr.set rank={rank}"),
            Op::ArrAddr { rank } => write!(f, "arr.addr rank={rank}"),
            Op::Box(ty) => write!(f, "box {ty}"),
            Op::UnboxAny(ty) => write!(f, "unbox.any {ty}"),
            Op::IsInst(ty) => write!(f, "isinst {ty}"),
            Op::CastClass(ty) => write!(f, "castclass {ty}"),
            Op::HasValue(ty) => write!(f, "hasvalue {ty}"),
            Op::GetValueOrDefault(ty) => write!(f, "getvalueordefault {ty}"),
            Op::NullableValue(ty) => write!(f, "nullablevalue {ty}"),
            Op::NewNullable(ty) => write!(f, "newnullable {ty}"),
            Op::LdCapture(idx) => write!(f, "ldcapture {idx}"),
            Op::MakeClosure { function, captures } => {
                write!(f, "makeclosure fn{function} captures={captures}")
            }
            Op::MakeRuntimeVariables(count) => write!(f, "makeruntimevariables {count}"),
            simple => {
                let name = format!("{simple:?}");
                write!(f, "{}", name.to_lowercase())
            }
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".function {}(", self.name)?;
        for (idx, param) in self.params.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        writeln!(f, ") -> {}", self.ret)?;
        writeln!(f, "  .maxstack {}", self.max_stack)?;
        for (idx, ty) in self.locals.iter().enumerate() {
            writeln!(f, "  .local {idx}: {ty}")?;
        }
        for (idx, value) in self.constants.iter().enumerate() {
            writeln!(f, "  .const #{idx} = {value}")?;
        }
        for (offset, op) in self.code.iter().enumerate() {
            for (label, pos) in self.labels.iter().enumerate() {
                if pos.offset == offset {
                    writeln!(f, "L{label}:")?;
                }
            }
            writeln!(f, "  {offset:04}: {op}")?;
        }
        for (label, pos) in self.labels.iter().enumerate() {
            if pos.offset == self.code.len() {
                writeln!(f, "L{label}:")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, function) in self.functions.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            if idx == self.entry {
                writeln!(f, "; entry")?;
            }
            write!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_effect_counts_receiver_and_result() {
        let site = CallSite {
            method: MethodId(0),
            virtual_call: true,
            tail: false,
            constrained: None,
            argc: 2,
            has_this: true,
            returns_value: false,
        };
        assert_eq!(Op::Call(site).stack_effect(false), (3, 0));
        assert_eq!(Op::ArrSet { rank: 2 }.stack_effect(false), (4, 0));
        assert_eq!(Op::Ret.stack_effect(true), (1, 0));
        assert_eq!(Op::Ret.stack_effect(false), (0, 0));
    }

    #[test]
    fn simple_ops_render_lowercase() {
        assert_eq!(Op::Dup.to_string(), "dup");
        assert_eq!(Op::CgtUn.to_string(), "cgtun");
        assert_eq!(Op::LdI32(5).to_string(), "ldi32 5");
        assert_eq!(
            Op::Conv { to: Type::I32, checked: true }.to_string(),
            "conv.ovf i32"
        );
    }
}
