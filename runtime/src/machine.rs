//! Reference interpreter for compiled programs.
//!
//! The machine executes one function per Rust call frame. Branches reset the
//! evaluation stack to the depth recorded for the target label, so code that
//! jumps out of a partially evaluated expression stays well formed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::metadata::{FieldId, Metadata};
use crate::program::{Function, Label, Op, Program};
use crate::types::Type;
use crate::value::{Address, ArrayObject, ArrayRef, CellRef, Closure, Value};

const MAX_CALL_DEPTH: usize = 512;

#[derive(Debug, Error)]
pub enum Fault {
    #[error("null reference")]
    NullReference,
    #[error("invalid cast from {from} to {to}")]
    InvalidCast { from: String, to: String },
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("arithmetic overflow")]
    Overflow,
    #[error("division by zero")]
    DivideByZero,
    #[error("nullable object must have a value")]
    NullableWithoutValue,
    #[error("call depth exceeded")]
    StackOverflow,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("unhandled exception: {0}")]
    Exception(Value),
    #[error("malformed program: {0}")]
    Malformed(String),
}

fn malformed(message: impl Into<String>) -> Fault {
    Fault::Malformed(message.into())
}

struct Frame {
    args: Vec<Value>,
    locals: Vec<Value>,
    captures: Vec<CellRef>,
}

pub struct Machine<'m> {
    metadata: &'m Metadata,
    frames: Vec<Frame>,
    statics: HashMap<FieldId, Value>,
}

impl<'m> Machine<'m> {
    pub fn new(metadata: &'m Metadata) -> Self {
        Self {
            metadata,
            frames: Vec::new(),
            statics: HashMap::new(),
        }
    }

    pub fn metadata(&self) -> &'m Metadata {
        self.metadata
    }

    /// Run the program's entry function. Void functions produce `Value::Null`.
    pub fn run(&mut self, program: &Rc<Program>, args: Vec<Value>) -> Result<Value, Fault> {
        self.execute(program, program.entry, args, Vec::new())
    }

    pub fn invoke(&mut self, closure: &Closure, args: Vec<Value>) -> Result<Value, Fault> {
        self.execute(
            &closure.program,
            closure.function,
            args,
            closure.captures.clone(),
        )
    }

    pub fn static_field(&self, field: FieldId) -> Value {
        self.statics
            .get(&field)
            .cloned()
            .unwrap_or_else(|| self.field_default(field))
    }

    pub fn load(&self, addr: &Address) -> Result<Value, Fault> {
        match addr {
            Address::Local { frame, slot } => self
                .frames
                .get(*frame)
                .and_then(|f| f.locals.get(*slot as usize))
                .cloned()
                .ok_or_else(|| malformed("dangling local address")),
            Address::Arg { frame, index } => self
                .frames
                .get(*frame)
                .and_then(|f| f.args.get(*index as usize))
                .cloned()
                .ok_or_else(|| malformed("dangling argument address")),
            Address::Cell(cell) => Ok(cell.borrow().clone()),
            Address::ObjectField(obj, field) => Ok(obj
                .borrow()
                .fields
                .get(field)
                .cloned()
                .unwrap_or_else(|| self.field_default(*field))),
            Address::StructField(base, field) => match self.load(base)? {
                Value::Struct(st) => Ok(st
                    .fields
                    .get(field)
                    .cloned()
                    .unwrap_or_else(|| self.field_default(*field))),
                Value::Null => Err(Fault::NullReference),
                other => Err(malformed(format!("field access on {}", other.kind_name()))),
            },
            Address::Element(arr, index) => arr
                .borrow()
                .items
                .get(*index)
                .cloned()
                .ok_or(Fault::IndexOutOfRange),
            Address::Static(field) => Ok(self.static_field(*field)),
        }
    }

    pub fn store(&mut self, addr: &Address, value: Value) -> Result<(), Fault> {
        match addr {
            Address::Local { frame, slot } => {
                let target = self
                    .frames
                    .get_mut(*frame)
                    .and_then(|f| f.locals.get_mut(*slot as usize))
                    .ok_or_else(|| malformed("dangling local address"))?;
                *target = value;
            }
            Address::Arg { frame, index } => {
                let target = self
                    .frames
                    .get_mut(*frame)
                    .and_then(|f| f.args.get_mut(*index as usize))
                    .ok_or_else(|| malformed("dangling argument address"))?;
                *target = value;
            }
            Address::Cell(cell) => *cell.borrow_mut() = value,
            Address::ObjectField(obj, field) => {
                obj.borrow_mut().fields.insert(*field, value);
            }
            Address::StructField(base, field) => match self.load(base)? {
                Value::Struct(mut st) => {
                    st.fields.insert(*field, value);
                    self.store(base, Value::Struct(st))?;
                }
                Value::Null => return Err(Fault::NullReference),
                other => {
                    return Err(malformed(format!("field store on {}", other.kind_name())))
                }
            },
            Address::Element(arr, index) => {
                let mut arr = arr.borrow_mut();
                let slot = arr.items.get_mut(*index).ok_or(Fault::IndexOutOfRange)?;
                *slot = value;
            }
            Address::Static(field) => {
                self.statics.insert(*field, value);
            }
        }
        Ok(())
    }

    fn field_default(&self, field: FieldId) -> Value {
        let def = self.metadata.field_def(field);
        match &def.literal {
            Some(value) => value.clone(),
            None => self.metadata.default_value(&def.ty),
        }
    }

    fn execute(
        &mut self,
        program: &Rc<Program>,
        function: usize,
        args: Vec<Value>,
        captures: Vec<CellRef>,
    ) -> Result<Value, Fault> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(Fault::StackOverflow);
        }
        let func = program
            .functions
            .get(function)
            .ok_or_else(|| malformed(format!("no function {function}")))?;
        if args.len() != func.params.len() {
            return Err(malformed(format!(
                "`{}` expects {} arguments, got {}",
                func.name,
                func.params.len(),
                args.len()
            )));
        }
        let locals = func
            .locals
            .iter()
            .map(|ty| self.metadata.default_value(ty))
            .collect();
        self.frames.push(Frame {
            args,
            locals,
            captures,
        });
        let frame = self.frames.len() - 1;
        let result = self.run_frame(program, func, frame);
        self.frames.truncate(frame);
        result
    }

    fn run_frame(&mut self, program: &Rc<Program>, func: &Function, frame: usize) -> Result<Value, Fault> {
        let md = self.metadata;
        let mut stack: Vec<Value> = Vec::with_capacity(func.max_stack as usize);
        let mut pc = 0usize;
        while let Some(op) = func.code.get(pc) {
            pc += 1;
            match op {
                Op::Nop => {}
                Op::LdNull => stack.push(Value::Null),
                Op::LdBool(v) => stack.push(Value::Bool(*v)),
                Op::LdI32(v) => stack.push(Value::I32(*v)),
                Op::LdI64(v) => stack.push(Value::I64(*v)),
                Op::LdF64(v) => stack.push(Value::F64(*v)),
                Op::LdStr(v) => stack.push(Value::str(v)),
                Op::LdConst(idx) => {
                    let value = func
                        .constants
                        .get(*idx as usize)
                        .cloned()
                        .ok_or_else(|| malformed(format!("no constant #{idx}")))?;
                    stack.push(value);
                }
                Op::LdArg(idx) => {
                    let value = self.load(&Address::Arg { frame, index: *idx })?;
                    stack.push(value);
                }
                Op::LdArgA(idx) => stack.push(Value::Addr(Address::Arg { frame, index: *idx })),
                Op::StArg(idx) => {
                    let value = pop(&mut stack)?;
                    self.store(&Address::Arg { frame, index: *idx }, value)?;
                }
                Op::LdLoc(slot) => {
                    let value = self.load(&Address::Local { frame, slot: slot.0 })?;
                    stack.push(value);
                }
                Op::LdLocA(slot) => stack.push(Value::Addr(Address::Local { frame, slot: slot.0 })),
                Op::StLoc(slot) => {
                    let value = pop(&mut stack)?;
                    self.store(&Address::Local { frame, slot: slot.0 }, value)?;
                }
                Op::LdInd(_) => {
                    let addr = pop_addr(&mut stack)?;
                    stack.push(self.load(&addr)?);
                }
                Op::StInd(_) => {
                    let value = pop(&mut stack)?;
                    let addr = pop_addr(&mut stack)?;
                    self.store(&addr, value)?;
                }
                Op::Dup => {
                    let top = stack.last().cloned().ok_or_else(|| malformed("stack underflow"))?;
                    stack.push(top);
                }
                Op::Pop => {
                    pop(&mut stack)?;
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem | Op::And | Op::Or | Op::Xor => {
                    let right = pop(&mut stack)?;
                    let left = pop(&mut stack)?;
                    stack.push(arithmetic(op, left, right)?);
                }
                Op::Ceq | Op::Cgt | Op::Clt | Op::CgtUn | Op::CltUn => {
                    let right = pop(&mut stack)?;
                    let left = pop(&mut stack)?;
                    stack.push(Value::Bool(compare(op, &left, &right)?));
                }
                Op::Neg => {
                    let value = match pop(&mut stack)? {
                        Value::I32(v) => Value::I32(v.wrapping_neg()),
                        Value::I64(v) => Value::I64(v.wrapping_neg()),
                        Value::F64(v) => Value::F64(-v),
                        other => return Err(malformed(format!("neg on {}", other.kind_name()))),
                    };
                    stack.push(value);
                }
                Op::Not => {
                    let value = match pop(&mut stack)? {
                        Value::Bool(v) => Value::Bool(!v),
                        Value::I32(v) => Value::I32(!v),
                        Value::I64(v) => Value::I64(!v),
                        other => return Err(malformed(format!("not on {}", other.kind_name()))),
                    };
                    stack.push(value);
                }
                Op::Conv { to, checked } => {
                    let value = pop(&mut stack)?;
                    stack.push(convert(value, to, *checked)?);
                }
                Op::Br(label) => {
                    pc = jump(func, *label, &mut stack)?;
                }
                Op::BrTrue(label) | Op::BrFalse(label) => {
                    let taken = truthy(&pop(&mut stack)?)? == matches!(op, Op::BrTrue(_));
                    if taken {
                        pc = jump(func, *label, &mut stack)?;
                    }
                }
                Op::Call(site) => {
                    let mut args = pop_n(&mut stack, site.argc as usize)?;
                    let mut method = site.method;
                    if site.has_this {
                        let this = pop(&mut stack)?;
                        if site.virtual_call && site.constrained.is_none() {
                            match &this {
                                Value::Null => return Err(Fault::NullReference),
                                Value::Object(obj) => {
                                    let class = obj.borrow().class.clone();
                                    method = md.resolve_virtual(method, &class);
                                }
                                _ => {}
                            }
                        }
                        args.insert(0, this);
                    }
                    let def = md.method_def(method);
                    log::trace!("call {} tail={}", def.key, site.tail);
                    let body = Rc::clone(&def.body);
                    let result = body(self, &args)?;
                    if site.returns_value {
                        stack.push(result);
                    }
                }
                Op::CallDelegate {
                    argc,
                    returns_value,
                    ..
                } => {
                    let args = pop_n(&mut stack, *argc as usize)?;
                    let result = match pop(&mut stack)? {
                        Value::Delegate(closure) => self.invoke(&closure, args)?,
                        Value::Null => return Err(Fault::NullReference),
                        other => {
                            return Err(Fault::InvalidCast {
                                from: other.kind_name(),
                                to: "delegate".to_string(),
                            })
                        }
                    };
                    if *returns_value {
                        stack.push(result);
                    }
                }
                Op::NewObj { ctor, argc } => {
                    let args = pop_n(&mut stack, *argc as usize)?;
                    let body = Rc::clone(&md.ctor_def(*ctor).body);
                    stack.push(body(self, &args)?);
                }
                Op::InitObj(ty) => {
                    let addr = pop_addr(&mut stack)?;
                    self.store(&addr, md.default_value(ty))?;
                }
                Op::LdFld(field) => {
                    let value = match pop(&mut stack)? {
                        Value::Object(obj) => self.load(&Address::ObjectField(obj, *field))?,
                        Value::Struct(st) => st
                            .fields
                            .get(field)
                            .cloned()
                            .unwrap_or_else(|| self.field_default(*field)),
                        Value::Addr(addr) => {
                            self.load(&Address::StructField(Box::new(addr), *field))?
                        }
                        Value::Null => return Err(Fault::NullReference),
                        other => return Err(malformed(format!("ldfld on {}", other.kind_name()))),
                    };
                    stack.push(value);
                }
                Op::LdFldA(field) => {
                    let addr = match pop(&mut stack)? {
                        Value::Object(obj) => Address::ObjectField(obj, *field),
                        Value::Addr(addr) => Address::StructField(Box::new(addr), *field),
                        Value::Null => return Err(Fault::NullReference),
                        other => return Err(malformed(format!("ldflda on {}", other.kind_name()))),
                    };
                    stack.push(Value::Addr(addr));
                }
                Op::StFld(field) => {
                    let value = pop(&mut stack)?;
                    match pop(&mut stack)? {
                        Value::Object(obj) => self.store(&Address::ObjectField(obj, *field), value)?,
                        Value::Addr(addr) => {
                            self.store(&Address::StructField(Box::new(addr), *field), value)?
                        }
                        Value::Null => return Err(Fault::NullReference),
                        other => return Err(malformed(format!("stfld on {}", other.kind_name()))),
                    }
                }
                Op::LdSFld(field) => stack.push(self.static_field(*field)),
                Op::LdSFldA(field) => stack.push(Value::Addr(Address::Static(*field))),
                Op::StSFld(field) => {
                    let value = pop(&mut stack)?;
                    self.statics.insert(*field, value);
                }
                Op::NewArr(element) => {
                    let len = length(&pop(&mut stack)?)?;
                    stack.push(new_array(md, element.clone(), vec![len]));
                }
                Op::NewArrBounds { ty, rank } => {
                    let element = ty
                        .element()
                        .cloned()
                        .ok_or_else(|| malformed(format!("newarr.bounds of {ty}")))?;
                    let lengths = pop_n(&mut stack, *rank as usize)?
                        .iter()
                        .map(length)
                        .collect::<Result<Vec<_>, _>>()?;
                    stack.push(new_array(md, element, lengths));
                }
                Op::LdLen => {
                    let arr = pop_array(&mut stack)?;
                    let len = arr.borrow().items.len();
                    stack.push(Value::I32(i32::try_from(len).map_err(|_| Fault::Overflow)?));
                }
                Op::LdElem(_) | Op::LdElemA(_) => {
                    let index = pop_n(&mut stack, 1)?;
                    let arr = pop_array(&mut stack)?;
                    let flat = element_index(&arr, &index)?;
                    let addr = Address::Element(arr, flat);
                    if matches!(op, Op::LdElemA(_)) {
                        stack.push(Value::Addr(addr));
                    } else {
                        stack.push(self.load(&addr)?);
                    }
                }
                Op::StElem(_) => {
                    let value = pop(&mut stack)?;
                    let index = pop_n(&mut stack, 1)?;
                    let arr = pop_array(&mut stack)?;
                    let flat = element_index(&arr, &index)?;
                    self.store(&Address::Element(arr, flat), value)?;
                }
                Op::ArrGet { rank } | Op::ArrAddr { rank } => {
                    let indexes = pop_n(&mut stack, *rank as usize)?;
                    let arr = pop_array(&mut stack)?;
                    let flat = element_index(&arr, &indexes)?;
                    let addr = Address::Element(arr, flat);
                    if matches!(op, Op::ArrAddr { .. }) {
                        stack.push(Value::Addr(addr));
                    } else {
                        stack.push(self.load(&addr)?);
                    }
                }
                Op::ArrSet { rank } => {
                    let value = pop(&mut stack)?;
                    let indexes = pop_n(&mut stack, *rank as usize)?;
                    let arr = pop_array(&mut stack)?;
                    let flat = element_index(&arr, &indexes)?;
                    self.store(&Address::Element(arr, flat), value)?;
                }
                Op::Box(_) | Op::NewNullable(_) => {}
                Op::UnboxAny(ty) => {
                    let value = pop(&mut stack)?;
                    stack.push(unbox(md, value, ty)?);
                }
                Op::IsInst(ty) => {
                    let value = pop(&mut stack)?;
                    if md.is_instance(&value, ty) {
                        stack.push(value);
                    } else {
                        stack.push(Value::Null);
                    }
                }
                Op::CastClass(ty) => {
                    let value = pop(&mut stack)?;
                    stack.push(cast(md, value, ty)?);
                }
                Op::HasValue(_) => {
                    let addr = pop_addr(&mut stack)?;
                    let has_value = !self.load(&addr)?.is_null();
                    stack.push(Value::Bool(has_value));
                }
                Op::GetValueOrDefault(ty) => {
                    let addr = pop_addr(&mut stack)?;
                    let value = match self.load(&addr)? {
                        Value::Null => md.default_value(ty.non_nullable()),
                        value => value,
                    };
                    stack.push(value);
                }
                Op::NullableValue(_) => {
                    let addr = pop_addr(&mut stack)?;
                    match self.load(&addr)? {
                        Value::Null => return Err(Fault::NullableWithoutValue),
                        value => stack.push(value),
                    }
                }
                Op::MakeCell => {
                    let value = pop(&mut stack)?;
                    stack.push(Value::Cell(Rc::new(RefCell::new(value))));
                }
                Op::LdCell => {
                    let cell = pop_cell(&mut stack)?;
                    let value = cell.borrow().clone();
                    stack.push(value);
                }
                Op::StCell => {
                    let cell = pop_cell(&mut stack)?;
                    let value = pop(&mut stack)?;
                    *cell.borrow_mut() = value;
                }
                Op::LdCellA => {
                    let cell = pop_cell(&mut stack)?;
                    stack.push(Value::Addr(Address::Cell(cell)));
                }
                Op::LdCapture(idx) => {
                    let cell = self.frames[frame]
                        .captures
                        .get(*idx as usize)
                        .cloned()
                        .ok_or_else(|| malformed(format!("no capture {idx}")))?;
                    stack.push(Value::Cell(cell));
                }
                Op::MakeClosure { function, captures } => {
                    let cells = pop_n(&mut stack, *captures as usize)?
                        .into_iter()
                        .map(into_cell)
                        .collect::<Result<Vec<_>, _>>()?;
                    stack.push(Value::Delegate(Rc::new(Closure {
                        program: Rc::clone(program),
                        function: *function as usize,
                        captures: cells,
                    })));
                }
                Op::MakeRuntimeVariables(count) => {
                    let cells = pop_n(&mut stack, *count as usize)?
                        .into_iter()
                        .map(into_cell)
                        .collect::<Result<Vec<_>, _>>()?;
                    stack.push(Value::Variables(Rc::new(cells)));
                }
                Op::Throw => {
                    return match pop(&mut stack)? {
                        Value::Null => Err(Fault::NullReference),
                        value => Err(Fault::Exception(value)),
                    };
                }
                Op::Ret => return finish(func, &mut stack),
            }
        }
        finish(func, &mut stack)
    }
}

fn finish(func: &Function, stack: &mut Vec<Value>) -> Result<Value, Fault> {
    if func.returns_value() {
        pop(stack)
    } else {
        Ok(Value::Null)
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, Fault> {
    stack.pop().ok_or_else(|| malformed("stack underflow"))
}

/// Pop `count` values, returned in push order.
fn pop_n(stack: &mut Vec<Value>, count: usize) -> Result<Vec<Value>, Fault> {
    if stack.len() < count {
        return Err(malformed("stack underflow"));
    }
    Ok(stack.split_off(stack.len() - count))
}

fn pop_addr(stack: &mut Vec<Value>) -> Result<Address, Fault> {
    match pop(stack)? {
        Value::Addr(addr) => Ok(addr),
        Value::Null => Err(Fault::NullReference),
        other => Err(malformed(format!("expected address, found {}", other.kind_name()))),
    }
}

fn pop_array(stack: &mut Vec<Value>) -> Result<ArrayRef, Fault> {
    match pop(stack)? {
        Value::Array(arr) => Ok(arr),
        Value::Null => Err(Fault::NullReference),
        other => Err(malformed(format!("expected array, found {}", other.kind_name()))),
    }
}

fn pop_cell(stack: &mut Vec<Value>) -> Result<CellRef, Fault> {
    into_cell(pop(stack)?)
}

fn into_cell(value: Value) -> Result<CellRef, Fault> {
    match value {
        Value::Cell(cell) => Ok(cell),
        other => Err(malformed(format!("expected cell, found {}", other.kind_name()))),
    }
}

fn jump(func: &Function, label: Label, stack: &mut Vec<Value>) -> Result<usize, Fault> {
    let pos = func
        .labels
        .get(label.0 as usize)
        .ok_or_else(|| malformed(format!("no label L{}", label.0)))?;
    if stack.len() < pos.depth as usize {
        return Err(malformed(format!("stack too shallow for L{}", label.0)));
    }
    stack.truncate(pos.depth as usize);
    Ok(pos.offset)
}

fn truthy(value: &Value) -> Result<bool, Fault> {
    match value {
        Value::Bool(v) => Ok(*v),
        Value::I32(v) => Ok(*v != 0),
        Value::I64(v) => Ok(*v != 0),
        Value::Null => Ok(false),
        Value::F64(_) | Value::Addr(_) => Err(malformed("branch on non-boolean")),
        _ => Ok(true),
    }
}

fn arithmetic(op: &Op, left: Value, right: Value) -> Result<Value, Fault> {
    match (left, right) {
        (Value::I32(a), Value::I32(b)) => Ok(Value::I32(match op {
            Op::Add => a.wrapping_add(b),
            Op::Sub => a.wrapping_sub(b),
            Op::Mul => a.wrapping_mul(b),
            Op::Div | Op::Rem if b == 0 => return Err(Fault::DivideByZero),
            Op::Div => a.checked_div(b).ok_or(Fault::Overflow)?,
            Op::Rem => a.checked_rem(b).ok_or(Fault::Overflow)?,
            Op::And => a & b,
            Op::Or => a | b,
            _ => a ^ b,
        })),
        (Value::I64(a), Value::I64(b)) => Ok(Value::I64(match op {
            Op::Add => a.wrapping_add(b),
            Op::Sub => a.wrapping_sub(b),
            Op::Mul => a.wrapping_mul(b),
            Op::Div | Op::Rem if b == 0 => return Err(Fault::DivideByZero),
            Op::Div => a.checked_div(b).ok_or(Fault::Overflow)?,
            Op::Rem => a.checked_rem(b).ok_or(Fault::Overflow)?,
            Op::And => a & b,
            Op::Or => a | b,
            _ => a ^ b,
        })),
        (Value::F64(a), Value::F64(b)) => Ok(Value::F64(match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
            Op::Rem => a % b,
            _ => return Err(malformed("bitwise operation on f64")),
        })),
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(match op {
            Op::And => a & b,
            Op::Or => a | b,
            Op::Xor => a ^ b,
            _ => return Err(malformed("arithmetic on bool")),
        })),
        (left, right) => Err(malformed(format!(
            "{op} on {} and {}",
            left.kind_name(),
            right.kind_name()
        ))),
    }
}

fn compare(op: &Op, left: &Value, right: &Value) -> Result<bool, Fault> {
    if matches!(op, Op::Ceq) {
        return Ok(left.same(right));
    }
    let unordered = matches!(op, Op::CgtUn | Op::CltUn);
    let greater = matches!(op, Op::Cgt | Op::CgtUn);
    let ordering = match (left, right) {
        (Value::I32(a), Value::I32(b)) if unordered => (*a as u32).partial_cmp(&(*b as u32)),
        (Value::I64(a), Value::I64(b)) if unordered => (*a as u64).partial_cmp(&(*b as u64)),
        (Value::I32(a), Value::I32(b)) => a.partial_cmp(b),
        (Value::I64(a), Value::I64(b)) => a.partial_cmp(b),
        (Value::F64(a), Value::F64(b)) => a.partial_cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
        // Reference comparison against null, as in `isinst; ldnull; cgt.un`.
        (Value::Null, Value::Null) => return Ok(false),
        (_, Value::Null) if unordered => return Ok(greater),
        (Value::Null, _) if unordered => return Ok(!greater),
        _ => {
            return Err(malformed(format!(
                "{op} on {} and {}",
                left.kind_name(),
                right.kind_name()
            )))
        }
    };
    Ok(match ordering {
        None => unordered,
        Some(ordering) if greater => ordering.is_gt(),
        Some(ordering) => ordering.is_lt(),
    })
}

fn convert(value: Value, to: &Type, checked: bool) -> Result<Value, Fault> {
    let out_of_range = || {
        if checked {
            Err(Fault::Overflow)
        } else {
            Ok(())
        }
    };
    match (value, to) {
        (Value::I32(v), Type::I32) => Ok(Value::I32(v)),
        (Value::I64(v), Type::I32) => match i32::try_from(v) {
            Ok(v) => Ok(Value::I32(v)),
            Err(_) => out_of_range().map(|_| Value::I32(v as i32)),
        },
        (Value::F64(v), Type::I32) => {
            if !(v.is_finite() && v > f64::from(i32::MIN) - 1.0 && v < f64::from(i32::MAX) + 1.0) {
                out_of_range()?;
            }
            Ok(Value::I32(v as i32))
        }
        (Value::I32(v), Type::I64) => Ok(Value::I64(i64::from(v))),
        (Value::I64(v), Type::I64) => Ok(Value::I64(v)),
        (Value::F64(v), Type::I64) => {
            if !(v.is_finite() && v >= i64::MIN as f64 && v < i64::MAX as f64) {
                out_of_range()?;
            }
            Ok(Value::I64(v as i64))
        }
        (Value::I32(v), Type::F64) => Ok(Value::F64(f64::from(v))),
        (Value::I64(v), Type::F64) => Ok(Value::F64(v as f64)),
        (Value::F64(v), Type::F64) => Ok(Value::F64(v)),
        (value, to) => Err(malformed(format!("conv {} to {to}", value.kind_name()))),
    }
}

fn cast(md: &Metadata, value: Value, ty: &Type) -> Result<Value, Fault> {
    if value.is_null() || md.is_instance(&value, ty) {
        Ok(value)
    } else {
        Err(Fault::InvalidCast {
            from: value.kind_name(),
            to: ty.to_string(),
        })
    }
}

fn unbox(md: &Metadata, value: Value, ty: &Type) -> Result<Value, Fault> {
    match ty {
        Type::Nullable(_) => cast(md, value, ty),
        ty if ty.is_value_type() => {
            if value.is_null() {
                Err(Fault::NullReference)
            } else {
                cast(md, value, ty)
            }
        }
        ty => cast(md, value, ty),
    }
}

fn length(value: &Value) -> Result<usize, Fault> {
    let len = match value {
        Value::I32(v) => i64::from(*v),
        Value::I64(v) => *v,
        other => return Err(malformed(format!("array length of {}", other.kind_name()))),
    };
    usize::try_from(len).map_err(|_| Fault::Overflow)
}

fn element_index(arr: &ArrayRef, indexes: &[Value]) -> Result<usize, Fault> {
    let indexes = indexes
        .iter()
        .map(|value| match value {
            Value::I32(v) => Ok(i64::from(*v)),
            Value::I64(v) => Ok(*v),
            other => Err(malformed(format!("array index of {}", other.kind_name()))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    arr.borrow()
        .flat_index(&indexes)
        .ok_or(Fault::IndexOutOfRange)
}

fn new_array(md: &Metadata, element: Type, lengths: Vec<usize>) -> Value {
    let total = lengths.iter().product();
    let items = vec![md.default_value(&element); total];
    Value::Array(Rc::new(RefCell::new(ArrayObject {
        element,
        lengths,
        items,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{LabelPos, LocalSlot};

    fn function(params: Vec<Type>, ret: Type, locals: Vec<Type>, code: Vec<Op>, labels: Vec<LabelPos>) -> Rc<Program> {
        Rc::new(Program {
            functions: vec![Function {
                name: "test".to_string(),
                params,
                ret,
                locals,
                code,
                labels,
                constants: Vec::new(),
                max_stack: 8,
            }],
            entry: 0,
        })
    }

    #[test]
    fn arithmetic_and_branches() {
        // abs(x) via a conditional branch
        let program = function(
            vec![Type::I32],
            Type::I32,
            vec![],
            vec![
                Op::LdArg(0),
                Op::LdI32(0),
                Op::Clt,
                Op::BrFalse(Label(0)),
                Op::LdArg(0),
                Op::Neg,
                Op::Ret,
                Op::LdArg(0),
            ],
            vec![LabelPos { offset: 7, depth: 0 }],
        );
        let md = Metadata::new();
        let mut machine = Machine::new(&md);
        assert_eq!(machine.run(&program, vec![Value::I32(-4)]).expect("run"), Value::I32(4));
        assert_eq!(machine.run(&program, vec![Value::I32(9)]).expect("run"), Value::I32(9));
    }

    #[test]
    fn jump_truncates_stack_to_label_depth() {
        let program = function(
            vec![],
            Type::I32,
            vec![],
            vec![Op::LdI32(1), Op::LdI32(2), Op::Br(Label(0)), Op::Nop, Op::LdI32(7)],
            vec![LabelPos { offset: 4, depth: 0 }],
        );
        let md = Metadata::new();
        assert_eq!(Machine::new(&md).run(&program, vec![]).expect("run"), Value::I32(7));
    }

    #[test]
    fn nullable_access_goes_through_addresses() {
        let program = function(
            vec![Type::nullable(Type::I32)],
            Type::I32,
            vec![Type::nullable(Type::I32)],
            vec![
                Op::LdArg(0),
                Op::StLoc(LocalSlot(0)),
                Op::LdLocA(LocalSlot(0)),
                Op::GetValueOrDefault(Type::nullable(Type::I32)),
            ],
            vec![],
        );
        let md = Metadata::new();
        let mut machine = Machine::new(&md);
        assert_eq!(machine.run(&program, vec![Value::Null]).expect("run"), Value::I32(0));
        assert_eq!(machine.run(&program, vec![Value::I32(5)]).expect("run"), Value::I32(5));
    }

    #[test]
    fn checked_conversion_faults_on_overflow() {
        assert!(matches!(
            convert(Value::I64(i64::MAX), &Type::I32, true),
            Err(Fault::Overflow)
        ));
        assert_eq!(convert(Value::I64(i64::MAX), &Type::I32, false).expect("conv"), Value::I32(-1));
        assert!(matches!(
            arithmetic(&Op::Div, Value::I32(1), Value::I32(0)),
            Err(Fault::DivideByZero)
        ));
    }

    #[test]
    fn unordered_compare_treats_nan_as_true() {
        assert!(compare(&Op::CgtUn, &Value::F64(f64::NAN), &Value::F64(1.0)).expect("cmp"));
        assert!(!compare(&Op::Cgt, &Value::F64(f64::NAN), &Value::F64(1.0)).expect("cmp"));
        assert!(compare(&Op::CgtUn, &Value::str("x"), &Value::Null).expect("cmp"));
    }
}
