//! Built-in metadata used by the CLI and the test-suite.

use std::cell::RefCell;
use std::rc::Rc;

use crate::machine::{Fault, Machine};
use crate::metadata::{native, FieldId, Metadata};
use crate::types::Type;
use crate::value::{Address, ObjRef, Object, StructValue, Value};

impl Metadata {
    /// Registry preloaded with the prelude types and members.
    pub fn with_prelude() -> Self {
        let mut md = Metadata::new();
        install_prelude(&mut md);
        md
    }
}

pub fn install_prelude(md: &mut Metadata) {
    install_math(md);
    install_strings(md);
    install_int32(md);
    let point = install_point(md);
    let list = install_list(md);
    install_counter(md, &point, &list);
    install_shapes(md);
    install_runtime_variables(md);
}

fn install_math(md: &mut Metadata) {
    md.add_static_method(
        "Math",
        "Max",
        vec![Type::I32, Type::I32],
        Type::I32,
        native(|_, args| Ok(Value::I32(arg_i32(args, 0)?.max(arg_i32(args, 1)?)))),
    );
    md.add_static_method(
        "Math",
        "Abs",
        vec![Type::I32],
        Type::I32,
        native(|_, args| {
            let value = arg_i32(args, 0)?;
            value.checked_abs().map(Value::I32).ok_or(Fault::Overflow)
        }),
    );
    md.add_static_method(
        "Math",
        "Sqrt",
        vec![Type::F64],
        Type::F64,
        native(|_, args| match args.first() {
            Some(Value::F64(v)) => Ok(Value::F64(v.sqrt())),
            _ => Err(bad_argument("Math.Sqrt")),
        }),
    );
}

fn install_strings(md: &mut Metadata) {
    md.add_static_method(
        "String",
        "Concat",
        vec![Type::String, Type::String],
        Type::String,
        native(|_, args| {
            let mut out = String::new();
            for arg in args {
                match arg {
                    Value::Str(text) => out.push_str(text),
                    Value::Null => {}
                    other => out.push_str(&other.to_string()),
                }
            }
            Ok(Value::str(&out))
        }),
    );
    md.add_static_method(
        "String",
        "Length",
        vec![Type::String],
        Type::I32,
        native(|_, args| match args.first() {
            Some(Value::Str(text)) => Ok(Value::I32(text.chars().count() as i32)),
            Some(Value::Null) => Err(Fault::NullReference),
            _ => Err(bad_argument("String.Length")),
        }),
    );
}

fn install_int32(md: &mut Metadata) {
    md.add_static_method(
        "Int32",
        "Parse",
        vec![Type::String],
        Type::I32,
        native(|_, args| match args.first() {
            Some(Value::Str(text)) => text
                .trim()
                .parse::<i32>()
                .map(Value::I32)
                .map_err(|err| Fault::InvalidOperation(format!("cannot parse {text:?}: {err}"))),
            Some(Value::Null) => Err(Fault::NullReference),
            _ => Err(bad_argument("Int32.Parse")),
        }),
    );
    md.add_static_method(
        "Int32",
        "TryParse",
        vec![Type::String, Type::by_ref(Type::I32)],
        Type::Bool,
        native(|machine, args| {
            let target = arg_addr(args, 1)?;
            let parsed = match args.first() {
                Some(Value::Str(text)) => text.trim().parse::<i32>().ok(),
                _ => None,
            };
            machine.store(&target, Value::I32(parsed.unwrap_or(0)))?;
            Ok(Value::Bool(parsed.is_some()))
        }),
    );
    md.add_static_method(
        "Int32",
        "Increment",
        vec![Type::by_ref(Type::I32)],
        Type::Void,
        native(|machine, args| {
            let target = arg_addr(args, 0)?;
            let current = match machine.load(&target)? {
                Value::I32(v) => v,
                _ => return Err(bad_argument("Int32.Increment")),
            };
            machine.store(&target, Value::I32(current.wrapping_add(1)))?;
            Ok(Value::Null)
        }),
    );
    md.add_static_method(
        "Int32",
        "Swap",
        vec![Type::by_ref(Type::I32), Type::by_ref(Type::I32)],
        Type::Void,
        native(|machine, args| {
            let left = arg_addr(args, 0)?;
            let right = arg_addr(args, 1)?;
            let left_value = machine.load(&left)?;
            let right_value = machine.load(&right)?;
            machine.store(&left, right_value)?;
            machine.store(&right, left_value)?;
            Ok(Value::Null)
        }),
    );
}

fn install_point(md: &mut Metadata) -> Type {
    let point = md.define_struct("Point");
    let x = md.add_field(&point, "X", Type::I32);
    let y = md.add_field(&point, "Y", Type::I32);

    md.add_constructor(
        &point,
        "ctor",
        vec![Type::I32, Type::I32],
        native(move |_, args| {
            let mut st = StructValue::new("Point");
            st.fields.insert(x, Value::I32(arg_i32(args, 0)?));
            st.fields.insert(y, Value::I32(arg_i32(args, 1)?));
            Ok(Value::Struct(Box::new(st)))
        }),
    );
    md.add_instance_method(
        &point,
        "Offset",
        vec![Type::I32],
        Type::Void,
        false,
        native(move |machine, args| {
            let delta = arg_i32(args, 1)?;
            let (addr, mut st) = this_struct(machine, args)?;
            let addr = addr.ok_or_else(|| bad_argument("Point.Offset receiver"))?;
            let px = struct_i32(&st, x);
            let py = struct_i32(&st, y);
            st.fields.insert(x, Value::I32(px.wrapping_add(delta)));
            st.fields.insert(y, Value::I32(py.wrapping_add(delta)));
            machine.store(&addr, Value::Struct(Box::new(st)))?;
            Ok(Value::Null)
        }),
    );
    let get_sum = md.add_instance_method(
        &point,
        "get_Sum",
        vec![],
        Type::I32,
        false,
        native(move |machine, args| {
            let (_, st) = this_struct(machine, args)?;
            Ok(Value::I32(struct_i32(&st, x).wrapping_add(struct_i32(&st, y))))
        }),
    );
    md.add_property(&point, "Sum", Type::I32, Some(get_sum), None);
    let get_both = md.add_instance_method(
        &point,
        "get_Both",
        vec![],
        Type::I32,
        false,
        native(move |machine, args| {
            let (_, st) = this_struct(machine, args)?;
            Ok(Value::I32(struct_i32(&st, x)))
        }),
    );
    let set_both = md.add_instance_method(
        &point,
        "set_Both",
        vec![Type::I32],
        Type::Void,
        false,
        native(move |machine, args| {
            let value = arg_i32(args, 1)?;
            let (addr, mut st) = this_struct(machine, args)?;
            let addr = addr.ok_or_else(|| bad_argument("Point.set_Both receiver"))?;
            st.fields.insert(x, Value::I32(value));
            st.fields.insert(y, Value::I32(value));
            machine.store(&addr, Value::Struct(Box::new(st)))?;
            Ok(Value::Null)
        }),
    );
    md.add_property(&point, "Both", Type::I32, Some(get_both), Some(set_both));

    let pair = vec![point.clone(), point.clone()];
    md.add_static_method(
        "Point",
        "op_Equality",
        pair.clone(),
        Type::Bool,
        native(move |_, args| {
            let (a, b) = (arg_struct(args, 0)?, arg_struct(args, 1)?);
            Ok(Value::Bool(
                struct_i32(&a, x) == struct_i32(&b, x) && struct_i32(&a, y) == struct_i32(&b, y),
            ))
        }),
    );
    md.add_static_method(
        "Point",
        "op_LessThan",
        pair.clone(),
        Type::Bool,
        native(move |_, args| {
            let (a, b) = (arg_struct(args, 0)?, arg_struct(args, 1)?);
            let norm = |st: &StructValue| struct_i32(st, x).abs() + struct_i32(st, y).abs();
            Ok(Value::Bool(norm(&a) < norm(&b)))
        }),
    );
    md.add_static_method(
        "Point",
        "op_Addition",
        pair,
        point.clone(),
        native(move |_, args| {
            let (a, b) = (arg_struct(args, 0)?, arg_struct(args, 1)?);
            let mut st = StructValue::new("Point");
            st.fields.insert(x, Value::I32(struct_i32(&a, x).wrapping_add(struct_i32(&b, x))));
            st.fields.insert(y, Value::I32(struct_i32(&a, y).wrapping_add(struct_i32(&b, y))));
            Ok(Value::Struct(Box::new(st)))
        }),
    );
    point
}

fn install_list(md: &mut Metadata) -> Type {
    let list = md.define_class("List", None, false);
    md.add_constructor(
        &list,
        "ctor",
        vec![],
        native(|_, _| Ok(Value::Object(Rc::new(RefCell::new(Object::new("List")))))),
    );
    md.add_instance_method(
        &list,
        "Add",
        vec![Type::Object],
        Type::Void,
        false,
        native(|_, args| {
            let obj = this_object(args)?;
            obj.borrow_mut().items.push(arg(args, 1)?.clone());
            Ok(Value::Null)
        }),
    );
    md.add_instance_method(
        &list,
        "Push",
        vec![Type::Object],
        Type::I32,
        false,
        native(|_, args| {
            let obj = this_object(args)?;
            let mut obj = obj.borrow_mut();
            obj.items.push(arg(args, 1)?.clone());
            Ok(Value::I32(obj.items.len() as i32))
        }),
    );
    let count = md.add_instance_method(
        &list,
        "get_Count",
        vec![],
        Type::I32,
        false,
        native(|_, args| Ok(Value::I32(this_object(args)?.borrow().items.len() as i32))),
    );
    md.add_property(&list, "Count", Type::I32, Some(count), None);
    let get_item = md.add_instance_method(
        &list,
        "get_Item",
        vec![Type::I32],
        Type::Object,
        false,
        native(|_, args| {
            let index = list_index(args)?;
            let obj = this_object(args)?;
            let item = obj.borrow().items.get(index).cloned();
            item.ok_or(Fault::IndexOutOfRange)
        }),
    );
    let set_item = md.add_instance_method(
        &list,
        "set_Item",
        vec![Type::I32, Type::Object],
        Type::Void,
        false,
        native(|_, args| {
            let index = list_index(args)?;
            let value = arg(args, 2)?.clone();
            let obj = this_object(args)?;
            let mut obj = obj.borrow_mut();
            let slot = obj.items.get_mut(index).ok_or(Fault::IndexOutOfRange)?;
            *slot = value;
            Ok(Value::Null)
        }),
    );
    md.add_indexer(&list, "Item", Type::Object, vec![Type::I32], Some(get_item), Some(set_item));
    list
}

fn install_counter(md: &mut Metadata, point: &Type, list: &Type) {
    let counter = md.define_class("Counter", None, false);
    let value = md.add_field(&counter, "_value", Type::I32);
    let tags = md.add_field(&counter, "_tags", list.clone());
    md.add_field(&counter, "Total", Type::I64);
    md.add_field(&counter, "Origin", point.clone());
    let instances = md.add_static_field(&counter, "Instances", Type::I32);
    md.add_literal_field(&counter, "Max", Type::I32, Value::I32(100));

    md.add_constructor(
        &counter,
        "ctor",
        vec![],
        native(move |machine, _| new_counter(machine, instances, tags, value, 0)),
    );
    md.add_constructor(
        &counter,
        "ctor(i32)",
        vec![Type::I32],
        native(move |machine, args| new_counter(machine, instances, tags, value, arg_i32(args, 0)?)),
    );

    let get_value = md.add_instance_method(
        &counter,
        "get_Value",
        vec![],
        Type::I32,
        false,
        native(move |_, args| Ok(object_field(&this_object(args)?, value))),
    );
    let set_value = md.add_instance_method(
        &counter,
        "set_Value",
        vec![Type::I32],
        Type::Void,
        false,
        native(move |_, args| {
            let new_value = arg(args, 1)?.clone();
            this_object(args)?.borrow_mut().fields.insert(value, new_value);
            Ok(Value::Null)
        }),
    );
    md.add_property(&counter, "Value", Type::I32, Some(get_value), Some(set_value));

    let get_tags = md.add_instance_method(
        &counter,
        "get_Tags",
        vec![],
        list.clone(),
        false,
        native(move |_, args| Ok(object_field(&this_object(args)?, tags))),
    );
    md.add_property(&counter, "Tags", list.clone(), Some(get_tags), None);

    let get_position = md.add_instance_method(
        &counter,
        "get_Position",
        vec![],
        point.clone(),
        false,
        native(|machine, _| Ok(machine.metadata().default_value(&Type::Struct("Point".into())))),
    );
    md.add_property(&counter, "Position", point.clone(), Some(get_position), None);

    md.add_instance_method(
        &counter,
        "Bump",
        vec![],
        Type::I32,
        false,
        native(move |_, args| {
            let obj = this_object(args)?;
            let next = match object_field(&obj, value) {
                Value::I32(v) => v.wrapping_add(1),
                _ => 1,
            };
            obj.borrow_mut().fields.insert(value, Value::I32(next));
            Ok(Value::I32(next))
        }),
    );
    md.add_instance_method(
        &counter,
        "Describe",
        vec![],
        Type::String,
        true,
        native(move |_, args| {
            let current = object_field(&this_object(args)?, value);
            Ok(Value::str(&format!("counter {current}")))
        }),
    );
    md.add_instance_method(
        &counter,
        "AddTo",
        vec![Type::by_ref(Type::I32)],
        Type::Void,
        false,
        native(move |machine, args| {
            let amount = match object_field(&this_object(args)?, value) {
                Value::I32(v) => v,
                _ => 0,
            };
            let target = arg_addr(args, 1)?;
            let current = match machine.load(&target)? {
                Value::I32(v) => v,
                _ => return Err(bad_argument("Counter.AddTo")),
            };
            machine.store(&target, Value::I32(current.wrapping_add(amount)))?;
            Ok(Value::Null)
        }),
    );
}

fn new_counter(
    machine: &mut Machine<'_>,
    instances: FieldId,
    tags: FieldId,
    value: FieldId,
    initial: i32,
) -> Result<Value, Fault> {
    let count = match machine.static_field(instances) {
        Value::I32(v) => v,
        _ => 0,
    };
    machine.store(&Address::Static(instances), Value::I32(count + 1))?;
    let mut obj = Object::new("Counter");
    obj.fields.insert(value, Value::I32(initial));
    obj.fields.insert(
        tags,
        Value::Object(Rc::new(RefCell::new(Object::new("List")))),
    );
    Ok(Value::Object(Rc::new(RefCell::new(obj))))
}

fn install_shapes(md: &mut Metadata) {
    let shape = md.define_class("Shape", None, true);
    let circle = md.define_class("Circle", Some("Shape"), false);
    let radius = md.add_field(&circle, "Radius", Type::F64);
    md.add_instance_method(
        &shape,
        "Area",
        vec![],
        Type::F64,
        true,
        native(|_, _| Ok(Value::F64(0.0))),
    );
    md.add_instance_method(
        &circle,
        "Area",
        vec![],
        Type::F64,
        true,
        native(move |_, args| match object_field(&this_object(args)?, radius) {
            Value::F64(r) => Ok(Value::F64(3.0 * r * r)),
            _ => Ok(Value::F64(0.0)),
        }),
    );
    md.add_constructor(
        &shape,
        "ctor",
        vec![],
        native(|_, _| Err(Fault::InvalidOperation("cannot create an abstract Shape".into()))),
    );
    md.add_constructor(
        &circle,
        "ctor",
        vec![Type::F64],
        native(move |_, args| {
            let mut obj = Object::new("Circle");
            obj.fields.insert(radius, arg(args, 0)?.clone());
            Ok(Value::Object(Rc::new(RefCell::new(obj))))
        }),
    );
}

fn install_runtime_variables(md: &mut Metadata) {
    md.add_static_method(
        "RuntimeVariables",
        "Get",
        vec![Type::RuntimeVariables, Type::I32],
        Type::Object,
        native(|_, args| {
            let cells = runtime_variables(args)?;
            let index = usize::try_from(arg_i32(args, 1)?).map_err(|_| Fault::IndexOutOfRange)?;
            let cell = cells.get(index).ok_or(Fault::IndexOutOfRange)?;
            let value = cell.borrow().clone();
            Ok(value)
        }),
    );
    md.add_static_method(
        "RuntimeVariables",
        "Set",
        vec![Type::RuntimeVariables, Type::I32, Type::Object],
        Type::Void,
        native(|_, args| {
            let cells = runtime_variables(args)?;
            let index = usize::try_from(arg_i32(args, 1)?).map_err(|_| Fault::IndexOutOfRange)?;
            let cell = cells.get(index).ok_or(Fault::IndexOutOfRange)?;
            *cell.borrow_mut() = arg(args, 2)?.clone();
            Ok(Value::Null)
        }),
    );
}

fn bad_argument(member: &str) -> Fault {
    Fault::InvalidOperation(format!("bad argument to {member}"))
}

fn arg(args: &[Value], idx: usize) -> Result<&Value, Fault> {
    args.get(idx)
        .ok_or_else(|| Fault::Malformed(format!("missing argument {idx}")))
}

fn arg_i32(args: &[Value], idx: usize) -> Result<i32, Fault> {
    match arg(args, idx)? {
        Value::I32(v) => Ok(*v),
        Value::Null => Err(Fault::NullReference),
        other => Err(Fault::InvalidCast {
            from: other.kind_name(),
            to: "i32".to_string(),
        }),
    }
}

fn arg_addr(args: &[Value], idx: usize) -> Result<Address, Fault> {
    match arg(args, idx)? {
        Value::Addr(addr) => Ok(addr.clone()),
        other => Err(Fault::Malformed(format!(
            "expected address argument, found {}",
            other.kind_name()
        ))),
    }
}

fn arg_struct(args: &[Value], idx: usize) -> Result<StructValue, Fault> {
    match arg(args, idx)? {
        Value::Struct(st) => Ok((**st).clone()),
        Value::Null => Err(Fault::NullReference),
        other => Err(Fault::InvalidCast {
            from: other.kind_name(),
            to: "struct".to_string(),
        }),
    }
}

fn list_index(args: &[Value]) -> Result<usize, Fault> {
    usize::try_from(arg_i32(args, 1)?).map_err(|_| Fault::IndexOutOfRange)
}

fn this_object(args: &[Value]) -> Result<ObjRef, Fault> {
    match arg(args, 0)? {
        Value::Object(obj) => Ok(Rc::clone(obj)),
        Value::Null => Err(Fault::NullReference),
        other => Err(Fault::InvalidCast {
            from: other.kind_name(),
            to: "object".to_string(),
        }),
    }
}

/// Value-type receiver, with its address when passed by reference.
fn this_struct(machine: &Machine<'_>, args: &[Value]) -> Result<(Option<Address>, StructValue), Fault> {
    match arg(args, 0)? {
        Value::Addr(addr) => match machine.load(addr)? {
            Value::Struct(st) => Ok((Some(addr.clone()), *st)),
            other => Err(Fault::InvalidCast {
                from: other.kind_name(),
                to: "struct".to_string(),
            }),
        },
        Value::Struct(st) => Ok((None, (**st).clone())),
        Value::Null => Err(Fault::NullReference),
        other => Err(Fault::InvalidCast {
            from: other.kind_name(),
            to: "struct".to_string(),
        }),
    }
}

fn struct_i32(st: &StructValue, field: FieldId) -> i32 {
    match st.fields.get(&field) {
        Some(Value::I32(v)) => *v,
        _ => 0,
    }
}

fn object_field(obj: &ObjRef, field: FieldId) -> Value {
    obj.borrow().fields.get(&field).cloned().unwrap_or(Value::Null)
}

fn runtime_variables(args: &[Value]) -> Result<Rc<Vec<crate::value::CellRef>>, Fault> {
    match arg(args, 0)? {
        Value::Variables(cells) => Ok(Rc::clone(cells)),
        Value::Null => Err(Fault::NullReference),
        other => Err(Fault::InvalidCast {
            from: other.kind_name(),
            to: "runtime-variables".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_registers_qualified_keys() {
        let md = Metadata::with_prelude();
        for key in ["Math.Max", "Int32.TryParse", "Counter.get_Value", "Point.op_Equality", "List.Add"] {
            assert!(md.method(key).is_some(), "missing {key}");
        }
        assert!(md.property("List.Item").is_some());
        assert!(md.constructor("Counter.ctor(i32)").is_some());
        let max = md.field("Counter.Max").expect("literal field");
        assert_eq!(md.field_def(max).literal, Some(Value::I32(100)));
        let shape = Type::Class("Shape".into());
        assert!(md.is_abstract(&shape));
    }

    #[test]
    fn by_ref_helpers_write_through_addresses() {
        let md = Metadata::with_prelude();
        let mut machine = Machine::new(&md);
        let cell = Rc::new(RefCell::new(Value::I32(0)));
        let try_parse = md.method_def(md.method("Int32.TryParse").expect("TryParse"));
        let body = Rc::clone(&try_parse.body);
        let ok = body(&mut machine, &[Value::str("42"), Value::Addr(Address::Cell(cell.clone()))])
            .expect("call");
        assert_eq!(ok, Value::Bool(true));
        assert_eq!(*cell.borrow(), Value::I32(42));

        let left = Rc::new(RefCell::new(Value::I32(1)));
        let right = Rc::new(RefCell::new(Value::I32(2)));
        let swap = Rc::clone(&md.method_def(md.method("Int32.Swap").expect("Swap")).body);
        swap(
            &mut machine,
            &[
                Value::Addr(Address::Cell(left.clone())),
                Value::Addr(Address::Cell(right.clone())),
            ],
        )
        .expect("swap");
        assert_eq!(*left.borrow(), Value::I32(2));
        assert_eq!(*right.borrow(), Value::I32(1));
    }
}
