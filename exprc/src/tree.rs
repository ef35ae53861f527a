//! Typed expression tree consumed by the compiler.
//!
//! Trees are immutable and assumed to be type-checked by whoever built them:
//! every node carries its static type and the compiler trusts it. Members are
//! referenced by qualified metadata key (`"Counter.Value"`), variables and
//! labels by id. The whole tree is serde-serializable so the CLI can load a
//! lambda from JSON; only literal constants survive that round trip.

use exprc_runtime::{Type, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(pub u32);

/// A lambda parameter or block variable. Identity is the id; the name is
/// only used in diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamVar {
    pub id: VarId,
    pub name: String,
    /// Element type; a by-reference variable holds the address of one.
    pub ty: Type,
    #[serde(default)]
    pub by_ref: bool,
}

impl ParamVar {
    pub fn new(id: u32, name: &str, ty: Type) -> Self {
        Self {
            id: VarId(id),
            name: name.to_string(),
            ty,
            by_ref: false,
        }
    }

    pub fn by_ref(id: u32, name: &str, ty: Type) -> Self {
        Self {
            by_ref: true,
            ..Self::new(id, name, ty)
        }
    }

    /// Storage type of the variable itself.
    pub fn storage_type(&self) -> Type {
        if self.by_ref {
            Type::by_ref(self.ty.clone())
        } else {
            self.ty.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelTarget {
    pub id: LabelId,
    pub name: String,
    #[serde(default = "void_type")]
    pub ty: Type,
}

impl LabelTarget {
    pub fn new(id: u32, name: &str, ty: Type) -> Self {
        Self {
            id: LabelId(id),
            name: name.to_string(),
            ty,
        }
    }
}

fn void_type() -> Type {
    Type::Void
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
    ExclusiveOr,
    AndAlso,
    OrElse,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Assign,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    pub fn is_equality(self) -> bool {
        matches!(self, BinaryOp::Equal | BinaryOp::NotEqual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    Not,
    Convert,
    ConvertChecked,
    ArrayLength,
}

/// Field or property named by qualified key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberRef {
    Field(String),
    Property(String),
}

impl MemberRef {
    pub fn key(&self) -> &str {
        match self {
            MemberRef::Field(key) | MemberRef::Property(key) => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewArrayForm {
    /// One element expression per slot of a vector.
    Init,
    /// One length expression per dimension.
    Bounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GotoKind {
    Goto,
    Return,
    Break,
    Continue,
}

/// One `Add`-style call of a collection initializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInit {
    pub add_method: String,
    pub arguments: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "binding")]
pub enum MemberBinding {
    Assignment {
        member: MemberRef,
        expression: Expr,
    },
    ListBinding {
        member: MemberRef,
        initializers: Vec<ElementInit>,
    },
    MemberBinding {
        member: MemberRef,
        bindings: Vec<MemberBinding>,
    },
}

impl MemberBinding {
    pub fn member(&self) -> &MemberRef {
        match self {
            MemberBinding::Assignment { member, .. }
            | MemberBinding::ListBinding { member, .. }
            | MemberBinding::MemberBinding { member, .. } => member,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaExpr {
    #[serde(default)]
    pub name: Option<String>,
    pub params: Vec<ParamVar>,
    pub body: Box<Expr>,
    pub ret: Type,
    /// Calls in tail position may be marked as tail calls.
    #[serde(default)]
    pub tail_call: bool,
}

impl LambdaExpr {
    pub fn new(name: &str, params: Vec<ParamVar>, body: Expr, ret: Type) -> Self {
        Self {
            name: Some(name.to_string()),
            params,
            body: Box::new(body),
            ret,
            tail_call: false,
        }
    }

    pub fn with_tail_call(mut self, tail_call: bool) -> Self {
        self.tail_call = tail_call;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("lambda")
    }

    pub fn delegate_type(&self) -> Type {
        Type::delegate(
            self.params.iter().map(ParamVar::storage_type).collect(),
            self.ret.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Constant,
    Parameter,
    Binary,
    Unary,
    Member,
    Index,
    Call,
    New,
    NewArray,
    ListInit,
    MemberInit,
    Invoke,
    Lambda,
    TypeIs,
    RuntimeVariables,
    DebugInfo,
    Throw,
    Goto,
    Label,
    Block,
    Conditional,
    Loop,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Expr {
    Constant {
        #[serde(with = "literal")]
        value: Value,
        ty: Type,
    },
    Parameter(ParamVar),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        ty: Type,
        /// User operator method, by key.
        #[serde(default)]
        method: Option<String>,
        /// A lifted comparison yields `null` instead of `false` on a null operand.
        #[serde(default)]
        lifted_to_null: bool,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        ty: Type,
        #[serde(default)]
        method: Option<String>,
    },
    Member {
        #[serde(default)]
        instance: Option<Box<Expr>>,
        member: MemberRef,
        ty: Type,
    },
    /// Array element access, or an indexed property when `indexer` is set.
    Index {
        object: Box<Expr>,
        #[serde(default)]
        indexer: Option<String>,
        arguments: Vec<Expr>,
        ty: Type,
    },
    Call {
        #[serde(default)]
        object: Option<Box<Expr>>,
        method: String,
        arguments: Vec<Expr>,
        ty: Type,
    },
    New {
        ty: Type,
        #[serde(default)]
        constructor: Option<String>,
        #[serde(default)]
        arguments: Vec<Expr>,
    },
    NewArray {
        form: NewArrayForm,
        ty: Type,
        expressions: Vec<Expr>,
    },
    ListInit {
        new: Box<Expr>,
        initializers: Vec<ElementInit>,
    },
    MemberInit {
        new: Box<Expr>,
        bindings: Vec<MemberBinding>,
    },
    Invoke {
        target: Box<Expr>,
        arguments: Vec<Expr>,
        ty: Type,
    },
    Lambda(LambdaExpr),
    TypeIs {
        expression: Box<Expr>,
        type_operand: Type,
    },
    RuntimeVariables {
        variables: Vec<ParamVar>,
    },
    DebugInfo,
    Throw {
        #[serde(default)]
        value: Option<Box<Expr>>,
        #[serde(default = "void_type")]
        ty: Type,
    },
    Goto {
        #[serde(default = "goto_kind")]
        goto_kind: GotoKind,
        target: LabelTarget,
        #[serde(default)]
        value: Option<Box<Expr>>,
        #[serde(default = "void_type")]
        ty: Type,
    },
    Label {
        target: LabelTarget,
        #[serde(default)]
        default: Option<Box<Expr>>,
    },
    Block {
        #[serde(default)]
        variables: Vec<ParamVar>,
        expressions: Vec<Expr>,
        ty: Type,
    },
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
        ty: Type,
    },
    Loop {
        body: Box<Expr>,
        #[serde(default)]
        break_label: Option<LabelTarget>,
        #[serde(default)]
        continue_label: Option<LabelTarget>,
    },
    Default {
        ty: Type,
    },
}

fn goto_kind() -> GotoKind {
    GotoKind::Goto
}

impl Expr {
    pub fn kind(&self) -> NodeKind {
        match self {
            Expr::Constant { .. } => NodeKind::Constant,
            Expr::Parameter(_) => NodeKind::Parameter,
            Expr::Binary { .. } => NodeKind::Binary,
            Expr::Unary { .. } => NodeKind::Unary,
            Expr::Member { .. } => NodeKind::Member,
            Expr::Index { .. } => NodeKind::Index,
            Expr::Call { .. } => NodeKind::Call,
            Expr::New { .. } => NodeKind::New,
            Expr::NewArray { .. } => NodeKind::NewArray,
            Expr::ListInit { .. } => NodeKind::ListInit,
            Expr::MemberInit { .. } => NodeKind::MemberInit,
            Expr::Invoke { .. } => NodeKind::Invoke,
            Expr::Lambda(_) => NodeKind::Lambda,
            Expr::TypeIs { .. } => NodeKind::TypeIs,
            Expr::RuntimeVariables { .. } => NodeKind::RuntimeVariables,
            Expr::DebugInfo => NodeKind::DebugInfo,
            Expr::Throw { .. } => NodeKind::Throw,
            Expr::Goto { .. } => NodeKind::Goto,
            Expr::Label { .. } => NodeKind::Label,
            Expr::Block { .. } => NodeKind::Block,
            Expr::Conditional { .. } => NodeKind::Conditional,
            Expr::Loop { .. } => NodeKind::Loop,
            Expr::Default { .. } => NodeKind::Default,
        }
    }

    /// Static type of the node.
    pub fn ty(&self) -> Type {
        match self {
            Expr::Constant { ty, .. }
            | Expr::Binary { ty, .. }
            | Expr::Unary { ty, .. }
            | Expr::Member { ty, .. }
            | Expr::Index { ty, .. }
            | Expr::Call { ty, .. }
            | Expr::New { ty, .. }
            | Expr::NewArray { ty, .. }
            | Expr::Invoke { ty, .. }
            | Expr::Throw { ty, .. }
            | Expr::Goto { ty, .. }
            | Expr::Block { ty, .. }
            | Expr::Conditional { ty, .. }
            | Expr::Default { ty } => ty.clone(),
            Expr::Parameter(var) => var.ty.clone(),
            Expr::ListInit { new, .. } | Expr::MemberInit { new, .. } => new.ty(),
            Expr::Lambda(lambda) => lambda.delegate_type(),
            Expr::TypeIs { .. } => Type::Bool,
            Expr::RuntimeVariables { .. } => Type::RuntimeVariables,
            Expr::DebugInfo => Type::Void,
            Expr::Label { target, .. } => target.ty.clone(),
            Expr::Loop { break_label, .. } => break_label
                .as_ref()
                .map(|label| label.ty.clone())
                .unwrap_or(Type::Void),
        }
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        fn inits(initializers: &[ElementInit]) -> impl Iterator<Item = &Expr> {
            initializers.iter().flat_map(|init| init.arguments.iter())
        }
        fn bindings<'e>(list: &'e [MemberBinding], out: &mut Vec<&'e Expr>) {
            for binding in list {
                match binding {
                    MemberBinding::Assignment { expression, .. } => out.push(expression),
                    MemberBinding::ListBinding { initializers, .. } => out.extend(inits(initializers)),
                    MemberBinding::MemberBinding { bindings: nested, .. } => bindings(nested, out),
                }
            }
        }

        let mut out = Vec::new();
        match self {
            Expr::Constant { .. }
            | Expr::Parameter(_)
            | Expr::RuntimeVariables { .. }
            | Expr::DebugInfo
            | Expr::Default { .. } => {}
            Expr::Binary { left, right, .. } => {
                out.push(left.as_ref());
                out.push(right.as_ref());
            }
            Expr::Unary { operand, .. } => out.push(operand),
            Expr::Member { instance, .. } => out.extend(instance.as_deref()),
            Expr::Index {
                object, arguments, ..
            } => {
                out.push(object.as_ref());
                out.extend(arguments);
            }
            Expr::Call {
                object, arguments, ..
            } => {
                out.extend(object.as_deref());
                out.extend(arguments);
            }
            Expr::New { arguments, .. } => out.extend(arguments),
            Expr::NewArray { expressions, .. } => out.extend(expressions),
            Expr::ListInit { new, initializers } => {
                out.push(new.as_ref());
                out.extend(inits(initializers));
            }
            Expr::MemberInit { new, bindings: list } => {
                out.push(new.as_ref());
                bindings(list, &mut out);
            }
            Expr::Invoke {
                target, arguments, ..
            } => {
                out.push(target.as_ref());
                out.extend(arguments);
            }
            Expr::Lambda(lambda) => out.push(lambda.body.as_ref()),
            Expr::TypeIs { expression, .. } => out.push(expression),
            Expr::Throw { value, .. } | Expr::Goto { value, .. } => out.extend(value.as_deref()),
            Expr::Label { default, .. } => out.extend(default.as_deref()),
            Expr::Block { expressions, .. } => out.extend(expressions),
            Expr::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => {
                out.push(test.as_ref());
                out.push(if_true.as_ref());
                out.push(if_false.as_ref());
            }
            Expr::Loop { body, .. } => out.push(body),
        }
        out
    }

    /// `null` literal.
    pub fn is_null_constant(&self) -> bool {
        matches!(self, Expr::Constant { value: Value::Null, .. })
    }

    /// A void `Default` that emits nothing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Expr::Default { ty: Type::Void })
    }

    pub fn constant(value: impl Into<Value>, ty: Type) -> Expr {
        Expr::Constant {
            value: value.into(),
            ty,
        }
    }

    pub fn null(ty: Type) -> Expr {
        Expr::Constant {
            value: Value::Null,
            ty,
        }
    }

    pub fn param(var: &ParamVar) -> Expr {
        Expr::Parameter(var.clone())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr, ty: Type) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            ty,
            method: None,
            lifted_to_null: false,
        }
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        let ty = target.ty();
        Expr::binary(BinaryOp::Assign, target, value, ty)
    }

    pub fn unary(op: UnaryOp, operand: Expr, ty: Type) -> Expr {
        Expr::Unary {
            op,
            operand: Box::new(operand),
            ty,
            method: None,
        }
    }

    pub fn convert(operand: Expr, ty: Type) -> Expr {
        Expr::unary(UnaryOp::Convert, operand, ty)
    }

    pub fn field(instance: Option<Expr>, key: &str, ty: Type) -> Expr {
        Expr::Member {
            instance: instance.map(Box::new),
            member: MemberRef::Field(key.to_string()),
            ty,
        }
    }

    pub fn property(instance: Option<Expr>, key: &str, ty: Type) -> Expr {
        Expr::Member {
            instance: instance.map(Box::new),
            member: MemberRef::Property(key.to_string()),
            ty,
        }
    }

    pub fn call(object: Option<Expr>, method: &str, arguments: Vec<Expr>, ty: Type) -> Expr {
        Expr::Call {
            object: object.map(Box::new),
            method: method.to_string(),
            arguments,
            ty,
        }
    }

    pub fn new_object(ty: Type, constructor: &str, arguments: Vec<Expr>) -> Expr {
        Expr::New {
            ty,
            constructor: Some(constructor.to_string()),
            arguments,
        }
    }

    pub fn invoke(target: Expr, arguments: Vec<Expr>, ty: Type) -> Expr {
        Expr::Invoke {
            target: Box::new(target),
            arguments,
            ty,
        }
    }

    pub fn block(variables: Vec<ParamVar>, expressions: Vec<Expr>) -> Expr {
        let ty = expressions.last().map(Expr::ty).unwrap_or(Type::Void);
        Expr::Block {
            variables,
            expressions,
            ty,
        }
    }

    pub fn conditional(test: Expr, if_true: Expr, if_false: Expr, ty: Type) -> Expr {
        Expr::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
            ty,
        }
    }

    pub fn goto(target: &LabelTarget, value: Option<Expr>) -> Expr {
        Expr::Goto {
            goto_kind: GotoKind::Goto,
            target: target.clone(),
            value: value.map(Box::new),
            ty: Type::Void,
        }
    }

    pub fn label(target: &LabelTarget, default: Option<Expr>) -> Expr {
        Expr::Label {
            target: target.clone(),
            default: default.map(Box::new),
        }
    }

    pub fn default_of(ty: Type) -> Expr {
        Expr::Default { ty }
    }
}

/// Serde adapter for constant values: only JSON literals are representable.
mod literal {
    use exprc_runtime::Value;
    use serde::de::Deserializer;
    use serde::ser::{Error as _, Serializer};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Literal {
        Null,
        Bool(bool),
        Int(i64),
        Float(f64),
        Str(String),
    }

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        let literal = match value {
            Value::Null => Literal::Null,
            Value::Bool(v) => Literal::Bool(*v),
            Value::I32(v) => Literal::Int(i64::from(*v)),
            Value::I64(v) => Literal::Int(*v),
            Value::F64(v) => Literal::Float(*v),
            Value::Str(v) => Literal::Str(v.to_string()),
            other => {
                return Err(S::Error::custom(format!(
                    "constant of kind {} has no literal form",
                    other.kind_name()
                )))
            }
        };
        literal.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        Ok(match Literal::deserialize(deserializer)? {
            Literal::Null => Value::Null,
            Literal::Bool(v) => Value::Bool(v),
            Literal::Int(v) => match i32::try_from(v) {
                Ok(v) => Value::I32(v),
                Err(_) => Value::I64(v),
            },
            Literal::Float(v) => Value::F64(v),
            Literal::Str(v) => Value::str(&v),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lambda_round_trips_literals() {
        let source = r#"{
            "name": "inc",
            "params": [{ "id": 0, "name": "x", "ty": "I32" }],
            "ret": "I32",
            "body": {
                "kind": "Binary",
                "op": "Add",
                "left": { "kind": "Parameter", "id": 0, "name": "x", "ty": "I32" },
                "right": { "kind": "Constant", "value": 1, "ty": "I32" },
                "ty": "I32"
            }
        }"#;
        let lambda: LambdaExpr = serde_json::from_str(source).expect("parse lambda");
        assert_eq!(lambda.display_name(), "inc");
        assert!(!lambda.tail_call);
        match lambda.body.as_ref() {
            Expr::Binary { right, .. } => {
                assert_eq!(**right, Expr::constant(1, Type::I32));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn derived_types_follow_children() {
        let counter = Type::Class("Counter".into());
        let new = Expr::new_object(counter.clone(), "Counter.ctor", vec![]);
        let init = Expr::MemberInit {
            new: Box::new(new),
            bindings: vec![],
        };
        assert_eq!(init.ty(), counter);
        let body = Expr::block(vec![], vec![Expr::constant(1, Type::I32), Expr::DebugInfo]);
        assert_eq!(body.ty(), Type::Void);
        let brk = LabelTarget::new(0, "brk", Type::I32);
        let lp = Expr::Loop {
            body: Box::new(Expr::goto(&brk, Some(Expr::constant(3, Type::I32)))),
            break_label: Some(brk),
            continue_label: None,
        };
        assert_eq!(lp.ty(), Type::I32);
        assert_eq!(lp.kind(), NodeKind::Loop);
    }

    #[test]
    fn runtime_constants_have_no_literal_form() {
        let obj = Value::Variables(std::rc::Rc::new(Vec::new()));
        let node = Expr::constant(obj, Type::RuntimeVariables);
        assert!(serde_json::to_string(&node).is_err());
    }
}
