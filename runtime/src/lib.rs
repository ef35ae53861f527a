//! Execution-side collaborators of the expression compiler: the type model,
//! member metadata, runtime values, the instruction set and a reference
//! interpreter.

pub mod machine;
pub mod metadata;
pub mod prelude;
pub mod program;
pub mod types;
pub mod value;

pub use machine::{Fault, Machine};
pub use metadata::{native, CtorId, FieldId, Metadata, MethodId, NativeFn, PropertyId};
pub use program::{CallSite, Function, Label, LabelPos, LocalSlot, Op, Program};
pub use types::{Signature, Type};
pub use value::{Address, Value};
