//! Static partial evaluation of type static constructors.
//!
//! Given a type whose static constructor would normally run at process
//! startup, [`TypePreinit::scan_type`] determines whether the whole effect
//! of that constructor can be computed at compile time. On success it
//! produces a byte-exact snapshot of the final static field values, ready
//! to be embedded into the output binary; the runtime initialization check
//! and call disappear.
//!
//! Values are byte buffers under the hood: representing every non-reference
//! value as an exact-size buffer makes byrefs essentially free (a shared
//! buffer handle plus an offset), at the price of many short-lived
//! allocations, which a scan can easily afford. When a value is stored
//! into a location, the bytes are assigned into the location's existing
//! buffer, which is what keeps byrefs into that location observing the
//! store.
//!
//! The one contract everything here serves: interpretation must never
//! change observable behavior. Whenever the interpreter is not certain it
//! understands a construct, it reports a failure and the type falls back
//! to ordinary runtime initialization; a failed scan is a missed
//! optimization, never an error.

pub mod error;
pub mod il;
pub mod interp;
pub mod preinit;
pub mod types;
pub mod value;

pub use error::{FailureReason, InvalidIl, ScanError};
pub use preinit::{PreinitializationInfo, TypePreinit};
pub use types::{
    CompilationPolicy, ExceptionRegion, ExceptionRegionKind, FieldDef, FieldId, Intrinsic,
    MethodDef, MethodId, MethodIl, MethodSignature, SingleModulePolicy, TargetDetails, TokenValue,
    TypeCategory, TypeDef, TypeId, TypeRegistry, WellKnownTypes,
};
pub use value::{DataBuilder, FrozenObject, SerializableReference, SerializableValue, Value};
