//! The value model: everything the interpreter can hold in a stack slot,
//! local, argument, or static field.
//!
//! `Value` is a closed variant set. Not every variant supports every
//! capability: only byte-buffer values can be read through the narrow
//! accessors, only byrefs and object instances carry instance fields, and
//! only byte-buffer values are assignable in place. Asking a variant for a
//! capability it does not have is a loud failure, never a silent no-op.

use crate::{
    error::InvalidIl,
    types::{FieldId, TargetDetails, TypeRegistry},
};
use enum_dispatch::enum_dispatch;

pub mod byref;
pub mod object;
pub mod serialize;
pub mod string;

pub use byref::{ByRefValue, ValueTypeValue};
pub use object::{ArrayInstance, ObjectInstance};
pub use serialize::{DataBuilder, FrozenObject, SerializableReference, SerializableValue, TypeSymbol};
pub use string::StringInstance;

use byref::FieldAccessor;

/// A token identifying a field, produced by `ldtoken` and consumed by the
/// array-initializer intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFieldHandleValue {
    field: FieldId,
}

impl RuntimeFieldHandleValue {
    pub fn new(field: FieldId) -> Self {
        Self { field }
    }

    pub fn field(&self) -> FieldId {
        self.field
    }

    /// Handles occupy one pointer-sized slot.
    pub fn size(&self, target: TargetDetails) -> usize {
        target.pointer_size
    }
}

/// A datum manipulated during interpretation.
#[enum_dispatch(SerializableValue)]
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    ValueType(ValueTypeValue),
    FieldHandle(RuntimeFieldHandleValue),
    ByRef(ByRefValue),
    Object(ObjectInstance),
    Array(ArrayInstance),
    String(StringInstance),
}

/// A typed location's current content. `None` is the null reference (and
/// the zero-initialized state of GC-pointer-typed locations).
pub type Slot = Option<Value>;

impl Value {
    /// Structural equality over nullable locations, as `ceq` observes it.
    /// Byte-buffer values compare contents, reference values compare
    /// identity, byrefs compare referent identity.
    pub fn equals(a: &Slot, b: &Slot, meta: &TypeRegistry) -> Result<bool, InvalidIl> {
        match (a, b) {
            (None, None) => Ok(true),
            (None, Some(_)) | (Some(_), None) => Ok(false),
            (Some(a), Some(b)) => a.equals_value(b, meta),
        }
    }

    fn equals_value(&self, other: &Value, meta: &TypeRegistry) -> Result<bool, InvalidIl> {
        match (self, other) {
            (Value::ValueType(a), Value::ValueType(b)) => a.equals(b),
            (Value::FieldHandle(a), Value::FieldHandle(b)) => Ok(a.field() == b.field()),
            // A handle and a plain value type can share the ValueType
            // stack kind, but comparing them is a format violation.
            (Value::ValueType(a), Value::FieldHandle(h))
            | (Value::FieldHandle(h), Value::ValueType(a)) => {
                if a.size() != h.size(meta.target()) {
                    return Err(InvalidIl::WidthMismatch);
                }
                Err(InvalidIl::IncompatibleValue)
            }
            (Value::ByRef(a), Value::ByRef(b)) => Ok(a.same_referent(b)),
            (Value::Object(a), Value::Object(b)) => Ok(a.ptr_eq(b)),
            (Value::Array(a), Value::Array(b)) => Ok(a.ptr_eq(b)),
            (Value::String(a), Value::String(b)) => Ok(a.ptr_eq(b)),
            // Distinct reference variants are simply not the same object.
            (Value::Object(_) | Value::Array(_) | Value::String(_), _)
                if matches!(other, Value::Object(_) | Value::Array(_) | Value::String(_)) =>
            {
                Ok(false)
            }
            _ => Err(InvalidIl::IncompatibleValue),
        }
    }

    pub fn as_value_type(&self) -> Option<&ValueTypeValue> {
        match self {
            Value::ValueType(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Result<i8, InvalidIl> {
        self.require_value_type()?.as_i8()
    }

    pub fn as_i16(&self) -> Result<i16, InvalidIl> {
        self.require_value_type()?.as_i16()
    }

    pub fn as_i32(&self) -> Result<i32, InvalidIl> {
        self.require_value_type()?.as_i32()
    }

    pub fn as_i64(&self) -> Result<i64, InvalidIl> {
        self.require_value_type()?.as_i64()
    }

    pub fn as_f32(&self) -> Result<f32, InvalidIl> {
        self.require_value_type()?.as_f32()
    }

    pub fn as_f64(&self) -> Result<f64, InvalidIl> {
        self.require_value_type()?.as_f64()
    }

    fn require_value_type(&self) -> Result<&ValueTypeValue, InvalidIl> {
        self.as_value_type().ok_or(InvalidIl::IncompatibleValue)
    }

    /// The instance-field capability; `None` for variants without fields.
    pub(crate) fn field_accessor(&self) -> Option<FieldAccessor> {
        match self {
            Value::ByRef(b) => Some(b.accessor()),
            Value::Object(o) => Some(o.accessor()),
            _ => None,
        }
    }

    /// A value safe to place on the stack: byte buffers are copied so the
    /// stack never aliases a location, reference handles are shared.
    pub(crate) fn detached(&self) -> Value {
        match self {
            Value::ValueType(v) => Value::ValueType(v.detached()),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetDetails;

    #[test]
    fn null_equality() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        assert_eq!(Value::equals(&None, &None, &meta), Ok(true));
        let s = Some(Value::String(StringInstance::new("x")));
        assert_eq!(Value::equals(&None, &s, &meta), Ok(false));
        assert_eq!(Value::equals(&s, &None, &meta), Ok(false));
    }

    #[test]
    fn value_type_equality_is_structural() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let a = Some(Value::ValueType(ValueTypeValue::from_i32(3)));
        let b = Some(Value::ValueType(ValueTypeValue::from_i32(3)));
        let c = Some(Value::ValueType(ValueTypeValue::from_i32(4)));
        assert_eq!(Value::equals(&a, &b, &meta), Ok(true));
        assert_eq!(Value::equals(&a, &c, &meta), Ok(false));
    }

    #[test]
    fn mismatched_widths_are_a_format_violation() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let a = Some(Value::ValueType(ValueTypeValue::from_i32(3)));
        let b = Some(Value::ValueType(ValueTypeValue::from_i64(3)));
        assert_eq!(
            Value::equals(&a, &b, &meta),
            Err(InvalidIl::WidthMismatch)
        );
    }

    #[test]
    fn reference_equality_is_identity() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let s1 = StringInstance::new("a");
        let shared = Some(Value::String(s1.clone()));
        let same = Some(Value::String(s1));
        let other = Some(Value::String(StringInstance::new("a")));
        assert_eq!(Value::equals(&shared, &same, &meta), Ok(true));
        assert_eq!(Value::equals(&shared, &other, &meta), Ok(false));
    }

    #[test]
    fn narrow_accessors_reject_reference_values() {
        let value = Value::String(StringInstance::new("a"));
        assert_eq!(value.as_i32(), Err(InvalidIl::IncompatibleValue));
    }
}
