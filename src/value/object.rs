//! Reference-type instances the interpreter can materialize: plain (or
//! boxed) objects and single-dimension arrays. Cloning a handle shares the
//! instance; identity is handle identity.

use crate::{
    error::InvalidIl,
    types::{TypeId, TypeRegistry},
    value::byref::{FieldAccessor, SharedBytes, ValueTypeValue},
};
use std::{
    cell::RefCell,
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

struct ObjectData {
    ty: TypeId,
    /// Bytes reserved in front of the payload: the pointer-sized
    /// type-identity slot when this instance boxes a value type, zero for
    /// plain instances (whose field offsets already account for it).
    header: usize,
    bytes: SharedBytes,
}

/// A reference-type instance with field storage, optionally representing a
/// boxed value type.
#[derive(Clone)]
pub struct ObjectInstance {
    inner: Rc<ObjectData>,
}

impl ObjectInstance {
    /// A zero-initialized instance of a class. The buffer spans the whole
    /// instance including the leading type-identity slot; instance field
    /// offsets index into it directly.
    pub fn new(meta: &TypeRegistry, ty: TypeId) -> Self {
        let size = meta.ty(ty).instance_byte_count;
        Self {
            inner: Rc::new(ObjectData {
                ty,
                header: 0,
                bytes: Rc::new(RefCell::new(vec![0; size])),
            }),
        }
    }

    /// Boxes a value type: one reserved slot for the type identity, then
    /// the value's bytes.
    pub fn box_value(meta: &TypeRegistry, ty: TypeId, value: &ValueTypeValue) -> Self {
        let header = meta.target().pointer_size;
        let mut bytes = vec![0; header + meta.element_size(ty)];
        value.with_bytes(|src| bytes[header..header + src.len()].copy_from_slice(src));
        Self {
            inner: Rc::new(ObjectData {
                ty,
                header,
                bytes: Rc::new(RefCell::new(bytes)),
            }),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.inner.ty
    }

    pub fn is_boxed(&self) -> bool {
        self.inner.header != 0
    }

    /// Unwraps a boxed value type. The target must be non-nullable and
    /// match the boxed type exactly; anything else reports `None` and the
    /// caller escalates.
    pub fn try_unbox_any(&self, meta: &TypeRegistry, target: TypeId) -> Option<ValueTypeValue> {
        if !self.is_boxed() {
            return None;
        }
        let cat = meta.ty(target).category;
        if !cat.is_value_type() || cat == crate::types::TypeCategory::Nullable {
            return None;
        }
        if meta.underlying_type(target) != meta.underlying_type(self.inner.ty) {
            return None;
        }
        let bytes = self.inner.bytes.borrow();
        Some(ValueTypeValue::from_bytes(&bytes[self.inner.header..]))
    }

    pub fn ptr_eq(&self, other: &ObjectInstance) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn accessor(&self) -> FieldAccessor {
        FieldAccessor::new(Rc::clone(&self.inner.bytes), self.inner.header)
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.bytes.borrow())
    }
}

impl PartialEq for ObjectInstance {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Debug for ObjectInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectInstance(type {:?}, {} bytes{})",
            self.inner.ty,
            self.inner.bytes.borrow().len(),
            if self.is_boxed() { ", boxed" } else { "" }
        )
    }
}

struct ArrayData {
    element_type: TypeId,
    element_size: usize,
    length: usize,
    bytes: RefCell<Vec<u8>>,
}

/// A fixed-length single-dimension array of a non-GC element type.
#[derive(Clone)]
pub struct ArrayInstance {
    inner: Rc<ArrayData>,
}

impl ArrayInstance {
    pub fn new(meta: &TypeRegistry, element_type: TypeId, length: usize) -> Self {
        let element_size = meta.element_size(element_type);
        Self {
            inner: Rc::new(ArrayData {
                element_type,
                element_size,
                length,
                bytes: RefCell::new(vec![0; length * element_size]),
            }),
        }
    }

    pub fn element_type(&self) -> TypeId {
        self.inner.element_type
    }

    pub fn len(&self) -> usize {
        self.inner.length
    }

    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    /// Stores one element. Out-of-range indices report `false` (the
    /// caller fails the scan); a value of the wrong width is a format
    /// violation.
    pub fn try_store_element(&self, index: i32, value: &ValueTypeValue) -> Result<bool, InvalidIl> {
        if value.size() != self.inner.element_size {
            return Err(InvalidIl::WidthMismatch);
        }
        if index < 0 || index as usize >= self.inner.length {
            return Ok(false);
        }
        let offset = index as usize * self.inner.element_size;
        value.with_bytes(|src| {
            self.inner.bytes.borrow_mut()[offset..offset + src.len()].copy_from_slice(src)
        });
        Ok(true)
    }

    /// Bulk initialization from raw data; requires an exact length match.
    pub fn try_initialize(&self, data: &[u8]) -> bool {
        let mut bytes = self.inner.bytes.borrow_mut();
        if data.len() != bytes.len() {
            return false;
        }
        bytes.copy_from_slice(data);
        true
    }

    pub fn ptr_eq(&self, other: &ArrayInstance) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.bytes.borrow())
    }
}

impl PartialEq for ArrayInstance {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Debug for ArrayInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArrayInstance(element {:?} x {})",
            self.inner.element_type, self.inner.length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TargetDetails, TypeDef};

    #[test]
    fn box_and_unbox_round_trip() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let int32 = meta.well_known().int32;
        let boxed = ObjectInstance::box_value(&meta, int32, &ValueTypeValue::from_i32(77));
        assert!(boxed.is_boxed());
        let unboxed = boxed.try_unbox_any(&meta, int32).unwrap();
        assert_eq!(unboxed.as_i32().unwrap(), 77);
    }

    #[test]
    fn unbox_requires_exact_type() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let wk = *meta.well_known();
        let boxed = ObjectInstance::box_value(&meta, wk.int32, &ValueTypeValue::from_i32(1));
        assert!(boxed.try_unbox_any(&meta, wk.int64).is_none());
        assert!(boxed.try_unbox_any(&meta, wk.uint32).is_none());
    }

    #[test]
    fn unbox_through_an_enum_matches_its_underlying_primitive() {
        let mut meta = TypeRegistry::new(TargetDetails::X64);
        let int32 = meta.well_known().int32;
        let color = meta.add_type(TypeDef::enumeration("Color", int32, 4));
        let boxed = ObjectInstance::box_value(&meta, color, &ValueTypeValue::from_i32(2));
        assert!(boxed.try_unbox_any(&meta, int32).is_some());
        assert!(boxed.try_unbox_any(&meta, color).is_some());
    }

    #[test]
    fn plain_instances_do_not_unbox() {
        let mut meta = TypeRegistry::new(TargetDetails::X64);
        let holder = meta.add_type(TypeDef::class("Holder", 16));
        let instance = ObjectInstance::new(&meta, holder);
        assert!(instance
            .try_unbox_any(&meta, meta.well_known().int32)
            .is_none());
    }

    #[test]
    fn array_store_is_bounds_checked() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let int32 = meta.well_known().int32;
        let array = ArrayInstance::new(&meta, int32, 2);
        let value = ValueTypeValue::from_i32(5);
        assert_eq!(array.try_store_element(0, &value), Ok(true));
        assert_eq!(array.try_store_element(1, &value), Ok(true));
        assert_eq!(array.try_store_element(2, &value), Ok(false));
        assert_eq!(array.try_store_element(-1, &value), Ok(false));
        assert_eq!(
            array.try_store_element(0, &ValueTypeValue::from_i64(5)),
            Err(InvalidIl::WidthMismatch)
        );
    }

    #[test]
    fn bulk_initialize_requires_exact_length() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let array = ArrayInstance::new(&meta, meta.well_known().int16, 3);
        assert!(!array.try_initialize(&[0; 5]));
        assert!(array.try_initialize(&[1, 0, 2, 0, 3, 0]));
        array.with_bytes(|b| assert_eq!(b, [1, 0, 2, 0, 3, 0]));
    }

    #[test]
    fn handle_clones_share_the_instance() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let array = ArrayInstance::new(&meta, meta.well_known().int32, 1);
        let alias = array.clone();
        alias
            .try_store_element(0, &ValueTypeValue::from_i32(3))
            .unwrap();
        array.with_bytes(|b| assert_eq!(b, [3, 0, 0, 0]));
        assert!(array.ptr_eq(&alias));
    }
}
