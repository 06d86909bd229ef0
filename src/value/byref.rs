//! Byte-buffer-backed values and the aliasing references into them.
//!
//! All non-reference values are exact-size byte buffers. Buffers are
//! shared (`Rc<RefCell<..>>`) so that a byref is nothing but another
//! handle to the same buffer plus an offset; mutations through any alias
//! are visible through every other one.

use crate::{
    error::InvalidIl,
    types::{FieldId, TargetDetails, TypeRegistry},
};
use std::{
    cell::RefCell,
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

pub(crate) type SharedBytes = Rc<RefCell<Vec<u8>>>;

/// A value type, pointer, or function pointer, stored as an exact-length
/// byte buffer. Assignment copies bytes into the existing buffer rather
/// than replacing it, which is what keeps byrefs to the location working.
#[derive(Clone)]
pub struct ValueTypeValue {
    bytes: SharedBytes,
}

impl ValueTypeValue {
    pub fn zeroed(size: usize) -> Self {
        Self::from_bytes_owned(vec![0; size])
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_bytes_owned(bytes.to_vec())
    }

    fn from_bytes_owned(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(bytes)),
        }
    }

    pub fn from_i8(value: i8) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    pub fn from_i16(value: i16) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    pub fn from_i32(value: i32) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    pub fn from_i64(value: i64) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    pub fn from_f32(value: f32) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    pub fn from_f64(value: f64) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    /// A pointer-width integer for the given target.
    pub fn from_native_int(value: i64, target: TargetDetails) -> Self {
        if target.pointer_size == 8 {
            Self::from_i64(value)
        } else {
            Self::from_i32(value as i32)
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.borrow().len()
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.borrow())
    }

    fn exact<const N: usize>(&self) -> Result<[u8; N], InvalidIl> {
        let bytes = self.bytes.borrow();
        if bytes.len() != N {
            return Err(InvalidIl::WidthMismatch);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    pub fn as_i8(&self) -> Result<i8, InvalidIl> {
        Ok(i8::from_le_bytes(self.exact()?))
    }

    pub fn as_i16(&self) -> Result<i16, InvalidIl> {
        Ok(i16::from_le_bytes(self.exact()?))
    }

    pub fn as_i32(&self) -> Result<i32, InvalidIl> {
        Ok(i32::from_le_bytes(self.exact()?))
    }

    pub fn as_i64(&self) -> Result<i64, InvalidIl> {
        Ok(i64::from_le_bytes(self.exact()?))
    }

    pub fn as_f32(&self) -> Result<f32, InvalidIl> {
        Ok(f32::from_le_bytes(self.exact()?))
    }

    pub fn as_f64(&self) -> Result<f64, InvalidIl> {
        Ok(f64::from_le_bytes(self.exact()?))
    }

    /// Byte-for-byte copy into this value's existing buffer. Both sides
    /// must have the same width.
    pub fn assign(&self, other: &ValueTypeValue) -> Result<(), InvalidIl> {
        // Assigning a buffer to itself would double-borrow the RefCell.
        if Rc::ptr_eq(&self.bytes, &other.bytes) {
            return Ok(());
        }
        let src = other.bytes.borrow();
        let mut dst = self.bytes.borrow_mut();
        if src.len() != dst.len() {
            return Err(InvalidIl::WidthMismatch);
        }
        dst.copy_from_slice(&src);
        Ok(())
    }

    /// Structural equality. Comparing values of different widths is a
    /// format violation, not `false`.
    pub fn equals(&self, other: &ValueTypeValue) -> Result<bool, InvalidIl> {
        if Rc::ptr_eq(&self.bytes, &other.bytes) {
            return Ok(true);
        }
        let a = self.bytes.borrow();
        let b = other.bytes.borrow();
        if a.len() != b.len() {
            return Err(InvalidIl::WidthMismatch);
        }
        Ok(*a == *b)
    }

    /// An aliasing reference to the start of this value's storage.
    pub fn create_byref(&self) -> ByRefValue {
        ByRefValue::new(Rc::clone(&self.bytes), 0)
    }

    /// A fresh value with its own copy of the bytes.
    pub fn detached(&self) -> Self {
        Self::from_bytes(&self.bytes.borrow())
    }
}

impl PartialEq for ValueTypeValue {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other).unwrap_or(false)
    }
}

impl Debug for ValueTypeValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ValueTypeValue({:02x?})", &*self.bytes.borrow())
    }
}

/// An aliasing reference into a byte buffer at an offset. Never owns the
/// storage it points into.
#[derive(Clone)]
pub struct ByRefValue {
    bytes: SharedBytes,
    offset: usize,
}

impl ByRefValue {
    pub(crate) fn new(bytes: SharedBytes, offset: usize) -> Self {
        Self { bytes, offset }
    }

    /// Zero-fills `size` bytes at the referenced location.
    pub fn initialize(&self, size: usize) -> Result<(), InvalidIl> {
        let mut bytes = self.bytes.borrow_mut();
        let end = self.offset.checked_add(size).ok_or(InvalidIl::OutOfBounds)?;
        if end > bytes.len() {
            return Err(InvalidIl::OutOfBounds);
        }
        bytes[self.offset..end].fill(0);
        Ok(())
    }

    /// Identity of the referenced location: same buffer, same offset.
    pub fn same_referent(&self, other: &ByRefValue) -> bool {
        Rc::ptr_eq(&self.bytes, &other.bytes) && self.offset == other.offset
    }

    pub(crate) fn accessor(&self) -> FieldAccessor {
        FieldAccessor::new(Rc::clone(&self.bytes), self.offset)
    }
}

impl PartialEq for ByRefValue {
    fn eq(&self, other: &Self) -> bool {
        self.same_referent(other)
    }
}

impl Debug for ByRefValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ByRefValue(+{})", self.offset)
    }
}

/// Byte-level field access shared by byrefs and object instances.
pub(crate) struct FieldAccessor {
    bytes: SharedBytes,
    base: usize,
}

impl FieldAccessor {
    pub(crate) fn new(bytes: SharedBytes, base: usize) -> Self {
        Self { bytes, base }
    }

    pub(crate) fn get_field(
        &self,
        meta: &TypeRegistry,
        field: FieldId,
    ) -> Result<ValueTypeValue, InvalidIl> {
        let (offset, size) = self.field_range(meta, field)?;
        let bytes = self.bytes.borrow();
        Ok(ValueTypeValue::from_bytes(&bytes[offset..offset + size]))
    }

    pub(crate) fn set_field(
        &self,
        meta: &TypeRegistry,
        field: FieldId,
        value: &ValueTypeValue,
    ) -> Result<(), InvalidIl> {
        let (offset, size) = self.field_range(meta, field)?;
        // Copied out first: the source may alias this very buffer.
        let src = value.with_bytes(|b| b.to_vec());
        if src.len() != size {
            return Err(InvalidIl::WidthMismatch);
        }
        self.bytes.borrow_mut()[offset..offset + size].copy_from_slice(&src);
        Ok(())
    }

    pub(crate) fn field_address(
        &self,
        meta: &TypeRegistry,
        field: FieldId,
    ) -> Result<ByRefValue, InvalidIl> {
        let (offset, _) = self.field_range(meta, field)?;
        Ok(ByRefValue::new(Rc::clone(&self.bytes), offset))
    }

    fn field_range(&self, meta: &TypeRegistry, field: FieldId) -> Result<(usize, usize), InvalidIl> {
        let fdef = meta.field(field);
        debug_assert!(!fdef.is_static);
        debug_assert!(!meta.ty(fdef.field_type).category.is_gc_pointer());
        let offset = self
            .base
            .checked_add(fdef.offset)
            .ok_or(InvalidIl::OutOfBounds)?;
        let size = meta.element_size(fdef.field_type);
        let end = offset.checked_add(size).ok_or(InvalidIl::OutOfBounds)?;
        if end > self.bytes.borrow().len() {
            return Err(InvalidIl::OutOfBounds);
        }
        Ok((offset, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_round_trips() {
        assert_eq!(ValueTypeValue::from_i32(42).as_i32().unwrap(), 42);
        assert_eq!(ValueTypeValue::from_i64(-1).as_i64().unwrap(), -1);
        assert_eq!(ValueTypeValue::from_i8(-5).as_i8().unwrap(), -5);
        let nan = ValueTypeValue::from_f64(f64::NAN).as_f64().unwrap();
        assert!(nan.is_nan());
    }

    #[test]
    fn narrow_accessors_enforce_width() {
        let v = ValueTypeValue::from_i32(1);
        assert_eq!(v.as_i64(), Err(InvalidIl::WidthMismatch));
        assert_eq!(v.as_i16(), Err(InvalidIl::WidthMismatch));
        assert_eq!(v.as_i32(), Ok(1));
    }

    #[test]
    fn scalars_are_little_endian() {
        ValueTypeValue::from_i32(42).with_bytes(|b| assert_eq!(b, [42, 0, 0, 0]));
        ValueTypeValue::from_i16(-2).with_bytes(|b| assert_eq!(b, [0xFE, 0xFF]));
    }

    #[test]
    fn assign_requires_matching_width() {
        let dst = ValueTypeValue::zeroed(4);
        assert_eq!(
            dst.assign(&ValueTypeValue::from_i64(1)),
            Err(InvalidIl::WidthMismatch)
        );
        dst.assign(&ValueTypeValue::from_i32(7)).unwrap();
        assert_eq!(dst.as_i32().unwrap(), 7);
    }

    #[test]
    fn byref_mutation_is_visible_through_the_source() {
        let local = ValueTypeValue::zeroed(4);
        let byref = local.create_byref();
        byref
            .accessor()
            .set_field_raw_for_test(0, &ValueTypeValue::from_i32(9));
        assert_eq!(local.as_i32().unwrap(), 9);
    }

    #[test]
    fn detached_copies_do_not_alias() {
        let original = ValueTypeValue::from_i32(1);
        let copy = original.detached();
        original.assign(&ValueTypeValue::from_i32(2)).unwrap();
        assert_eq!(copy.as_i32().unwrap(), 1);
        assert_eq!(original.as_i32().unwrap(), 2);
    }

    #[test]
    fn initialize_zero_fills_and_bounds_checks() {
        let value = ValueTypeValue::from_i32(-1);
        let byref = value.create_byref();
        byref.initialize(4).unwrap();
        assert_eq!(value.as_i32().unwrap(), 0);
        assert_eq!(byref.initialize(5), Err(InvalidIl::OutOfBounds));
    }

    #[test]
    fn byref_identity_is_buffer_and_offset() {
        let a = ValueTypeValue::zeroed(8);
        let b = ValueTypeValue::zeroed(8);
        assert!(a.create_byref().same_referent(&a.create_byref()));
        assert!(!a.create_byref().same_referent(&b.create_byref()));
    }

    impl FieldAccessor {
        fn set_field_raw_for_test(&self, offset: usize, value: &ValueTypeValue) {
            let src = value.with_bytes(|b| b.to_vec());
            self.bytes.borrow_mut()[self.base + offset..self.base + offset + src.len()]
                .copy_from_slice(&src);
        }
    }
}
