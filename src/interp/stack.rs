//! The typed operand stack and the location coercion rules.
//!
//! Every entry pairs a value with the stack kind it was pushed under.
//! Moving values between the stack and typed locations goes through
//! `push_from_location` / `pop_into_location`, which implement the
//! bytecode's implicit numeric promotions exactly; any conversion path not
//! in the table is a format violation, never a guess.

use crate::{
    error::InvalidIl,
    types::{TargetDetails, TypeCategory, TypeId, TypeRegistry},
    value::{ByRefValue, Slot, Value, ValueTypeValue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackValueKind {
    Int32,
    Int64,
    NativeInt,
    Float,
    ByRef,
    ObjRef,
    ValueType,
}

#[derive(Debug, Clone)]
pub struct StackEntry {
    pub kind: StackValueKind,
    pub value: Slot,
}

/// The evaluation stack of one method invocation.
pub struct EvalStack {
    entries: Vec<StackEntry>,
    target: TargetDetails,
}

impl EvalStack {
    pub fn new(max_stack: usize, target: TargetDetails) -> Self {
        Self {
            entries: Vec::with_capacity(max_stack),
            target,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, kind: StackValueKind, value: Value) {
        self.push_slot(kind, Some(value));
    }

    pub fn push_slot(&mut self, kind: StackValueKind, value: Slot) {
        self.entries.push(StackEntry { kind, value });
    }

    pub fn push_entry(&mut self, entry: StackEntry) {
        self.entries.push(entry);
    }

    pub fn push_objref(&mut self, value: Slot) {
        self.push_slot(StackValueKind::ObjRef, value);
    }

    pub fn push_byref(&mut self, value: ByRefValue) {
        self.push(StackValueKind::ByRef, Value::ByRef(value));
    }

    pub fn peek(&self) -> Result<&StackEntry, InvalidIl> {
        self.entries.last().ok_or(InvalidIl::StackUnderflow)
    }

    pub fn pop(&mut self) -> Result<StackEntry, InvalidIl> {
        self.entries.pop().ok_or(InvalidIl::StackUnderflow)
    }

    /// Pops an array-index-shaped integer: Int32 directly, NativeInt when
    /// it fits in 32 bits. Anything else is `None`; the caller decides
    /// whether that is fatal.
    pub fn try_pop_int_value(&mut self) -> Result<Option<i32>, InvalidIl> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let entry = self.pop()?;
        match entry.kind {
            StackValueKind::Int32 => Ok(Some(slot_value(&entry.value)?.as_i32()?)),
            StackValueKind::NativeInt => {
                if self.target.pointer_size == 8 {
                    let wide = slot_value(&entry.value)?.as_i64()?;
                    if wide < i32::MIN as i64 || wide > i32::MAX as i64 {
                        Ok(None)
                    } else {
                        Ok(Some(wide as i32))
                    }
                } else {
                    Ok(Some(slot_value(&entry.value)?.as_i32()?))
                }
            }
            _ => Ok(None),
        }
    }

    /// Pushes the content of a typed location, applying the kind promotion
    /// the location's static type dictates. Byte-buffer values are pushed
    /// as fresh copies; only reference handles and byrefs are shared.
    pub fn push_from_location(
        &mut self,
        meta: &TypeRegistry,
        location_type: TypeId,
        value: &Slot,
    ) -> Result<(), InvalidIl> {
        use TypeCategory::*;
        match meta.underlying_category(location_type) {
            Boolean | Byte => {
                let widened = slot_value(value)?.as_i8()? as u8 as i32;
                self.push(StackValueKind::Int32, ValueTypeValue::from_i32(widened).into());
            }
            Char | UInt16 => {
                let widened = slot_value(value)?.as_i16()? as u16 as i32;
                self.push(StackValueKind::Int32, ValueTypeValue::from_i32(widened).into());
            }
            SByte => {
                let widened = slot_value(value)?.as_i8()? as i32;
                self.push(StackValueKind::Int32, ValueTypeValue::from_i32(widened).into());
            }
            Int16 => {
                let widened = slot_value(value)?.as_i16()? as i32;
                self.push(StackValueKind::Int32, ValueTypeValue::from_i32(widened).into());
            }
            Int32 | UInt32 => {
                self.push(StackValueKind::Int32, slot_value(value)?.detached());
            }
            Int64 | UInt64 => {
                self.push(StackValueKind::Int64, slot_value(value)?.detached());
            }
            IntPtr | UIntPtr | Pointer | FunctionPointer => {
                self.push(StackValueKind::NativeInt, slot_value(value)?.detached());
            }
            Single => {
                // Floats share one stack kind; singles widen on load and
                // narrow again at the point of storage.
                let widened = slot_value(value)?.as_f32()? as f64;
                self.push(StackValueKind::Float, ValueTypeValue::from_f64(widened).into());
            }
            Double => {
                self.push(StackValueKind::Float, slot_value(value)?.detached());
            }
            ValueType | Nullable => {
                self.push(StackValueKind::ValueType, slot_value(value)?.detached());
            }
            Class | Interface | Array => {
                self.push_slot(StackValueKind::ObjRef, value.clone());
            }
            ByRef => {
                self.push_slot(StackValueKind::ByRef, value.clone());
            }
        }
        Ok(())
    }

    /// Pops the top entry into a typed location, validating and narrowing
    /// per the conversion table.
    pub fn pop_into_location(
        &mut self,
        meta: &TypeRegistry,
        location_type: TypeId,
    ) -> Result<Slot, InvalidIl> {
        use TypeCategory::*;
        let location_type = meta.underlying_type(location_type);
        let category = meta.ty(location_type).category;
        let popped = self.pop()?;

        match popped.kind {
            StackValueKind::Int64 => {
                if !matches!(category, Int64 | UInt64) {
                    return Err(InvalidIl::KindMismatch);
                }
                Ok(popped.value)
            }

            StackValueKind::Int32 => {
                if matches!(category, Int32 | UInt32) {
                    return Ok(popped.value);
                }
                let value = slot_value(&popped.value)?.as_i32()?;
                match category {
                    SByte | Byte | Boolean => {
                        Ok(Some(ValueTypeValue::from_i8(value as i8).into()))
                    }
                    Int16 | UInt16 | Char => {
                        Ok(Some(ValueTypeValue::from_i16(value as i16).into()))
                    }
                    _ => Err(InvalidIl::KindMismatch),
                }
            }

            StackValueKind::NativeInt => {
                if category.is_pointer_like() {
                    return Ok(popped.value);
                }
                let value = if self.target.pointer_size == 8 {
                    slot_value(&popped.value)?.as_i64()?
                } else {
                    slot_value(&popped.value)?.as_i32()? as i64
                };
                match category {
                    SByte | Byte | Boolean => {
                        Ok(Some(ValueTypeValue::from_i8(value as i8).into()))
                    }
                    Int16 | UInt16 | Char => {
                        Ok(Some(ValueTypeValue::from_i16(value as i16).into()))
                    }
                    Int32 | UInt32 => Ok(Some(ValueTypeValue::from_i32(value as i32).into())),
                    _ => Err(InvalidIl::KindMismatch),
                }
            }

            StackValueKind::Float => match category {
                Double => Ok(popped.value),
                Single => {
                    let narrowed = slot_value(&popped.value)?.as_f64()? as f32;
                    Ok(Some(ValueTypeValue::from_f32(narrowed).into()))
                }
                _ => Err(InvalidIl::KindMismatch),
            },

            StackValueKind::ByRef => {
                if category != ByRef {
                    return Err(InvalidIl::KindMismatch);
                }
                Ok(popped.value)
            }

            StackValueKind::ObjRef => {
                if !category.is_gc_pointer() {
                    return Err(InvalidIl::KindMismatch);
                }
                Ok(popped.value)
            }

            StackValueKind::ValueType => {
                if !category.is_value_type() {
                    return Err(InvalidIl::KindMismatch);
                }
                let size = match popped.value.as_ref().ok_or(InvalidIl::IncompatibleValue)? {
                    Value::ValueType(v) => v.size(),
                    Value::FieldHandle(h) => h.size(self.target),
                    _ => return Err(InvalidIl::IncompatibleValue),
                };
                if size != meta.element_size(location_type) {
                    return Err(InvalidIl::WidthMismatch);
                }
                Ok(popped.value)
            }
        }
    }
}

fn slot_value(slot: &Slot) -> Result<&Value, InvalidIl> {
    slot.as_ref().ok_or(InvalidIl::IncompatibleValue)
}
