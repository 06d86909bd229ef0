//! The serialization seam: how a finished snapshot turns into bytes and
//! relocations in whatever object-file builder the embedder brings.
//!
//! Nothing here writes an object file. The interpreter's outputs describe
//! themselves to a [`DataBuilder`] and the embedder decides what a
//! relocation or a frozen object payload becomes. Every value variant must
//! serialize deterministically: same snapshot, same emission.

use crate::{
    error::InvalidIl,
    types::{FieldId, TypeId, TypeRegistry},
};
use enum_dispatch::enum_dispatch;

use super::{
    ArrayInstance, ByRefValue, ObjectInstance, RuntimeFieldHandleValue, StringInstance,
    ValueTypeValue,
};

/// A symbol the builder can emit a pointer relocation against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSymbol {
    /// The constructed type identity of a class instance.
    Constructed(TypeId),
    /// The constructed array type with the given element type.
    Array { element: TypeId },
}

/// A reference-type instance whose payload gets frozen into the binary.
#[derive(Debug, Clone)]
pub enum FrozenObject {
    Object(ObjectInstance),
    Array(ArrayInstance),
}

impl FrozenObject {
    pub fn write_content(
        &self,
        meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        match self {
            FrozenObject::Object(o) => o.write_content(meta, builder),
            FrozenObject::Array(a) => a.write_content(meta, builder),
        }
    }
}

/// Target-independent byte/relocation sink.
pub trait DataBuilder {
    fn emit_bytes(&mut self, bytes: &[u8]);

    fn emit_int32(&mut self, value: i32);

    /// Pointer relocation against the runtime field handle of `field`.
    fn emit_field_handle_reloc(&mut self, field: FieldId);

    /// Pointer relocation against the frozen string object for `contents`.
    fn emit_string_reloc(&mut self, contents: &str);

    /// Pointer relocation against a frozen object; the builder is expected
    /// to emit the object's content (via [`FrozenObject::write_content`])
    /// somewhere and point here at it.
    fn emit_frozen_object_reloc(&mut self, field: FieldId, object: FrozenObject);

    /// Pointer relocation against a constructed type symbol.
    fn emit_type_reloc(&mut self, ty: TypeSymbol);
}

/// What every value variant supports: emitting the bytes/relocations for
/// a static field whose final value it is.
#[enum_dispatch]
pub trait SerializableValue {
    fn write_field_data(
        &self,
        field: FieldId,
        meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl>;
}

impl SerializableValue for ValueTypeValue {
    fn write_field_data(
        &self,
        field: FieldId,
        meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        debug_assert_eq!(meta.element_size(meta.field(field).field_type), self.size());
        self.with_bytes(|bytes| builder.emit_bytes(bytes));
        Ok(())
    }
}

impl SerializableValue for RuntimeFieldHandleValue {
    fn write_field_data(
        &self,
        _field: FieldId,
        _meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        builder.emit_field_handle_reloc(self.field());
        Ok(())
    }
}

impl SerializableValue for ByRefValue {
    fn write_field_data(
        &self,
        _field: FieldId,
        _meta: &TypeRegistry,
        _builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        // A byref-typed static field; field layout should have blocked it.
        Err(InvalidIl::IncompatibleValue)
    }
}

impl SerializableValue for ObjectInstance {
    fn write_field_data(
        &self,
        field: FieldId,
        _meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        builder.emit_frozen_object_reloc(field, FrozenObject::Object(self.clone()));
        Ok(())
    }
}

impl SerializableValue for ArrayInstance {
    fn write_field_data(
        &self,
        field: FieldId,
        _meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        builder.emit_frozen_object_reloc(field, FrozenObject::Array(self.clone()));
        Ok(())
    }
}

impl SerializableValue for StringInstance {
    fn write_field_data(
        &self,
        _field: FieldId,
        _meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        builder.emit_string_reloc(self.as_str());
        Ok(())
    }
}

/// Reference values additionally know how to lay out their own frozen
/// payload.
pub trait SerializableReference {
    fn write_content(
        &self,
        meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl>;
}

impl SerializableReference for ArrayInstance {
    fn write_content(
        &self,
        meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        builder.emit_type_reloc(TypeSymbol::Array {
            element: self.element_type(),
        });
        builder.emit_int32(self.len() as i32);
        if meta.target().pointer_size == 8 {
            // The length field pads out to pointer size on 64-bit.
            builder.emit_int32(0);
        }
        self.with_bytes(|bytes| builder.emit_bytes(bytes));
        Ok(())
    }
}

impl SerializableReference for ObjectInstance {
    fn write_content(
        &self,
        meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), InvalidIl> {
        builder.emit_type_reloc(TypeSymbol::Constructed(self.type_id()));
        // The leading slot is the type identity emitted above.
        let pointer_size = meta.target().pointer_size;
        self.with_bytes(|bytes| {
            if bytes.len() < pointer_size {
                return Err(InvalidIl::OutOfBounds);
            }
            builder.emit_bytes(&bytes[pointer_size..]);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDef, TargetDetails, TypeDef};

    #[derive(Default)]
    struct RecordingBuilder {
        bytes: Vec<u8>,
        relocs: Vec<String>,
    }

    impl DataBuilder for RecordingBuilder {
        fn emit_bytes(&mut self, bytes: &[u8]) {
            self.bytes.extend_from_slice(bytes);
        }

        fn emit_int32(&mut self, value: i32) {
            self.bytes.extend_from_slice(&value.to_le_bytes());
        }

        fn emit_field_handle_reloc(&mut self, field: FieldId) {
            self.relocs.push(format!("fieldhandle:{field:?}"));
        }

        fn emit_string_reloc(&mut self, contents: &str) {
            self.relocs.push(format!("string:{contents}"));
        }

        fn emit_frozen_object_reloc(&mut self, _field: FieldId, object: FrozenObject) {
            self.relocs.push(format!("frozen:{object:?}"));
        }

        fn emit_type_reloc(&mut self, ty: TypeSymbol) {
            self.relocs.push(format!("type:{ty:?}"));
        }
    }

    #[test]
    fn scalars_emit_their_exact_bytes() {
        let mut meta = TypeRegistry::new(TargetDetails::X64);
        let int32 = meta.well_known().int32;
        let holder = meta.add_type(TypeDef::class("Holder", 8));
        let field = meta.add_field(FieldDef::static_field(holder, "F", int32));

        let mut builder = RecordingBuilder::default();
        ValueTypeValue::from_i32(42)
            .write_field_data(field, &meta, &mut builder)
            .unwrap();
        assert_eq!(builder.bytes, [42, 0, 0, 0]);
        assert!(builder.relocs.is_empty());
    }

    #[test]
    fn array_content_has_type_length_padding_payload() {
        let meta = TypeRegistry::new(TargetDetails::X64);
        let int32 = meta.well_known().int32;
        let array = ArrayInstance::new(&meta, int32, 2);
        array
            .try_store_element(0, &ValueTypeValue::from_i32(1))
            .unwrap();
        array
            .try_store_element(1, &ValueTypeValue::from_i32(2))
            .unwrap();

        let mut builder = RecordingBuilder::default();
        array.write_content(&meta, &mut builder).unwrap();
        assert_eq!(builder.relocs.len(), 1);
        // length, 32 bits of padding, then two elements
        assert_eq!(
            builder.bytes,
            [2, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0]
        );
    }

    #[test]
    fn array_content_is_not_padded_on_32_bit() {
        let meta = TypeRegistry::new(TargetDetails::X86);
        let array = ArrayInstance::new(&meta, meta.well_known().int32, 1);
        let mut builder = RecordingBuilder::default();
        array.write_content(&meta, &mut builder).unwrap();
        assert_eq!(builder.bytes, [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn object_content_skips_the_identity_slot() {
        let mut meta = TypeRegistry::new(TargetDetails::X64);
        let holder = meta.add_type(TypeDef::class("Holder", 12));
        let instance = ObjectInstance::new(&meta, holder);

        let mut builder = RecordingBuilder::default();
        instance.write_content(&meta, &mut builder).unwrap();
        assert_eq!(builder.relocs, ["type:Constructed(TypeId(16))"]);
        assert_eq!(builder.bytes.len(), 4);
    }

    #[test]
    fn field_handles_emit_handle_relocs() {
        let mut meta = TypeRegistry::new(TargetDetails::X64);
        let int32 = meta.well_known().int32;
        let holder = meta.add_type(TypeDef::class("Holder", 8));
        let handle_type = meta.add_type(TypeDef::value_type("System.RuntimeFieldHandle", 8));
        let target = meta.add_field(FieldDef::static_field(holder, "Blob", int32));
        let handle_field = meta.add_field(FieldDef::static_field(holder, "H", handle_type));

        let mut builder = RecordingBuilder::default();
        RuntimeFieldHandleValue::new(target)
            .write_field_data(handle_field, &meta, &mut builder)
            .unwrap();
        assert_eq!(builder.relocs, [format!("fieldhandle:{target:?}")]);
        assert!(builder.bytes.is_empty());
    }

    #[test]
    fn byref_statics_cannot_serialize() {
        let mut meta = TypeRegistry::new(TargetDetails::X64);
        let int32 = meta.well_known().int32;
        let holder = meta.add_type(TypeDef::class("Holder", 8));
        let field = meta.add_field(FieldDef::static_field(holder, "F", int32));

        let value = ValueTypeValue::zeroed(4);
        let byref = value.create_byref();
        let mut builder = RecordingBuilder::default();
        assert_eq!(
            byref.write_field_data(field, &meta, &mut builder),
            Err(InvalidIl::IncompatibleValue)
        );
    }
}
