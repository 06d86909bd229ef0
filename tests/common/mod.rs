//! Shared scaffolding for the end-to-end tests: a descriptor fixture and a
//! small IL assembler with label patching.

#![allow(dead_code)]

use preinit_rs::{
    value::TypeSymbol, DataBuilder, ExceptionRegion, FieldDef, FieldId, FrozenObject, MethodDef,
    MethodId, MethodIl, MethodSignature, PreinitializationInfo, SingleModulePolicy, TargetDetails,
    TokenValue, TypeDef, TypeId, TypePreinit, TypeRegistry,
};

pub struct Fixture {
    pub meta: TypeRegistry,
    pub ty: TypeId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_target(TargetDetails::X64)
    }

    pub fn with_target(target: TargetDetails) -> Self {
        let mut meta = TypeRegistry::new(target);
        let ty = meta.add_type(TypeDef::class("Preinit.Holder", 8));
        Self { meta, ty }
    }

    pub fn static_field(&mut self, name: &str, field_type: TypeId) -> FieldId {
        self.meta
            .add_field(FieldDef::static_field(self.ty, name, field_type))
    }

    pub fn thread_static_field(&mut self, name: &str, field_type: TypeId) -> FieldId {
        self.meta.add_field(FieldDef {
            is_thread_static: true,
            ..FieldDef::static_field(self.ty, name, field_type)
        })
    }

    pub fn helper(&mut self, name: &str, signature: MethodSignature, body: MethodIl) -> MethodId {
        self.meta
            .add_method(MethodDef::new(self.ty, name, signature, Some(body)))
    }

    pub fn cctor(&mut self, body: MethodIl) -> MethodId {
        let cctor = self.meta.add_method(MethodDef::new(
            self.ty,
            ".cctor",
            MethodSignature::static_void(),
            Some(body),
        ));
        self.meta.set_static_constructor(self.ty, cctor);
        cctor
    }

    pub fn scan(&self) -> PreinitializationInfo {
        TypePreinit::scan_type(&self.meta, &SingleModulePolicy, self.ty)
    }

    pub fn int_array_type(&mut self) -> TypeId {
        let int32 = self.meta.well_known().int32;
        self.meta.add_type(TypeDef::array("System.Int32[]", int32))
    }

    pub fn snapshot_i32(&self, info: &PreinitializationInfo, field: FieldId) -> i32 {
        info.field_value(field).unwrap().as_i32().unwrap()
    }

    pub fn snapshot_i64(&self, info: &PreinitializationInfo, field: FieldId) -> i64 {
        info.field_value(field).unwrap().as_i64().unwrap()
    }

    pub fn snapshot_f32(&self, info: &PreinitializationInfo, field: FieldId) -> f32 {
        info.field_value(field).unwrap().as_f32().unwrap()
    }

    pub fn snapshot_f64(&self, info: &PreinitializationInfo, field: FieldId) -> f64 {
        info.field_value(field).unwrap().as_f64().unwrap()
    }
}

pub struct Label(usize);

struct Patch {
    operand_at: usize,
    label: usize,
    short: bool,
}

/// Emits raw IL bytes. Branch targets go through labels so the tests never
/// hand-compute deltas.
pub struct IlAsm {
    il: Vec<u8>,
    tokens: Vec<TokenValue>,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
}

impl IlAsm {
    pub fn new() -> Self {
        Self {
            il: Vec::new(),
            tokens: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.il.extend_from_slice(bytes);
        self
    }

    fn token(&mut self, value: TokenValue) -> u32 {
        self.tokens.push(value);
        (self.tokens.len() - 1) as u32
    }

    fn op_token(&mut self, opcode: u8, value: TokenValue) -> &mut Self {
        let token = self.token(value);
        self.il.push(opcode);
        self.il.extend_from_slice(&token.to_le_bytes());
        self
    }

    fn ext_op_token(&mut self, second: u8, value: TokenValue) -> &mut Self {
        let token = self.token(value);
        self.il.extend_from_slice(&[0xFE, second]);
        self.il.extend_from_slice(&token.to_le_bytes());
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn mark(&mut self, label: &Label) -> &mut Self {
        self.labels[label.0] = Some(self.il.len());
        self
    }

    fn branch(&mut self, opcode: u8, label: &Label) -> &mut Self {
        self.il.push(opcode);
        self.patches.push(Patch {
            operand_at: self.il.len(),
            label: label.0,
            short: false,
        });
        self.il.extend_from_slice(&[0; 4]);
        self
    }

    fn branch_s(&mut self, opcode: u8, label: &Label) -> &mut Self {
        self.il.push(opcode);
        self.patches.push(Patch {
            operand_at: self.il.len(),
            label: label.0,
            short: true,
        });
        self.il.push(0);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.raw(&[0x00])
    }

    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        self.il.push(0x20);
        self.il.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_i4_s(&mut self, value: i8) -> &mut Self {
        self.raw(&[0x1F, value as u8])
    }

    pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
        self.il.push(0x21);
        self.il.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_r4(&mut self, value: f32) -> &mut Self {
        self.il.push(0x22);
        self.il.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_r8(&mut self, value: f64) -> &mut Self {
        self.il.push(0x23);
        self.il.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldnull(&mut self) -> &mut Self {
        self.raw(&[0x14])
    }

    pub fn ldstr(&mut self, literal: &str) -> &mut Self {
        self.op_token(0x72, TokenValue::String(literal.to_string()))
    }

    pub fn dup(&mut self) -> &mut Self {
        self.raw(&[0x25])
    }

    pub fn pop(&mut self) -> &mut Self {
        self.raw(&[0x26])
    }

    pub fn ret(&mut self) -> &mut Self {
        self.raw(&[0x2A])
    }

    pub fn ldloc(&mut self, index: u8) -> &mut Self {
        match index {
            0..=3 => self.raw(&[0x06 + index]),
            _ => self.raw(&[0x11, index]),
        }
    }

    pub fn stloc(&mut self, index: u8) -> &mut Self {
        match index {
            0..=3 => self.raw(&[0x0A + index]),
            _ => self.raw(&[0x13, index]),
        }
    }

    pub fn ldloca(&mut self, index: u8) -> &mut Self {
        self.raw(&[0x12, index])
    }

    pub fn ldarg(&mut self, index: u8) -> &mut Self {
        match index {
            0..=3 => self.raw(&[0x02 + index]),
            _ => self.raw(&[0x0E, index]),
        }
    }

    pub fn starg(&mut self, index: u8) -> &mut Self {
        self.raw(&[0x10, index])
    }

    pub fn call(&mut self, method: MethodId) -> &mut Self {
        self.op_token(0x28, TokenValue::Method(method))
    }

    pub fn newobj(&mut self, ctor: MethodId) -> &mut Self {
        self.op_token(0x73, TokenValue::Method(ctor))
    }

    pub fn ldsfld(&mut self, field: FieldId) -> &mut Self {
        self.op_token(0x7E, TokenValue::Field(field))
    }

    pub fn ldsflda(&mut self, field: FieldId) -> &mut Self {
        self.op_token(0x7F, TokenValue::Field(field))
    }

    pub fn stsfld(&mut self, field: FieldId) -> &mut Self {
        self.op_token(0x80, TokenValue::Field(field))
    }

    pub fn ldfld(&mut self, field: FieldId) -> &mut Self {
        self.op_token(0x7B, TokenValue::Field(field))
    }

    pub fn ldflda(&mut self, field: FieldId) -> &mut Self {
        self.op_token(0x7C, TokenValue::Field(field))
    }

    pub fn stfld(&mut self, field: FieldId) -> &mut Self {
        self.op_token(0x7D, TokenValue::Field(field))
    }

    pub fn ldtoken(&mut self, field: FieldId) -> &mut Self {
        self.op_token(0xD0, TokenValue::Field(field))
    }

    pub fn newarr(&mut self, element: TypeId) -> &mut Self {
        self.op_token(0x8D, TokenValue::Type(element))
    }

    pub fn ldlen(&mut self) -> &mut Self {
        self.raw(&[0x8E])
    }

    pub fn stelem(&mut self, element: TypeId) -> &mut Self {
        self.op_token(0xA4, TokenValue::Type(element))
    }

    pub fn stelem_i1(&mut self) -> &mut Self {
        self.raw(&[0x9C])
    }

    pub fn stelem_i2(&mut self) -> &mut Self {
        self.raw(&[0x9D])
    }

    pub fn stelem_i4(&mut self) -> &mut Self {
        self.raw(&[0x9E])
    }

    pub fn stelem_i8(&mut self) -> &mut Self {
        self.raw(&[0x9F])
    }

    pub fn stelem_r4(&mut self) -> &mut Self {
        self.raw(&[0xA0])
    }

    pub fn stelem_r8(&mut self) -> &mut Self {
        self.raw(&[0xA1])
    }

    pub fn box_(&mut self, ty: TypeId) -> &mut Self {
        self.op_token(0x8C, TokenValue::Type(ty))
    }

    pub fn unbox_any(&mut self, ty: TypeId) -> &mut Self {
        self.op_token(0xA5, TokenValue::Type(ty))
    }

    pub fn initobj(&mut self, ty: TypeId) -> &mut Self {
        self.ext_op_token(0x15, TokenValue::Type(ty))
    }

    pub fn add(&mut self) -> &mut Self {
        self.raw(&[0x58])
    }

    pub fn sub(&mut self) -> &mut Self {
        self.raw(&[0x59])
    }

    pub fn mul(&mut self) -> &mut Self {
        self.raw(&[0x5A])
    }

    pub fn div(&mut self) -> &mut Self {
        self.raw(&[0x5B])
    }

    pub fn rem(&mut self) -> &mut Self {
        self.raw(&[0x5D])
    }

    pub fn and(&mut self) -> &mut Self {
        self.raw(&[0x5F])
    }

    pub fn or(&mut self) -> &mut Self {
        self.raw(&[0x60])
    }

    pub fn shl(&mut self) -> &mut Self {
        self.raw(&[0x62])
    }

    pub fn neg(&mut self) -> &mut Self {
        self.raw(&[0x65])
    }

    pub fn ceq(&mut self) -> &mut Self {
        self.raw(&[0xFE, 0x01])
    }

    pub fn cgt(&mut self) -> &mut Self {
        self.raw(&[0xFE, 0x02])
    }

    pub fn cgt_un(&mut self) -> &mut Self {
        self.raw(&[0xFE, 0x03])
    }

    pub fn clt(&mut self) -> &mut Self {
        self.raw(&[0xFE, 0x04])
    }

    pub fn clt_un(&mut self) -> &mut Self {
        self.raw(&[0xFE, 0x05])
    }

    pub fn conv_i(&mut self) -> &mut Self {
        self.raw(&[0xD3])
    }

    pub fn conv_u(&mut self) -> &mut Self {
        self.raw(&[0xE0])
    }

    pub fn conv_i2(&mut self) -> &mut Self {
        self.raw(&[0x68])
    }

    pub fn conv_i4(&mut self) -> &mut Self {
        self.raw(&[0x69])
    }

    pub fn conv_i8(&mut self) -> &mut Self {
        self.raw(&[0x6A])
    }

    pub fn conv_u2(&mut self) -> &mut Self {
        self.raw(&[0xD1])
    }

    pub fn conv_u8(&mut self) -> &mut Self {
        self.raw(&[0x6E])
    }

    pub fn volatile(&mut self) -> &mut Self {
        self.raw(&[0xFE, 0x13])
    }

    pub fn br(&mut self, label: &Label) -> &mut Self {
        self.branch(0x38, label)
    }

    pub fn br_s(&mut self, label: &Label) -> &mut Self {
        self.branch_s(0x2B, label)
    }

    pub fn brfalse(&mut self, label: &Label) -> &mut Self {
        self.branch(0x39, label)
    }

    pub fn brtrue(&mut self, label: &Label) -> &mut Self {
        self.branch(0x3A, label)
    }

    pub fn beq(&mut self, label: &Label) -> &mut Self {
        self.branch(0x3B, label)
    }

    pub fn bge(&mut self, label: &Label) -> &mut Self {
        self.branch(0x3C, label)
    }

    pub fn bgt(&mut self, label: &Label) -> &mut Self {
        self.branch(0x3D, label)
    }

    pub fn ble(&mut self, label: &Label) -> &mut Self {
        self.branch(0x3E, label)
    }

    pub fn blt(&mut self, label: &Label) -> &mut Self {
        self.branch(0x3F, label)
    }

    pub fn bne_un(&mut self, label: &Label) -> &mut Self {
        self.branch(0x40, label)
    }

    pub fn blt_un(&mut self, label: &Label) -> &mut Self {
        self.branch(0x44, label)
    }

    pub fn leave(&mut self, label: &Label) -> &mut Self {
        self.branch(0xDD, label)
    }

    fn apply_patches(&mut self) {
        for patch in &self.patches {
            let target = self.labels[patch.label].expect("branch to an unmarked label");
            if patch.short {
                let delta = target as i64 - (patch.operand_at as i64 + 1);
                self.il[patch.operand_at] = i8::try_from(delta).expect("short branch overflow") as u8;
            } else {
                let delta = (target as i64 - (patch.operand_at as i64 + 4)) as i32;
                self.il[patch.operand_at..patch.operand_at + 4]
                    .copy_from_slice(&delta.to_le_bytes());
            }
        }
        self.patches.clear();
    }

    pub fn into_body(mut self, locals: Vec<TypeId>) -> MethodIl {
        self.apply_patches();
        MethodIl {
            il: self.il,
            max_stack: 16,
            locals,
            exception_regions: Vec::new(),
            tokens: self.tokens,
        }
    }

    pub fn into_body_with_regions(
        mut self,
        locals: Vec<TypeId>,
        exception_regions: Vec<ExceptionRegion>,
    ) -> MethodIl {
        self.apply_patches();
        MethodIl {
            il: self.il,
            max_stack: 16,
            locals,
            exception_regions,
            tokens: self.tokens,
        }
    }
}

/// Captures everything a snapshot emits, for byte-exact assertions.
#[derive(Default)]
pub struct RecordingBuilder {
    pub bytes: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub frozen: Vec<FrozenObject>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reloc {
    FieldHandle(FieldId),
    String(String),
    FrozenObject(FieldId),
    Type(String),
}

impl DataBuilder for RecordingBuilder {
    fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn emit_int32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_field_handle_reloc(&mut self, field: FieldId) {
        self.relocs.push(Reloc::FieldHandle(field));
    }

    fn emit_string_reloc(&mut self, contents: &str) {
        self.relocs.push(Reloc::String(contents.to_string()));
    }

    fn emit_frozen_object_reloc(&mut self, field: FieldId, object: FrozenObject) {
        self.relocs.push(Reloc::FrozenObject(field));
        self.frozen.push(object);
    }

    fn emit_type_reloc(&mut self, ty: TypeSymbol) {
        self.relocs.push(Reloc::Type(format!("{ty:?}")));
    }
}
