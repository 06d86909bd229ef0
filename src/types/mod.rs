//! The metadata side of the scan: descriptors for types, fields, and
//! methods, collected in a [`TypeRegistry`].
//!
//! The registry plays the role of the type-system oracle and the
//! method-body provider. It is populated by the embedder (the surrounding
//! compiler's metadata layer, or a test fixture) before any scan starts
//! and is only ever read during interpretation, which is what makes
//! parallel scans of unrelated types safe without locking.

use crate::error::InvalidIl;

/// Handle to a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);

/// Handle to a registered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(u32);

/// Handle to a registered method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(u32);

/// Properties of the compilation target that affect interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDetails {
    pub pointer_size: usize,
}

impl TargetDetails {
    pub const X64: Self = Self { pointer_size: 8 };
    pub const X86: Self = Self { pointer_size: 4 };
}

/// The shape-level classification of a type, mirroring the categories the
/// stack coercion rules are keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Boolean,
    Char,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    IntPtr,
    UIntPtr,
    Single,
    Double,
    ValueType,
    Nullable,
    Class,
    Interface,
    Array,
    Pointer,
    FunctionPointer,
    ByRef,
}

impl TypeCategory {
    pub fn is_value_type(self) -> bool {
        !matches!(
            self,
            Self::Class | Self::Interface | Self::Array | Self::Pointer | Self::FunctionPointer | Self::ByRef
        )
    }

    /// Whether locations of this type hold a GC-tracked reference.
    pub fn is_gc_pointer(self) -> bool {
        matches!(self, Self::Class | Self::Interface | Self::Array)
    }

    /// Whether locations of this type are pointer-width and untracked.
    pub fn is_pointer_like(self) -> bool {
        matches!(
            self,
            Self::IntPtr | Self::UIntPtr | Self::Pointer | Self::FunctionPointer
        )
    }

    fn is_pointer_sized(self) -> bool {
        self.is_gc_pointer() || self.is_pointer_like() || self == Self::ByRef
    }
}

/// A registered type.
///
/// `element_size` is the width of a location of this type (for reference
/// and pointer categories the registry fixes it to the target pointer
/// size). `instance_byte_count` is only meaningful for classes and
/// includes the leading pointer-sized type-identity slot, which instance
/// field offsets account for.
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub category: TypeCategory,
    pub element_size: usize,
    pub instance_byte_count: usize,
    pub contains_gc_pointers: bool,
    pub has_finalizer: bool,
    pub is_before_field_init: bool,
    pub is_generic_definition: bool,
    pub is_canonical: bool,
    /// For enums: the primitive the storage actually is.
    pub underlying: Option<TypeId>,
    /// For array/pointer/byref types: what they point at.
    pub element: Option<TypeId>,
    pub static_constructor: Option<MethodId>,
    pub fields: Vec<FieldId>,
    pub byref_type: Option<TypeId>,
}

impl TypeDef {
    fn base(name: impl Into<String>, category: TypeCategory, element_size: usize) -> Self {
        Self {
            name: name.into(),
            category,
            element_size,
            instance_byte_count: 0,
            contains_gc_pointers: false,
            has_finalizer: false,
            is_before_field_init: false,
            is_generic_definition: false,
            is_canonical: false,
            underlying: None,
            element: None,
            static_constructor: None,
            fields: Vec::new(),
            byref_type: None,
        }
    }

    pub fn value_type(name: impl Into<String>, element_size: usize) -> Self {
        Self::base(name, TypeCategory::ValueType, element_size)
    }

    pub fn class(name: impl Into<String>, instance_byte_count: usize) -> Self {
        Self {
            instance_byte_count,
            ..Self::base(name, TypeCategory::Class, 0)
        }
    }

    pub fn enumeration(name: impl Into<String>, underlying: TypeId, element_size: usize) -> Self {
        Self {
            underlying: Some(underlying),
            ..Self::base(name, TypeCategory::ValueType, element_size)
        }
    }

    pub fn nullable(name: impl Into<String>, element_size: usize) -> Self {
        Self::base(name, TypeCategory::Nullable, element_size)
    }

    pub fn array(name: impl Into<String>, element: TypeId) -> Self {
        Self {
            element: Some(element),
            ..Self::base(name, TypeCategory::Array, 0)
        }
    }
}

/// A registered field.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub owner: TypeId,
    pub field_type: TypeId,
    /// Byte offset inside the owning instance (instance fields only).
    pub offset: usize,
    pub is_static: bool,
    pub is_literal: bool,
    pub is_thread_static: bool,
    /// Present for RVA-mapped fields; consumed by the array-initializer
    /// intrinsic.
    pub rva_data: Option<Vec<u8>>,
}

impl FieldDef {
    pub fn instance(owner: TypeId, name: impl Into<String>, field_type: TypeId, offset: usize) -> Self {
        Self {
            name: name.into(),
            owner,
            field_type,
            offset,
            is_static: false,
            is_literal: false,
            is_thread_static: false,
            rva_data: None,
        }
    }

    pub fn static_field(owner: TypeId, name: impl Into<String>, field_type: TypeId) -> Self {
        Self {
            is_static: true,
            ..Self::instance(owner, name, field_type, 0)
        }
    }

    pub fn has_rva(&self) -> bool {
        self.rva_data.is_some()
    }
}

/// Calls the interpreter special-cases instead of recursing into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    /// The array bulk-initializer helper: copies a static RVA field's data
    /// into a freshly allocated array.
    InitializeArray,
}

#[derive(Debug, Clone)]
pub struct MethodSignature {
    pub is_static: bool,
    pub params: Vec<TypeId>,
    /// `None` means void.
    pub return_type: Option<TypeId>,
}

impl MethodSignature {
    pub fn static_void() -> Self {
        Self {
            is_static: true,
            params: Vec::new(),
            return_type: None,
        }
    }

    pub fn static_fn(params: Vec<TypeId>, return_type: Option<TypeId>) -> Self {
        Self {
            is_static: true,
            params,
            return_type,
        }
    }

    pub fn instance_fn(params: Vec<TypeId>, return_type: Option<TypeId>) -> Self {
        Self {
            is_static: false,
            params,
            return_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionRegionKind {
    Catch,
    Filter,
    Fault,
    Finally,
}

#[derive(Debug, Clone)]
pub struct ExceptionRegion {
    pub kind: ExceptionRegionKind,
    pub try_offset: usize,
    pub try_length: usize,
    pub handler_offset: usize,
    pub handler_length: usize,
}

/// What a token operand resolves to.
#[derive(Debug, Clone)]
pub enum TokenValue {
    Field(FieldId),
    Method(MethodId),
    Type(TypeId),
    String(String),
}

/// A decodable method body as handed over by the body provider.
#[derive(Debug, Clone, Default)]
pub struct MethodIl {
    pub il: Vec<u8>,
    pub max_stack: usize,
    pub locals: Vec<TypeId>,
    pub exception_regions: Vec<ExceptionRegion>,
    /// Token operands in the IL index into this table.
    pub tokens: Vec<TokenValue>,
}

impl MethodIl {
    pub fn get_object(&self, token: u32) -> Result<&TokenValue, InvalidIl> {
        self.tokens.get(token as usize).ok_or(InvalidIl::BadToken)
    }
}

/// A registered method. `body: None` models an extern method.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub owner: TypeId,
    pub signature: MethodSignature,
    pub body: Option<MethodIl>,
    pub intrinsic: Option<Intrinsic>,
}

impl MethodDef {
    pub fn new(owner: TypeId, name: impl Into<String>, signature: MethodSignature, body: Option<MethodIl>) -> Self {
        Self {
            name: name.into(),
            owner,
            signature,
            body,
            intrinsic: None,
        }
    }
}

/// Handles to the pre-registered primitive types.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownTypes {
    pub boolean: TypeId,
    pub char: TypeId,
    pub sbyte: TypeId,
    pub byte: TypeId,
    pub int16: TypeId,
    pub uint16: TypeId,
    pub int32: TypeId,
    pub uint32: TypeId,
    pub int64: TypeId,
    pub uint64: TypeId,
    pub intptr: TypeId,
    pub uintptr: TypeId,
    pub single: TypeId,
    pub double: TypeId,
    pub object: TypeId,
    pub string: TypeId,
}

/// The descriptor tables the interpreter runs against.
pub struct TypeRegistry {
    target: TargetDetails,
    types: Vec<TypeDef>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    well_known: WellKnownTypes,
}

impl TypeRegistry {
    pub fn new(target: TargetDetails) -> Self {
        let mut registry = Self {
            target,
            types: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            // Placeholder, replaced below once the primitives exist.
            well_known: WellKnownTypes {
                boolean: TypeId(0),
                char: TypeId(0),
                sbyte: TypeId(0),
                byte: TypeId(0),
                int16: TypeId(0),
                uint16: TypeId(0),
                int32: TypeId(0),
                uint32: TypeId(0),
                int64: TypeId(0),
                uint64: TypeId(0),
                intptr: TypeId(0),
                uintptr: TypeId(0),
                single: TypeId(0),
                double: TypeId(0),
                object: TypeId(0),
                string: TypeId(0),
            },
        };

        use TypeCategory::*;
        let mut primitive = |name: &str, category: TypeCategory, size: usize| {
            registry.add_type(TypeDef::base(name, category, size))
        };
        let well_known = WellKnownTypes {
            boolean: primitive("System.Boolean", Boolean, 1),
            char: primitive("System.Char", Char, 2),
            sbyte: primitive("System.SByte", SByte, 1),
            byte: primitive("System.Byte", Byte, 1),
            int16: primitive("System.Int16", Int16, 2),
            uint16: primitive("System.UInt16", UInt16, 2),
            int32: primitive("System.Int32", Int32, 4),
            uint32: primitive("System.UInt32", UInt32, 4),
            int64: primitive("System.Int64", Int64, 8),
            uint64: primitive("System.UInt64", UInt64, 8),
            intptr: primitive("System.IntPtr", IntPtr, 0),
            uintptr: primitive("System.UIntPtr", UIntPtr, 0),
            single: primitive("System.Single", Single, 4),
            double: primitive("System.Double", Double, 8),
            object: primitive("System.Object", Class, 0),
            string: primitive("System.String", Class, 0),
        };
        registry.well_known = well_known;
        registry
    }

    pub fn target(&self) -> TargetDetails {
        self.target
    }

    pub fn well_known(&self) -> &WellKnownTypes {
        &self.well_known
    }

    /// Registers a type. Pointer-sized categories get their location width
    /// fixed up to the target pointer size.
    pub fn add_type(&mut self, mut def: TypeDef) -> TypeId {
        if def.element_size == 0 && def.category.is_pointer_sized() {
            def.element_size = self.target.pointer_size;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(def);
        id
    }

    pub fn add_field(&mut self, def: FieldDef) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        let owner = def.owner;
        self.fields.push(def);
        self.types[owner.0 as usize].fields.push(id);
        id
    }

    /// Registers a method. Instance methods on value types get the owner's
    /// byref type interned up front, so `arg_type` never has to mutate.
    pub fn add_method(&mut self, def: MethodDef) -> MethodId {
        let owner = def.owner;
        let needs_byref = !def.signature.is_static && self.ty(owner).category.is_value_type();
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(def);
        if needs_byref {
            self.byref_of(owner);
        }
        id
    }

    pub fn set_static_constructor(&mut self, ty: TypeId, cctor: MethodId) {
        self.types[ty.0 as usize].static_constructor = Some(cctor);
    }

    /// Interns the managed-reference type for `ty`.
    pub fn byref_of(&mut self, ty: TypeId) -> TypeId {
        if let Some(existing) = self.ty(ty).byref_type {
            return existing;
        }
        let name = format!("{}&", self.ty(ty).name);
        let byref = self.add_type(TypeDef {
            element: Some(ty),
            ..TypeDef::base(name, TypeCategory::ByRef, 0)
        });
        self.types[ty.0 as usize].byref_type = Some(byref);
        byref
    }

    pub fn ty(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn method(&self, id: MethodId) -> &MethodDef {
        &self.methods[id.0 as usize]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut MethodDef {
        &mut self.methods[id.0 as usize]
    }

    pub fn element_size(&self, id: TypeId) -> usize {
        self.ty(id).element_size
    }

    /// The category after stripping an enum down to its primitive storage.
    pub fn underlying_category(&self, id: TypeId) -> TypeCategory {
        match self.ty(id).underlying {
            Some(underlying) => self.ty(underlying).category,
            None => self.ty(id).category,
        }
    }

    /// The type after stripping an enum down to its primitive storage.
    pub fn underlying_type(&self, id: TypeId) -> TypeId {
        self.ty(id).underlying.unwrap_or(id)
    }

    pub fn fields_of(&self, ty: TypeId) -> impl Iterator<Item = FieldId> + '_ {
        self.ty(ty).fields.iter().copied()
    }

    /// The declared type of argument `index` of `method`, with the implicit
    /// `this` of an instance method occupying index 0 (as a byref for value
    /// type owners).
    pub fn arg_type(&self, method: MethodId, index: usize) -> Result<TypeId, InvalidIl> {
        let def = self.method(method);
        let mut offset = 0;
        if !def.signature.is_static {
            if index == 0 {
                let owner = def.owner;
                return if self.ty(owner).category.is_value_type() {
                    self.ty(owner).byref_type.ok_or(InvalidIl::IndexOutOfRange)
                } else {
                    Ok(owner)
                };
            }
            offset = 1;
        }
        def.signature
            .params
            .get(index - offset)
            .copied()
            .ok_or(InvalidIl::IndexOutOfRange)
    }

    /// Argument count including the implicit `this`.
    pub fn arg_count(&self, method: MethodId) -> usize {
        let sig = &self.method(method).signature;
        sig.params.len() + usize::from(!sig.is_static)
    }
}

/// External policy on what this compilation unit may pull in and evaluate.
pub trait CompilationPolicy {
    /// Whether `callee`'s body may be folded into `caller` at compile time.
    fn can_inline(&self, caller: MethodId, callee: MethodId) -> bool;

    /// Whether instances of `ty` may be materialized in this compilation
    /// unit's output.
    fn contains_type(&self, ty: TypeId) -> bool;
}

/// Policy for single-module compilation: everything is local, everything
/// may be inlined.
pub struct SingleModulePolicy;

impl CompilationPolicy for SingleModulePolicy {
    fn can_inline(&self, _caller: MethodId, _callee: MethodId) -> bool {
        true
    }

    fn contains_type(&self, _ty: TypeId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_pre_registered() {
        let registry = TypeRegistry::new(TargetDetails::X64);
        let wk = *registry.well_known();
        assert_eq!(registry.element_size(wk.int32), 4);
        assert_eq!(registry.element_size(wk.double), 8);
        assert_eq!(registry.element_size(wk.intptr), 8);
        assert_eq!(registry.ty(wk.string).category, TypeCategory::Class);
        assert_eq!(registry.element_size(wk.string), 8);

        let registry = TypeRegistry::new(TargetDetails::X86);
        assert_eq!(registry.element_size(registry.well_known().intptr), 4);
    }

    #[test]
    fn enums_report_their_underlying_category() {
        let mut registry = TypeRegistry::new(TargetDetails::X64);
        let int32 = registry.well_known().int32;
        let color = registry.add_type(TypeDef::enumeration("Color", int32, 4));
        assert_eq!(registry.underlying_category(color), TypeCategory::Int32);
        assert_eq!(registry.underlying_type(color), int32);
    }

    #[test]
    fn instance_methods_on_value_types_take_a_byref_this() {
        let mut registry = TypeRegistry::new(TargetDetails::X64);
        let int32 = registry.well_known().int32;
        let point = registry.add_type(TypeDef::value_type("Point", 8));
        let ctor = registry.add_method(MethodDef::new(
            point,
            ".ctor",
            MethodSignature::instance_fn(vec![int32, int32], None),
            Some(MethodIl::default()),
        ));

        let this_ty = registry.arg_type(ctor, 0).unwrap();
        assert_eq!(registry.ty(this_ty).category, TypeCategory::ByRef);
        assert_eq!(registry.ty(this_ty).element, Some(point));
        assert_eq!(registry.arg_type(ctor, 1).unwrap(), int32);
        assert_eq!(registry.arg_count(ctor), 3);
        assert!(registry.arg_type(ctor, 3).is_err());
    }
}
