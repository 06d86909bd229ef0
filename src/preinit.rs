//! Orchestration: computing the initial state of a type's static fields by
//! interpreting its static constructor at compile time.
//!
//! One [`TypePreinit`] instance exists per scanned type, owns everything
//! the scan allocates, and is discarded afterwards. Nothing is shared
//! across scans, so unrelated types can be scanned in parallel by the
//! caller without any locking here.

use crate::{
    error::{FailureReason, ScanError},
    interp::new_uninitialized_location_value,
    types::{CompilationPolicy, FieldId, TypeId, TypeRegistry},
    value::{DataBuilder, SerializableValue, Slot, StringInstance, Value},
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Scan context for one type's static constructor.
pub struct TypePreinit<'a> {
    pub(crate) meta: &'a TypeRegistry,
    pub(crate) policy: &'a dyn CompilationPolicy,
    /// The type under evaluation; only its statics may be touched.
    pub(crate) ty: TypeId,
    /// Current value of every eligible static field, seeded to zero/null.
    pub(crate) field_values: BTreeMap<FieldId, Slot>,
    /// Per-scan string literal interning.
    interned_strings: HashMap<String, StringInstance>,
}

impl<'a> TypePreinit<'a> {
    fn new(meta: &'a TypeRegistry, policy: &'a dyn CompilationPolicy, ty: TypeId) -> Self {
        // Zero initialize all fields we model. Literals, thread statics
        // and RVA statics have their own initialization story and stay
        // outside the snapshot.
        let field_values = meta
            .fields_of(ty)
            .filter(|&f| {
                let field = meta.field(f);
                field.is_static && !field.is_literal && !field.is_thread_static && !field.has_rva()
            })
            .map(|f| {
                let field_type = meta.field(f).field_type;
                (f, new_uninitialized_location_value(meta, field_type))
            })
            .collect();

        Self {
            meta,
            policy,
            ty,
            field_values,
            interned_strings: HashMap::new(),
        }
    }

    /// Attempts to evaluate `ty`'s static constructor ahead of time.
    ///
    /// The caller guarantees the type has a static constructor and is
    /// neither an open generic definition nor a canonical form. A failed
    /// scan is not an error anywhere: the type simply keeps its runtime
    /// initialization.
    pub fn scan_type(
        meta: &'a TypeRegistry,
        policy: &'a dyn CompilationPolicy,
        ty: TypeId,
    ) -> PreinitializationInfo {
        let def = meta.ty(ty);
        debug_assert!(!def.is_generic_definition);
        debug_assert!(!def.is_canonical);
        debug_assert!(def.static_constructor.is_some());

        let Some(cctor) = def.static_constructor else {
            return PreinitializationInfo {
                ty,
                outcome: Err(ScanError::Fail(FailureReason::ExternMethod)),
            };
        };

        let mut preinit = Self::new(meta, policy, ty);
        let mut recursion_protect = Vec::new();
        let outcome = match preinit.interpret_method(cctor, &mut [], &mut recursion_protect) {
            Ok(_) => {
                debug!(ty = %def.name, "static constructor preinitialized");
                Ok(preinit.field_values)
            }
            Err(error) => {
                debug!(ty = %def.name, reason = %error, "preinitialization scan failed");
                Err(error)
            }
        };

        PreinitializationInfo { ty, outcome }
    }

    /// Interns a string literal for the duration of this scan: equal
    /// literals share one instance, so their reference comparison holds.
    pub(crate) fn intern_string(&mut self, contents: &str) -> StringInstance {
        if let Some(existing) = self.interned_strings.get(contents) {
            return existing.clone();
        }
        let instance = StringInstance::new(contents);
        self.interned_strings
            .insert(contents.to_string(), instance.clone());
        instance
    }
}

/// The outcome of one scan: a byte-exact snapshot of the static fields, or
/// the reason the constructor cannot be folded away. Immutable once built.
pub struct PreinitializationInfo {
    ty: TypeId,
    outcome: Result<BTreeMap<FieldId, Slot>, ScanError>,
}

impl PreinitializationInfo {
    pub fn type_id(&self) -> TypeId {
        self.ty
    }

    pub fn is_preinitialized(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The snapshot, iterable in a deterministic order. `None` slots are
    /// reference fields that ended the constructor as null.
    pub fn field_values(&self) -> Option<&BTreeMap<FieldId, Slot>> {
        self.outcome.as_ref().ok()
    }

    /// Why the scan failed, if it did. Diagnostic only; a failed scan is
    /// never surfaced as a compilation error.
    pub fn failure(&self) -> Option<&ScanError> {
        self.outcome.as_ref().err()
    }

    /// The final value of one eligible field; `None` when the field ended
    /// as a null reference.
    pub fn field_value(&self, field: FieldId) -> Option<&Value> {
        self.field_values()?.get(&field)?.as_ref()
    }

    /// Emits the final bytes/relocations of one field into the builder.
    /// Null reference fields emit a zeroed pointer slot.
    pub fn write_field_data(
        &self,
        field: FieldId,
        meta: &TypeRegistry,
        builder: &mut dyn DataBuilder,
    ) -> Result<(), crate::error::InvalidIl> {
        match self.field_value(field) {
            Some(value) => value.write_field_data(field, meta, builder),
            None => {
                builder.emit_bytes(&vec![0u8; meta.target().pointer_size]);
                Ok(())
            }
        }
    }
}
