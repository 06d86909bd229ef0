//! The fetch/decode/execute loop.
//!
//! This is not a full interpreter and it is allowed to not understand
//! things. A construct the partial evaluator deliberately keeps its hands
//! off produces a `FailureReason` that unwinds the whole scan; basic
//! sanity violations in the IL itself surface as `InvalidIl`. The two
//! classes are never conflated, and nothing is ever silently skipped: an
//! opcode the loop does not recognize fails the scan by name.
//!
//! Termination needs no step budget: backwards branches are rejected, so a
//! single body is a DAG, and the recursion guard breaks call-graph cycles.

use crate::{
    error::{FailureReason, InvalidIl, ScanError, ScanResult},
    il::{IlOpcode, IlReader},
    preinit::TypePreinit,
    types::{
        ExceptionRegionKind, Intrinsic, MethodId, TokenValue, TypeCategory, TypeId, TypeRegistry,
    },
    value::{
        ArrayInstance, ObjectInstance, RuntimeFieldHandleValue, Slot, Value, ValueTypeValue,
    },
};

use super::stack::{EvalStack, StackEntry, StackValueKind};
use tracing::trace;

/// Hard ceiling on `newarr` lengths, bounding interpreter memory.
const MAXIMUM_INTERPRETED_ARRAY_LENGTH: i32 = 8192;

macro_rules! fail {
    ($reason:expr) => {
        return Err(ScanError::Fail($reason))
    };
}

/// The zero/uninitialized content of a location of the given type: null
/// for references and byrefs, zeroed bytes for everything else.
pub(crate) fn new_uninitialized_location_value(meta: &TypeRegistry, location_type: TypeId) -> Slot {
    let category = meta.ty(location_type).category;
    if category.is_gc_pointer() || category == TypeCategory::ByRef {
        None
    } else {
        debug_assert!(category.is_value_type() || category.is_pointer_like());
        Some(Value::ValueType(ValueTypeValue::zeroed(
            meta.element_size(location_type),
        )))
    }
}

fn entry_value(entry: &StackEntry) -> Result<&Value, InvalidIl> {
    entry.value.as_ref().ok_or(InvalidIl::IncompatibleValue)
}

/// Stores a popped value into a location slot. Byte-buffer locations are
/// assigned in place so byrefs into them keep observing the location.
fn assign_location(slot: &mut Slot, value: Slot) -> Result<(), InvalidIl> {
    if let Some(Value::ValueType(existing)) = slot {
        match &value {
            Some(Value::ValueType(incoming)) => existing.assign(incoming),
            _ => Err(InvalidIl::IncompatibleValue),
        }
    } else {
        *slot = value;
        Ok(())
    }
}

enum BranchKind {
    Always,
    IfTrue,
    IfFalse,
    Leave,
    Compare(CmpOp),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    NeUn,
    GeUn,
    GtUn,
    LeUn,
    LtUn,
}

fn branch_kind(opcode: IlOpcode) -> BranchKind {
    use IlOpcode::*;
    match opcode {
        Br | BrS => BranchKind::Always,
        Brtrue | BrtrueS => BranchKind::IfTrue,
        Brfalse | BrfalseS => BranchKind::IfFalse,
        Leave | LeaveS => BranchKind::Leave,
        Beq | BeqS => BranchKind::Compare(CmpOp::Eq),
        Bge | BgeS => BranchKind::Compare(CmpOp::Ge),
        Bgt | BgtS => BranchKind::Compare(CmpOp::Gt),
        Ble | BleS => BranchKind::Compare(CmpOp::Le),
        Blt | BltS => BranchKind::Compare(CmpOp::Lt),
        BneUn | BneUnS => BranchKind::Compare(CmpOp::NeUn),
        BgeUn | BgeUnS => BranchKind::Compare(CmpOp::GeUn),
        BgtUn | BgtUnS => BranchKind::Compare(CmpOp::GtUn),
        BleUn | BleUnS => BranchKind::Compare(CmpOp::LeUn),
        BltUn | BltUnS => BranchKind::Compare(CmpOp::LtUn),
        other => unreachable!("not a branch opcode: {other}"),
    }
}

fn int_compare(cmp: CmpOp, a: i64, b: i64, ua: u64, ub: u64) -> bool {
    match cmp {
        CmpOp::Eq => a == b,
        CmpOp::Ge => a >= b,
        CmpOp::Gt => a > b,
        CmpOp::Le => a <= b,
        CmpOp::Lt => a < b,
        CmpOp::NeUn => ua != ub,
        CmpOp::GeUn => ua >= ub,
        CmpOp::GtUn => ua > ub,
        CmpOp::LeUn => ua <= ub,
        CmpOp::LtUn => ua < ub,
    }
}

/// IEEE comparisons: the ordered forms are false on NaN, the unordered
/// (`.un`) forms are true on NaN.
fn float_compare(cmp: CmpOp, a: f64, b: f64) -> bool {
    match cmp {
        CmpOp::Eq => a == b,
        CmpOp::Ge => a >= b,
        CmpOp::Gt => a > b,
        CmpOp::Le => a <= b,
        CmpOp::Lt => a < b,
        CmpOp::NeUn => !(a == b),
        CmpOp::GeUn => !(a < b),
        CmpOp::GtUn => !(a <= b),
        CmpOp::LeUn => !(a > b),
        CmpOp::LtUn => !(a >= b),
    }
}

impl<'a> TypePreinit<'a> {
    /// Interprets one method invocation against the scan's field state.
    /// Returns the method's return value on a successful `ret`.
    pub(crate) fn interpret_method(
        &mut self,
        method: MethodId,
        args: &mut [Slot],
        recursion_protect: &mut Vec<MethodId>,
    ) -> ScanResult<Slot> {
        use IlOpcode::*;

        let meta = self.meta;
        let mdef = meta.method(method);

        let Some(body) = &mdef.body else {
            fail!(FailureReason::ExternMethod);
        };

        if recursion_protect.contains(&method) {
            fail!(FailureReason::Recursion);
        }

        // No finally modeling at all: the one region kind that would run
        // code we do not interpret rejects the method up front. Catch,
        // filter and fault regions are tolerated because nothing here ever
        // raises a simulated exception that could enter them.
        if body
            .exception_regions
            .iter()
            .any(|r| r.kind == ExceptionRegionKind::Finally)
        {
            fail!(FailureReason::FinallyRegion);
        }

        trace!(method = %mdef.name, depth = recursion_protect.len(), "interpreting method body");

        let target = meta.target();
        let mut reader = IlReader::new(&body.il);
        let mut stack = EvalStack::new(body.max_stack, target);
        let mut locals: Vec<Slot> = body
            .locals
            .iter()
            .map(|&ty| new_uninitialized_location_value(meta, ty))
            .collect();

        while reader.has_next() {
            let opcode = reader.read_opcode()?;
            match opcode {
                LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46
                | LdcI47 | LdcI48 | LdcI4S | LdcI4 => {
                    let value = match opcode {
                        LdcI4M1 => -1,
                        LdcI40 => 0,
                        LdcI41 => 1,
                        LdcI42 => 2,
                        LdcI43 => 3,
                        LdcI44 => 4,
                        LdcI45 => 5,
                        LdcI46 => 6,
                        LdcI47 => 7,
                        LdcI48 => 8,
                        LdcI4S => reader.read_u8()? as i8 as i32,
                        _ => reader.read_u32()? as i32,
                    };
                    stack.push(StackValueKind::Int32, ValueTypeValue::from_i32(value).into());
                }

                LdcI8 => {
                    let value = reader.read_u64()? as i64;
                    stack.push(StackValueKind::Int64, ValueTypeValue::from_i64(value).into());
                }

                LdcR4 => {
                    let value = reader.read_f32()? as f64;
                    stack.push(StackValueKind::Float, ValueTypeValue::from_f64(value).into());
                }

                LdcR8 => {
                    let value = reader.read_f64()?;
                    stack.push(StackValueKind::Float, ValueTypeValue::from_f64(value).into());
                }

                Ldnull => stack.push_objref(None),

                Ldstr => {
                    let token = reader.read_token()?;
                    let TokenValue::String(literal) = body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let instance = self.intern_string(literal);
                    stack.push_objref(Some(Value::String(instance)));
                }

                Dup => {
                    let entry = stack.peek()?.clone();
                    stack.push_entry(entry);
                }

                Pop => {
                    stack.pop()?;
                }

                Nop | Volatile => {}

                Ret => {
                    let returns_void = mdef.signature.return_type.is_none();
                    if (returns_void && !stack.is_empty()) || (!returns_void && stack.len() != 1) {
                        return Err(InvalidIl::ReturnArity.into());
                    }
                    let result = match mdef.signature.return_type {
                        Some(return_type) => stack.pop_into_location(meta, return_type)?,
                        None => None,
                    };
                    return Ok(result);
                }

                Ldloc0 | Ldloc1 | Ldloc2 | Ldloc3 | LdlocS | Ldloc => {
                    let index = match opcode {
                        Ldloc0 => 0,
                        Ldloc1 => 1,
                        Ldloc2 => 2,
                        Ldloc3 => 3,
                        LdlocS => reader.read_u8()? as usize,
                        _ => reader.read_u16()? as usize,
                    };
                    let local_type =
                        *body.locals.get(index).ok_or(InvalidIl::IndexOutOfRange)?;
                    stack.push_from_location(meta, local_type, &locals[index])?;
                }

                Stloc0 | Stloc1 | Stloc2 | Stloc3 | StlocS | Stloc => {
                    let index = match opcode {
                        Stloc0 => 0,
                        Stloc1 => 1,
                        Stloc2 => 2,
                        Stloc3 => 3,
                        StlocS => reader.read_u8()? as usize,
                        _ => reader.read_u16()? as usize,
                    };
                    let local_type =
                        *body.locals.get(index).ok_or(InvalidIl::IndexOutOfRange)?;
                    let value = stack.pop_into_location(meta, local_type)?;
                    assign_location(&mut locals[index], value)?;
                }

                LdlocaS | Ldloca => {
                    let index = match opcode {
                        LdlocaS => reader.read_u8()? as usize,
                        _ => reader.read_u16()? as usize,
                    };
                    match locals.get(index).ok_or(InvalidIl::IndexOutOfRange)? {
                        Some(Value::ValueType(local)) => stack.push_byref(local.create_byref()),
                        _ => fail!(FailureReason::UnsupportedByRef(opcode)),
                    }
                }

                Ldarg0 | Ldarg1 | Ldarg2 | Ldarg3 | LdargS | Ldarg => {
                    let index = match opcode {
                        Ldarg0 => 0,
                        Ldarg1 => 1,
                        Ldarg2 => 2,
                        Ldarg3 => 3,
                        LdargS => reader.read_u8()? as usize,
                        _ => reader.read_u16()? as usize,
                    };
                    let arg_type = meta.arg_type(method, index)?;
                    let arg = args.get(index).ok_or(InvalidIl::IndexOutOfRange)?;
                    stack.push_from_location(meta, arg_type, arg)?;
                }

                StargS | Starg => {
                    let index = match opcode {
                        StargS => reader.read_u8()? as usize,
                        _ => reader.read_u16()? as usize,
                    };
                    let arg_type = meta.arg_type(method, index)?;
                    let value = stack.pop_into_location(meta, arg_type)?;
                    let slot = args.get_mut(index).ok_or(InvalidIl::IndexOutOfRange)?;
                    assign_location(slot, value)?;
                }

                Ldtoken => {
                    let token = reader.read_token()?;
                    match body.get_object(token)? {
                        TokenValue::Field(field) => stack.push(
                            StackValueKind::ValueType,
                            Value::FieldHandle(RuntimeFieldHandleValue::new(*field)),
                        ),
                        _ => fail!(FailureReason::UnsupportedToken(opcode)),
                    }
                }

                Stsfld => {
                    let token = reader.read_token()?;
                    let TokenValue::Field(field) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let fdef = meta.field(field);
                    if !fdef.is_static || fdef.is_literal {
                        return Err(InvalidIl::BadToken.into());
                    }
                    if fdef.owner != self.ty {
                        fail!(FailureReason::CrossTypeStatic(opcode));
                    }
                    if fdef.is_thread_static || fdef.has_rva() {
                        fail!(FailureReason::UnsupportedStatic(opcode));
                    }
                    let value = stack.pop_into_location(meta, fdef.field_type)?;
                    let slot = self
                        .field_values
                        .get_mut(&field)
                        .ok_or(InvalidIl::BadToken)?;
                    assign_location(slot, value)?;
                }

                Ldsfld => {
                    let token = reader.read_token()?;
                    let TokenValue::Field(field) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let fdef = meta.field(field);
                    if !fdef.is_static || fdef.is_literal {
                        return Err(InvalidIl::BadToken.into());
                    }
                    if fdef.owner != self.ty {
                        fail!(FailureReason::CrossTypeStatic(opcode));
                    }
                    if fdef.is_thread_static || fdef.has_rva() {
                        fail!(FailureReason::UnsupportedStatic(opcode));
                    }
                    let slot = self.field_values.get(&field).ok_or(InvalidIl::BadToken)?;
                    stack.push_from_location(meta, fdef.field_type, slot)?;
                }

                Ldsflda => {
                    let token = reader.read_token()?;
                    let TokenValue::Field(field) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let fdef = meta.field(field);
                    if !fdef.is_static || fdef.is_literal {
                        return Err(InvalidIl::BadToken.into());
                    }
                    if fdef.owner != self.ty {
                        fail!(FailureReason::CrossTypeStatic(opcode));
                    }
                    if fdef.is_thread_static || fdef.has_rva() {
                        fail!(FailureReason::UnsupportedStatic(opcode));
                    }
                    match self.field_values.get(&field).ok_or(InvalidIl::BadToken)? {
                        Some(Value::ValueType(value)) => stack.push_byref(value.create_byref()),
                        _ => fail!(FailureReason::UnsupportedByRef(opcode)),
                    }
                }

                Stfld => {
                    let token = reader.read_token()?;
                    let TokenValue::Field(field) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let fdef = meta.field(field);
                    if fdef.is_static {
                        fail!(FailureReason::Unsupported(opcode));
                    }
                    if meta.ty(fdef.field_type).category.is_gc_pointer() {
                        fail!(FailureReason::GcPointer(opcode));
                    }
                    let value = stack.pop_into_location(meta, fdef.field_type)?;
                    let instance = stack.pop()?;
                    let Some(accessor) =
                        instance.value.as_ref().and_then(|v| v.field_accessor())
                    else {
                        fail!(FailureReason::NoInstanceFields(opcode));
                    };
                    let Some(Value::ValueType(incoming)) = &value else {
                        return Err(InvalidIl::IncompatibleValue.into());
                    };
                    accessor.set_field(meta, field, incoming)?;
                }

                Ldfld => {
                    let token = reader.read_token()?;
                    let TokenValue::Field(field) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let fdef = meta.field(field);
                    if fdef.is_static {
                        fail!(FailureReason::Unsupported(opcode));
                    }
                    if meta.ty(fdef.field_type).category.is_gc_pointer() {
                        fail!(FailureReason::GcPointer(opcode));
                    }
                    let instance = stack.pop()?;
                    let Some(accessor) =
                        instance.value.as_ref().and_then(|v| v.field_accessor())
                    else {
                        fail!(FailureReason::NoInstanceFields(opcode));
                    };
                    let value = accessor.get_field(meta, field)?;
                    stack.push_from_location(
                        meta,
                        fdef.field_type,
                        &Some(Value::ValueType(value)),
                    )?;
                }

                Ldflda => {
                    let token = reader.read_token()?;
                    let TokenValue::Field(field) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let fdef = meta.field(field);
                    if fdef.is_static {
                        fail!(FailureReason::Unsupported(opcode));
                    }
                    if meta.ty(fdef.field_type).category.is_gc_pointer() {
                        fail!(FailureReason::GcPointer(opcode));
                    }
                    let instance = stack.pop()?;
                    let Some(accessor) =
                        instance.value.as_ref().and_then(|v| v.field_accessor())
                    else {
                        fail!(FailureReason::NoInstanceFields(opcode));
                    };
                    stack.push_byref(accessor.field_address(meta, field)?);
                }

                Initobj => {
                    let token = reader.read_token()?;
                    let popped = stack.pop()?;
                    if popped.kind != StackValueKind::ByRef {
                        return Err(InvalidIl::KindMismatch.into());
                    }
                    let TokenValue::Type(ty) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    if meta.ty(ty).category.is_gc_pointer() {
                        fail!(FailureReason::GcPointer(opcode));
                    }
                    let Some(Value::ByRef(byref)) = &popped.value else {
                        return Err(InvalidIl::IncompatibleValue.into());
                    };
                    byref.initialize(meta.element_size(ty))?;
                }

                Call => {
                    let token = reader.read_token()?;
                    let TokenValue::Method(callee) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let cdef = meta.method(callee);
                    let owner = cdef.owner;

                    if !self.policy.can_inline(method, callee) {
                        fail!(FailureReason::UninlinableCall(opcode));
                    }
                    // Calling into a type whose own static constructor has
                    // not provably run would let this code observe statics
                    // we know nothing about.
                    if meta.ty(owner).static_constructor.is_some()
                        && owner != mdef.owner
                        && !meta.ty(owner).is_before_field_init
                    {
                        fail!(FailureReason::CctorInterference(opcode));
                    }

                    let arg_count = meta.arg_count(callee);
                    let mut call_args: Vec<Slot> = vec![None; arg_count];
                    for i in (0..arg_count).rev() {
                        call_args[i] = stack.pop_into_location(meta, meta.arg_type(callee, i)?)?;
                    }

                    let mut return_value: Slot = None;
                    let mut handled = false;
                    if cdef.intrinsic.is_some() {
                        handled = self.try_intrinsic_call(callee, &call_args)?;
                    }
                    if !handled {
                        recursion_protect.push(method);
                        let result =
                            self.interpret_method(callee, &mut call_args, recursion_protect);
                        recursion_protect.pop();
                        return_value = result?;
                    }

                    if let Some(return_type) = meta.method(callee).signature.return_type {
                        stack.push_from_location(meta, return_type, &return_value)?;
                    }
                }

                Newobj => {
                    let token = reader.read_token()?;
                    let TokenValue::Method(ctor) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let cdef = meta.method(ctor);
                    let owner = cdef.owner;
                    let owner_def = meta.ty(owner);

                    if !self.policy.can_inline(method, ctor) {
                        fail!(FailureReason::UninlinableCall(opcode));
                    }
                    // Nothing frozen at compile time may need a write
                    // barrier or a finalizer run.
                    if !self.policy.contains_type(owner)
                        || !(owner_def.category.is_value_type()
                            || owner_def.category == TypeCategory::Class)
                        || owner_def.has_finalizer
                        || owner_def.contains_gc_pointers
                    {
                        fail!(FailureReason::UnsupportedAllocation(opcode));
                    }
                    if owner_def.static_constructor.is_some()
                        && owner != mdef.owner
                        && !owner_def.is_before_field_init
                    {
                        fail!(FailureReason::CctorInterference(opcode));
                    }

                    let (instance, this_arg) = if owner_def.category.is_value_type() {
                        let value = ValueTypeValue::zeroed(meta.element_size(owner));
                        let this_arg = Value::ByRef(value.create_byref());
                        (Value::ValueType(value), this_arg)
                    } else {
                        let object = ObjectInstance::new(meta, owner);
                        (Value::Object(object.clone()), Value::Object(object))
                    };

                    let param_count = cdef.signature.params.len();
                    let mut ctor_args: Vec<Slot> = vec![None; param_count + 1];
                    ctor_args[0] = Some(this_arg);
                    for i in (1..=param_count).rev() {
                        ctor_args[i] = stack.pop_into_location(meta, meta.arg_type(ctor, i)?)?;
                    }

                    recursion_protect.push(method);
                    let result = self.interpret_method(ctor, &mut ctor_args, recursion_protect);
                    recursion_protect.pop();
                    result?;

                    stack.push_from_location(meta, owner, &Some(instance))?;
                }

                Newarr => {
                    let length = stack
                        .try_pop_int_value()?
                        .ok_or(InvalidIl::KindMismatch)?;
                    let token = reader.read_token()?;
                    let TokenValue::Type(element_type) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let element_def = meta.ty(element_type);
                    // Zero-length arrays never hold a GC pointer, so they
                    // pass even for reference element types.
                    if length > 0
                        && (element_def.category.is_gc_pointer()
                            || (element_def.category.is_value_type()
                                && element_def.contains_gc_pointers))
                    {
                        fail!(FailureReason::GcPointer(opcode));
                    }
                    if length < 0 || length > MAXIMUM_INTERPRETED_ARRAY_LENGTH {
                        fail!(FailureReason::ArrayBounds(opcode));
                    }
                    stack.push_objref(Some(Value::Array(ArrayInstance::new(
                        meta,
                        element_type,
                        length as usize,
                    ))));
                }

                Ldlen => {
                    let popped = stack.pop()?;
                    match &popped.value {
                        Some(Value::Array(array)) => stack.push(
                            StackValueKind::NativeInt,
                            ValueTypeValue::from_native_int(array.len() as i64, target).into(),
                        ),
                        None => fail!(FailureReason::NullArray(opcode)),
                        Some(_) => return Err(InvalidIl::IncompatibleValue.into()),
                    }
                }

                Stelem | StelemI | StelemI1 | StelemI2 | StelemI4 | StelemI8 | StelemR4
                | StelemR8 => {
                    let wk = meta.well_known();
                    let element_type = match opcode {
                        StelemI => wk.intptr,
                        StelemI1 => wk.sbyte,
                        StelemI2 => wk.int16,
                        StelemI4 => wk.int32,
                        StelemI8 => wk.int64,
                        StelemR4 => wk.single,
                        StelemR8 => wk.double,
                        _ => {
                            let token = reader.read_token()?;
                            let TokenValue::Type(ty) = *body.get_object(token)? else {
                                return Err(InvalidIl::BadToken.into());
                            };
                            ty
                        }
                    };
                    if meta.ty(element_type).category.is_gc_pointer() {
                        fail!(FailureReason::GcPointer(opcode));
                    }
                    let value = stack.pop_into_location(meta, element_type)?;
                    let index = stack
                        .try_pop_int_value()?
                        .ok_or(InvalidIl::KindMismatch)?;
                    let array = stack.pop()?;
                    match &array.value {
                        Some(Value::Array(array)) => {
                            let Some(Value::ValueType(element)) = &value else {
                                return Err(InvalidIl::IncompatibleValue.into());
                            };
                            if !array.try_store_element(index, element)? {
                                fail!(FailureReason::ArrayBounds(opcode));
                            }
                        }
                        None => fail!(FailureReason::NullArray(opcode)),
                        Some(_) => return Err(InvalidIl::IncompatibleValue.into()),
                    }
                }

                Box => {
                    let token = reader.read_token()?;
                    let TokenValue::Type(ty) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let category = meta.ty(ty).category;
                    if category == TypeCategory::Nullable {
                        fail!(FailureReason::NullableBox(opcode));
                    }
                    if !category.is_value_type() {
                        fail!(FailureReason::Unsupported(opcode));
                    }
                    let value = stack.pop_into_location(meta, ty)?;
                    let Some(Value::ValueType(source)) = &value else {
                        fail!(FailureReason::Unsupported(opcode));
                    };
                    stack.push_objref(Some(Value::Object(ObjectInstance::box_value(
                        meta, ty, source,
                    ))));
                }

                UnboxAny => {
                    let token = reader.read_token()?;
                    let TokenValue::Type(ty) = *body.get_object(token)? else {
                        return Err(InvalidIl::BadToken.into());
                    };
                    let category = meta.ty(ty).category;
                    if category == TypeCategory::Nullable {
                        fail!(FailureReason::NullableBox(opcode));
                    }
                    if !category.is_value_type() {
                        fail!(FailureReason::Unsupported(opcode));
                    }
                    let popped = stack.pop()?;
                    match &popped.value {
                        Some(Value::Object(object)) => {
                            let Some(unboxed) = object.try_unbox_any(meta, ty) else {
                                return Err(InvalidIl::IncompatibleValue.into());
                            };
                            stack.push_from_location(
                                meta,
                                ty,
                                &Some(Value::ValueType(unboxed)),
                            )?;
                        }
                        None => fail!(FailureReason::NullReference(opcode)),
                        Some(_) => fail!(FailureReason::Unsupported(opcode)),
                    }
                }

                Br | BrS | Brfalse | BrfalseS | Brtrue | BrtrueS | Beq | BeqS | Bge | BgeS
                | Bgt | BgtS | Ble | BleS | Blt | BltS | BneUn | BneUnS | BgeUn | BgeUnS
                | BgtUn | BgtUnS | BleUn | BleUnS | BltUn | BltUnS | Leave | LeaveS => {
                    let short = matches!(
                        opcode,
                        BrS | BrfalseS
                            | BrtrueS
                            | BeqS
                            | BgeS
                            | BgtS
                            | BleS
                            | BltS
                            | BneUnS
                            | BgeUnS
                            | BgtUnS
                            | BleUnS
                            | BltUnS
                            | LeaveS
                    );
                    let delta = if short {
                        reader.read_u8()? as i8 as i64
                    } else {
                        reader.read_u32()? as i32 as i64
                    };
                    let branch_target = reader.offset() as i64 + delta;
                    if branch_target < 0 || branch_target > reader.size() as i64 {
                        return Err(InvalidIl::BranchOutOfRange.into());
                    }
                    let branch_target = branch_target as usize;

                    let taken = match branch_kind(opcode) {
                        BranchKind::Always => true,
                        BranchKind::Leave => {
                            // No finally regions exist in this method (see
                            // the pre-pass), so leaving a protected region
                            // only empties the evaluation stack.
                            stack.clear();
                            true
                        }
                        kind @ (BranchKind::IfTrue | BranchKind::IfFalse) => {
                            let condition = stack.pop()?;
                            let truthy = match condition.kind {
                                StackValueKind::Int32 => {
                                    entry_value(&condition)?.as_i32()? != 0
                                }
                                StackValueKind::ObjRef => condition.value.is_some(),
                                _ => fail!(FailureReason::OperandKinds(opcode)),
                            };
                            if matches!(kind, BranchKind::IfTrue) {
                                truthy
                            } else {
                                !truthy
                            }
                        }
                        BranchKind::Compare(cmp) => {
                            let b = stack.pop()?;
                            let a = stack.pop()?;
                            match (a.kind, b.kind) {
                                (StackValueKind::Int32, StackValueKind::Int32) => {
                                    let x = entry_value(&a)?.as_i32()?;
                                    let y = entry_value(&b)?.as_i32()?;
                                    int_compare(
                                        cmp,
                                        x as i64,
                                        y as i64,
                                        x as u32 as u64,
                                        y as u32 as u64,
                                    )
                                }
                                (StackValueKind::Int64, StackValueKind::Int64) => {
                                    let x = entry_value(&a)?.as_i64()?;
                                    let y = entry_value(&b)?.as_i64()?;
                                    int_compare(cmp, x, y, x as u64, y as u64)
                                }
                                (StackValueKind::Float, StackValueKind::Float) => {
                                    let x = entry_value(&a)?.as_f64()?;
                                    let y = entry_value(&b)?.as_f64()?;
                                    float_compare(cmp, x, y)
                                }
                                _ => fail!(FailureReason::OperandKinds(opcode)),
                            }
                        }
                    };

                    if taken {
                        // The single device that guarantees termination:
                        // control may only ever move forward.
                        if branch_target < reader.offset() {
                            fail!(FailureReason::BackwardBranch(opcode));
                        }
                        reader.seek(branch_target)?;
                    }
                }

                Ceq => {
                    let b = stack.pop()?;
                    let a = stack.pop()?;
                    if a.kind != b.kind {
                        fail!(FailureReason::OperandKinds(opcode));
                    }
                    let equal = Value::equals(&a.value, &b.value, meta)?;
                    stack.push(
                        StackValueKind::Int32,
                        ValueTypeValue::from_i32(equal as i32).into(),
                    );
                }

                Cgt | CgtUn | Clt | CltUn => {
                    let b = stack.pop()?;
                    let a = stack.pop()?;
                    let condition = match (a.kind, b.kind) {
                        (StackValueKind::Int32, StackValueKind::Int32) => {
                            let x = entry_value(&a)?.as_i32()?;
                            let y = entry_value(&b)?.as_i32()?;
                            match opcode {
                                Cgt => x > y,
                                CgtUn => (x as u32) > (y as u32),
                                Clt => x < y,
                                _ => (x as u32) < (y as u32),
                            }
                        }
                        (StackValueKind::Int64, StackValueKind::Int64) => {
                            let x = entry_value(&a)?.as_i64()?;
                            let y = entry_value(&b)?.as_i64()?;
                            match opcode {
                                Cgt => x > y,
                                CgtUn => (x as u64) > (y as u64),
                                Clt => x < y,
                                _ => (x as u64) < (y as u64),
                            }
                        }
                        (StackValueKind::Float, StackValueKind::Float) => {
                            let x = entry_value(&a)?.as_f64()?;
                            let y = entry_value(&b)?.as_f64()?;
                            match opcode {
                                Cgt => x > y,
                                CgtUn => !(x <= y),
                                Clt => x < y,
                                _ => !(x >= y),
                            }
                        }
                        // The null-test idiom: `ldnull; cgt.un`.
                        (StackValueKind::ObjRef, StackValueKind::ObjRef) if opcode == CgtUn => {
                            a.value.is_some() && b.value.is_none()
                        }
                        _ => fail!(FailureReason::OperandKinds(opcode)),
                    };
                    stack.push(
                        StackValueKind::Int32,
                        ValueTypeValue::from_i32(condition as i32).into(),
                    );
                }

                Neg => {
                    let popped = stack.pop()?;
                    if popped.kind != StackValueKind::Int32 {
                        fail!(FailureReason::OperandKinds(opcode));
                    }
                    let value = entry_value(&popped)?.as_i32()?;
                    stack.push(
                        StackValueKind::Int32,
                        ValueTypeValue::from_i32(value.wrapping_neg()).into(),
                    );
                }

                Add | Sub | Mul | Div | Rem | And | Or | Shl => {
                    let is_div_rem = matches!(opcode, Div | Rem);
                    let b = stack.pop()?;
                    let a = stack.pop()?;
                    match (a.kind, b.kind) {
                        (StackValueKind::Int32, StackValueKind::Int32) => {
                            let x = entry_value(&a)?.as_i32()?;
                            let y = entry_value(&b)?.as_i32()?;
                            if is_div_rem && y == 0 {
                                fail!(FailureReason::DivisionByZero(opcode));
                            }
                            let result = match opcode {
                                Add => x.wrapping_add(y),
                                Sub => x.wrapping_sub(y),
                                Mul => x.wrapping_mul(y),
                                And => x & y,
                                Or => x | y,
                                Shl => x.wrapping_shl(y as u32),
                                Div => x
                                    .checked_div(y)
                                    .ok_or(ScanError::Fail(FailureReason::Overflow(opcode)))?,
                                _ => x
                                    .checked_rem(y)
                                    .ok_or(ScanError::Fail(FailureReason::Overflow(opcode)))?,
                            };
                            stack.push(
                                StackValueKind::Int32,
                                ValueTypeValue::from_i32(result).into(),
                            );
                        }
                        (StackValueKind::Int64, StackValueKind::Int64) => {
                            let x = entry_value(&a)?.as_i64()?;
                            let y = entry_value(&b)?.as_i64()?;
                            if is_div_rem && y == 0 {
                                fail!(FailureReason::DivisionByZero(opcode));
                            }
                            let result = match opcode {
                                Add => x.wrapping_add(y),
                                Sub => x.wrapping_sub(y),
                                Mul => x.wrapping_mul(y),
                                And => x & y,
                                Or => x | y,
                                Div => x
                                    .checked_div(y)
                                    .ok_or(ScanError::Fail(FailureReason::Overflow(opcode)))?,
                                Rem => x
                                    .checked_rem(y)
                                    .ok_or(ScanError::Fail(FailureReason::Overflow(opcode)))?,
                                // A 64-bit shift amount is not valid IL.
                                _ => fail!(FailureReason::OperandKinds(opcode)),
                            };
                            stack.push(
                                StackValueKind::Int64,
                                ValueTypeValue::from_i64(result).into(),
                            );
                        }
                        (StackValueKind::Float, StackValueKind::Float) => {
                            if matches!(opcode, And | Or | Shl) {
                                return Err(InvalidIl::KindMismatch.into());
                            }
                            let x = entry_value(&a)?.as_f64()?;
                            let y = entry_value(&b)?.as_f64()?;
                            if is_div_rem && y == 0.0 {
                                fail!(FailureReason::DivisionByZero(opcode));
                            }
                            let result = match opcode {
                                Add => x + y,
                                Sub => x - y,
                                Mul => x * y,
                                Div => x / y,
                                _ => x % y,
                            };
                            stack.push(
                                StackValueKind::Float,
                                ValueTypeValue::from_f64(result).into(),
                            );
                        }
                        (StackValueKind::Int64, StackValueKind::Int32) if opcode == Shl => {
                            let x = entry_value(&a)?.as_i64()?;
                            let y = entry_value(&b)?.as_i32()?;
                            stack.push(
                                StackValueKind::Int64,
                                ValueTypeValue::from_i64(x.wrapping_shl(y as u32)).into(),
                            );
                        }
                        _ => fail!(FailureReason::OperandKinds(opcode)),
                    }
                }

                ConvI | ConvU | ConvI2 | ConvI4 | ConvI8 | ConvU2 | ConvU8 => {
                    let popped = stack.pop()?;
                    match popped.kind {
                        StackValueKind::Int32 => {
                            let value = entry_value(&popped)?.as_i32()?;
                            match opcode {
                                ConvI => stack.push(
                                    StackValueKind::NativeInt,
                                    ValueTypeValue::from_native_int(value as i64, target).into(),
                                ),
                                ConvU => stack.push(
                                    StackValueKind::NativeInt,
                                    ValueTypeValue::from_native_int(value as u32 as i64, target)
                                        .into(),
                                ),
                                ConvI2 => stack.push(
                                    StackValueKind::Int32,
                                    ValueTypeValue::from_i32(value as i16 as i32).into(),
                                ),
                                ConvU2 => stack.push(
                                    StackValueKind::Int32,
                                    ValueTypeValue::from_i32(value as u16 as i32).into(),
                                ),
                                ConvI8 => stack.push(
                                    StackValueKind::Int64,
                                    ValueTypeValue::from_i64(value as i64).into(),
                                ),
                                ConvU8 => stack.push(
                                    StackValueKind::Int64,
                                    ValueTypeValue::from_i64(value as u32 as i64).into(),
                                ),
                                _ => fail!(FailureReason::Unsupported(opcode)),
                            }
                        }
                        StackValueKind::NativeInt => {
                            let value = if target.pointer_size == 8 {
                                entry_value(&popped)?.as_i64()?
                            } else {
                                entry_value(&popped)?.as_i32()? as i64
                            };
                            match opcode {
                                ConvI4 => stack.push(
                                    StackValueKind::Int32,
                                    ValueTypeValue::from_i32(value as i32).into(),
                                ),
                                _ => fail!(FailureReason::Unsupported(opcode)),
                            }
                        }
                        StackValueKind::Int64 => {
                            let value = entry_value(&popped)?.as_i64()?;
                            match opcode {
                                ConvU => stack.push(
                                    StackValueKind::NativeInt,
                                    ValueTypeValue::from_native_int(value, target).into(),
                                ),
                                _ => fail!(FailureReason::Unsupported(opcode)),
                            }
                        }
                        StackValueKind::Float => {
                            let value = entry_value(&popped)?.as_f64()?;
                            match opcode {
                                ConvI8 => stack.push(
                                    StackValueKind::Int64,
                                    ValueTypeValue::from_i64(value as i64).into(),
                                ),
                                _ => fail!(FailureReason::Unsupported(opcode)),
                            }
                        }
                        _ => fail!(FailureReason::Unsupported(opcode)),
                    }
                }

                // Explicit fail-closed default: anything we did not model
                // above aborts the scan with the opcode named.
                other => fail!(FailureReason::UnsupportedOpcode(other)),
            }
        }

        fail!(FailureReason::FellThrough);
    }

    /// Special-cased helper calls that are understood without interpreting
    /// their bodies. Returns whether the call was fully handled; an
    /// argument shape that does not match falls back to ordinary
    /// interpretation (and typically fails there on the extern body).
    fn try_intrinsic_call(&mut self, callee: MethodId, args: &[Slot]) -> ScanResult<bool> {
        let meta = self.meta;
        match meta.method(callee).intrinsic {
            Some(Intrinsic::InitializeArray) => {
                let [Some(Value::Array(array)), Some(Value::FieldHandle(handle))] = args else {
                    return Ok(false);
                };
                let fdef = meta.field(handle.field());
                if !fdef.is_static {
                    return Ok(false);
                }
                let Some(rva_data) = &fdef.rva_data else {
                    return Ok(false);
                };
                Ok(array.try_initialize(rva_data))
            }
            None => Ok(false),
        }
    }
}
