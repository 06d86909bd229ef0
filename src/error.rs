use crate::il::IlOpcode;
use thiserror::Error;

/// Structural IL violations.
///
/// These indicate input that verifiable bytecode can never contain (or an
/// interpreter bug), so they abort the whole scan with no partial result.
/// They are distinct from [`FailureReason`]: a `FailureReason` means "this
/// construct is deliberately not supported", an `InvalidIl` means "this
/// method body is malformed for our purposes".
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidIl {
    #[error("evaluation stack underflow")]
    StackUnderflow,

    #[error("stack entry kind does not fit the target location")]
    KindMismatch,

    #[error("value width does not match the access width")]
    WidthMismatch,

    #[error("branch target outside the method body")]
    BranchOutOfRange,

    #[error("local or argument index out of range")]
    IndexOutOfRange,

    #[error("unresolvable or wrong-kind metadata token")]
    BadToken,

    #[error("memory access outside the backing buffer")]
    OutOfBounds,

    #[error("instruction stream ends mid-instruction")]
    TruncatedStream,

    #[error("unknown opcode encoding {0:#06x}")]
    UnknownOpcode(u16),

    #[error("operation applied to an incompatible value")]
    IncompatibleValue,

    #[error("return does not match the method signature")]
    ReturnArity,
}

/// Reasons a static constructor cannot be evaluated at compile time.
///
/// None of these are errors in the input program; they only mean the
/// optimization is skipped and the type initializes at runtime as usual.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    #[error("extern method without an IL body")]
    ExternMethod,

    #[error("recursive call chain")]
    Recursion,

    #[error("method carries a finally region")]
    FinallyRegion,

    #[error("{0}: backwards branch")]
    BackwardBranch(IlOpcode),

    #[error("{0}: access to another type's statics")]
    CrossTypeStatic(IlOpcode),

    #[error("{0}: thread-static or RVA-mapped static")]
    UnsupportedStatic(IlOpcode),

    #[error("{0}: unsupported byref source")]
    UnsupportedByRef(IlOpcode),

    #[error("{0}: GC pointers")]
    GcPointer(IlOpcode),

    #[error("{0}: callee cannot be inlined here")]
    UninlinableCall(IlOpcode),

    #[error("{0}: another type's static constructor could interfere")]
    CctorInterference(IlOpcode),

    #[error("{0}: unsupported allocation")]
    UnsupportedAllocation(IlOpcode),

    #[error("{0}: division by zero")]
    DivisionByZero(IlOpcode),

    #[error("{0}: arithmetic overflow")]
    Overflow(IlOpcode),

    #[error("{0}: array bounds")]
    ArrayBounds(IlOpcode),

    #[error("{0}: null array")]
    NullArray(IlOpcode),

    #[error("{0}: null reference")]
    NullReference(IlOpcode),

    #[error("{0}: nullable box")]
    NullableBox(IlOpcode),

    #[error("{0}: unsupported token kind")]
    UnsupportedToken(IlOpcode),

    #[error("{0}: value does not hold instance fields")]
    NoInstanceFields(IlOpcode),

    #[error("{0}: unsupported operand kinds")]
    OperandKinds(IlOpcode),

    #[error("{0}: not supported by the preinitializer")]
    Unsupported(IlOpcode),

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(IlOpcode),

    #[error("control fell through the end of the method")]
    FellThrough,
}

/// Either error class, as threaded through the interpreter.
///
/// Both classes unwind every recursive frame via `?`; the orchestration
/// layer folds them into one failure-shaped result, so callers only ever
/// observe a single failure outcome.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid program: {0}")]
    Invalid(#[from] InvalidIl),

    #[error(transparent)]
    Fail(#[from] FailureReason),
}

pub type ScanResult<T> = Result<T, ScanError>;
