/// The type returned by warp core methods.
pub type WarpResult<T = ()> = Result<T, WarpError>;

/// Core error codes. The space of values is divided as follows:
/// - Negative values down to -19 are generic failures shared by every
///   subsystem.
/// - -40..-49 are distributed-memory failures.
/// - -50..-59 are interpreter failures.
/// - -60..-69 are warp/control-plane failures.
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[repr(i32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WarpError {
    /// The system encountered an otherwise unspecified error
    /// while performing the operation.
    INTERNAL = -1,

    /// The operation is not implemented, supported, or enabled.
    /// Example: an FFI call that is not in the library filter table.
    NOT_SUPPORTED = -2,

    /// The system was not able to allocate memory needed
    /// for the operation.
    NO_MEMORY = -4,

    /// An argument is invalid, ex. a null address.
    INVALID_ARGS = -10,

    /// An argument is outside the valid range for this operation.
    OUT_OF_RANGE = -14,

    /// The operation failed because the current state of the
    /// object does not allow it, or a precondition of the operation is
    /// not satisfied.
    BAD_STATE = -20,

    /// The time limit for the operation elapsed before
    /// the operation completed.
    TIMED_OUT = -21,

    /// The operation cannot be performed currently but potentially could
    /// succeed if the caller waits for a prerequisite to be satisfied.
    /// Example: a memory access that misses locally and has to wait for
    /// the page to arrive from its owner. The calling thread yields and
    /// the instruction re-executes once the page is resident.
    SHOULD_WAIT = -22,

    /// The requested entity is not found.
    NOT_FOUND = -25,

    /// An object with the specified identifier already exists.
    /// Example: activating a process twice on the same node.
    ALREADY_EXISTS = -26,

    // ======= Distributed-memory errors =======
    /// Misaligned or out-of-range memory access.
    BAD_ACCESS = -40,

    /// The page is not resident on this node.
    NOT_RESIDENT = -41,

    /// Persistent inability to obtain a page: the coherence retry budget
    /// for an outstanding request was exhausted.
    COHERENCE_FAULT = -42,

    // ======= Interpreter errors =======
    /// The decoded instruction byte does not name an opcode, or the
    /// program counter left the function body.
    INVALID_OPCODE = -50,

    /// A type operand does not resolve to a usable type descriptor.
    INVALID_TYPE = -51,

    /// Integer division or remainder by zero.
    ARITHMETIC_TRAP = -52,

    // ======= Warp / control-plane errors =======
    /// The destination node declined the thread migration, or the warp
    /// deadline passed. The thread is restored to NORMAL on the source.
    WARP_REJECTED = -60,

    /// A command arrived for a process this node does not host.
    PROCESS_GONE = -61,
}
