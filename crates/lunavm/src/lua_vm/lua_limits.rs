//! Centralized VM limits and configuration constants.
//!
//! Every magic number that controls VM behavior lives here so the defaults
//! of `SafeOption` have a single source.

// ===== Stack =====

/// Default maximum value-stack size (number of slots).
pub const MAX_STACK_SIZE: usize = 1_000_000;

/// Default maximum call nesting depth for script frames.
pub const MAX_CALL_DEPTH: usize = 200_000;

/// Maximum nesting of host -> script -> host re-entries (`pcall` from a
/// host function, `__tostring`, `coroutine.resume`, ...).
pub const MAX_HOST_CALL_DEPTH: usize = 200;

/// Initial capacity reserved for a fresh value stack.
pub const BASIC_STACK_SIZE: usize = 64;

// ===== Tail calls =====

/// Call depth above which a call followed by `Ret 1` replaces its caller.
pub const TAIL_CALL_THRESHOLD: usize = 64;

/// Value-stack size above which tail-call elision kicks in regardless of
/// call depth.
pub const TAIL_CALL_VALUE_THRESHOLD: usize = 65_536;

// ===== Metamethods =====

/// Maximum chained `__index` / `__newindex` table hops before
/// "loop in index" / "loop in newindex".
pub const MAX_META_LOOP: usize = 100;

/// Maximum `__call` indirections resolved for a single call site.
pub const MAX_CALL_CHAIN: usize = 100;

// ===== Tables =====

/// Lowest integral key routed to the array index.
pub const DEFAULT_INDEX_BASE: i64 = 1;

// ===== Coroutines =====

/// Instruction budget for forced yields; zero disables auto-yield.
pub const DEFAULT_AUTO_YIELD: u64 = 0;
