use std::cell::RefCell;
use std::fmt;

use super::LuaValue;
use crate::lua_vm::{CallFlags, CallInfo};
use crate::lua_vm::lua_limits::BASIC_STACK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub(crate) u32);

impl ThreadId {
    pub const MAIN: ThreadId = ThreadId(0);

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    NotStarted,
    Running,
    Suspended,
    Dead,
}

impl CoroutineStatus {
    /// Name reported by `coroutine.status` (the resumer chain reports
    /// "normal" on top of this).
    pub fn as_str(self) -> &'static str {
        match self {
            CoroutineStatus::NotStarted | CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Dead => "dead",
        }
    }
}

/// How a suspended thread expects to be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldKind {
    /// Suspended inside a call (`yield` or an awaited future): the resume
    /// values become that call's result.
    Call,
    /// Suspended by the instruction budget: resume re-runs the saved pc.
    Forced,
}

/// Value stack and call stack of one thread of execution.
pub struct ThreadState {
    pub(crate) id: ThreadId,
    pub(crate) stack: Vec<LuaValue>,
    pub(crate) frames: Vec<CallInfo>,
    pub(crate) pending: Option<YieldKind>,
    /// Result transforms of the call that yielded, applied to the resume
    /// values.
    pub(crate) resume_flags: CallFlags,
}

impl ThreadState {
    pub fn new(id: ThreadId) -> Self {
        ThreadState {
            id,
            stack: Vec::with_capacity(BASIC_STACK_SIZE),
            frames: Vec::new(),
            pending: None,
            resume_flags: 0,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Close every upvalue still open on this thread's frames.
    pub(crate) fn close_all_upvalues(&mut self) {
        for frame in self.frames.iter_mut() {
            for (slot, uv) in frame.open_upvalues.drain(..) {
                let value = self.stack.get(slot).cloned().unwrap_or_default();
                uv.close(value);
            }
        }
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.close_all_upvalues();
    }
}

pub(crate) struct CoroutineInner {
    pub status: CoroutineStatus,
    /// Saved thread while not running; `None` while swapped into the VM.
    pub state: Option<ThreadState>,
    pub function: LuaValue,
    pub auto_yield: u64,
}

/// Script-visible coroutine handle.
pub struct LuaCoroutine {
    id: ThreadId,
    pub(crate) inner: RefCell<CoroutineInner>,
}

impl LuaCoroutine {
    pub(crate) fn new(id: ThreadId, function: LuaValue, auto_yield: u64) -> Self {
        LuaCoroutine {
            id,
            inner: RefCell::new(CoroutineInner {
                status: CoroutineStatus::NotStarted,
                state: Some(ThreadState::new(id)),
                function,
                auto_yield,
            }),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn status(&self) -> CoroutineStatus {
        self.inner.borrow().status
    }

    pub fn auto_yield_counter(&self) -> u64 {
        self.inner.borrow().auto_yield
    }

    /// Instruction budget between forced yields; 0 disables them.
    pub fn set_auto_yield_counter(&self, budget: u64) {
        self.inner.borrow_mut().auto_yield = budget;
    }
}

impl fmt::Debug for LuaCoroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LuaCoroutine({}, {:?})", self.id.0, self.status())
    }
}
