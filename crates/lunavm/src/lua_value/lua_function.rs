use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use smol_str::SmolStr;

use super::{Chunk, LuaValue, ThreadId};
use crate::lua_vm::{LuaResult, LuaVM};

/// Host function signature: receives the VM and the call arguments (final
/// tuple already expanded) and returns one value; several results travel
/// as a `Tuple`, none as `Void`.
pub type CFunction = Rc<dyn Fn(&mut LuaVM, Vec<LuaValue>) -> LuaResult<LuaValue>>;

/// Continuation or error handler attached to a frame by a `TailCallRequest`.
pub type HostCallback = Rc<dyn Fn(&mut LuaVM, LuaValue) -> LuaResult<LuaValue>>;

pub struct HostFunction {
    pub name: SmolStr,
    pub func: CFunction,
}

impl HostFunction {
    pub fn new(
        name: impl Into<SmolStr>,
        func: impl Fn(&mut LuaVM, Vec<LuaValue>) -> LuaResult<LuaValue> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.name)
    }
}

/// Script function: shared proto plus captured upvalues.
pub struct LuaClosure {
    chunk: Rc<Chunk>,
    upvalues: Vec<Rc<LuaUpvalue>>,
}

impl LuaClosure {
    pub fn new(chunk: Rc<Chunk>, upvalues: Vec<Rc<LuaUpvalue>>) -> Self {
        Self { chunk, upvalues }
    }

    #[inline(always)]
    pub fn chunk(&self) -> &Rc<Chunk> {
        &self.chunk
    }

    #[inline(always)]
    pub fn upvalues(&self) -> &[Rc<LuaUpvalue>] {
        &self.upvalues
    }

    pub fn name(&self) -> &str {
        &self.chunk.name
    }
}

impl fmt::Debug for LuaClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaClosure")
            .field("name", &self.chunk.name)
            .field("upvalues", &self.upvalues.len())
            .finish()
    }
}

/// A captured variable. While open it aliases a value-stack slot of some
/// thread; closing copies the slot value into the upvalue itself.
pub struct LuaUpvalue {
    state: RefCell<UpvalueState>,
}

#[derive(Debug, Clone)]
pub enum UpvalueState {
    Open { thread: ThreadId, slot: usize },
    Closed(LuaValue),
}

impl LuaUpvalue {
    pub fn new_open(thread: ThreadId, slot: usize) -> Rc<Self> {
        Rc::new(LuaUpvalue {
            state: RefCell::new(UpvalueState::Open { thread, slot }),
        })
    }

    pub fn new_closed(value: LuaValue) -> Rc<Self> {
        Rc::new(LuaUpvalue {
            state: RefCell::new(UpvalueState::Closed(value)),
        })
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.borrow(), UpvalueState::Open { .. })
    }

    /// `(thread, absolute slot)` while open.
    pub fn open_slot(&self) -> Option<(ThreadId, usize)> {
        match *self.state.borrow() {
            UpvalueState::Open { thread, slot } => Some((thread, slot)),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Value of a closed upvalue.
    pub fn closed_value(&self) -> Option<LuaValue> {
        match &*self.state.borrow() {
            UpvalueState::Closed(value) => Some(value.clone()),
            UpvalueState::Open { .. } => None,
        }
    }

    /// Store into a closed upvalue; returns false while still open.
    pub fn set_closed_value(&self, value: LuaValue) -> bool {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            UpvalueState::Closed(slot) => {
                *slot = value;
                true
            }
            UpvalueState::Open { .. } => false,
        }
    }

    /// Detach from the stack, keeping `stack_value` as the captured value.
    pub fn close(&self, stack_value: LuaValue) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, UpvalueState::Open { .. }) {
            *state = UpvalueState::Closed(stack_value);
        }
    }
}

impl fmt::Debug for LuaUpvalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LuaUpvalue({:?})", self.state.borrow())
    }
}
