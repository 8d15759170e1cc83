// CallInfo - one activation record on a thread's call stack

use std::rc::Rc;

use crate::lua_value::{HostCallback, LuaClosure, LuaUpvalue, LuaValue};

pub type CallFlags = u8;

/// Frame flags. The `*_RESULT` / `TO_BOOL` / `METHOD_LOOKUP` group rewrites
/// the value a frame returns before it reaches its caller.
pub mod call_flags {
    use super::CallFlags;

    pub const NONE: CallFlags = 0;
    /// Frame replaced its caller.
    pub const TAIL_CALL: CallFlags = 1 << 0;
    /// Invoked through `ThisCall`.
    pub const METHOD_CALL: CallFlags = 1 << 1;
    /// Bottom frame of one `execute` invocation; returning from it leaves
    /// the loop.
    pub const ENTRY_POINT: CallFlags = 1 << 2;
    /// Drop the result (`__newindex` handlers).
    pub const DISCARD_RESULT: CallFlags = 1 << 3;
    /// Push `not result` (`__le` answered by `__lt`).
    pub const NEGATE_RESULT: CallFlags = 1 << 4;
    /// Push `boolean(result)` (`__eq`, `__lt`, `__le`).
    pub const TO_BOOL: CallFlags = 1 << 5;
    /// Push the result below the value on top (`IndexL`).
    pub const METHOD_LOOKUP: CallFlags = 1 << 6;

    pub const RESULT_TRANSFORMS: CallFlags =
        DISCARD_RESULT | NEGATE_RESULT | TO_BOOL | METHOD_LOOKUP;

    /// Flags a `TailCallRequest` passes on to the frame it creates.
    pub const INHERITED: CallFlags = ENTRY_POINT | RESULT_TRANSFORMS;
}

/// Handlers a `TailCallRequest` installs on the frame it creates.
#[derive(Clone, Default)]
pub struct FrameHandlers {
    pub continuation: Option<HostCallback>,
    pub error_handler: Option<HostCallback>,
    pub pre_unwind: Option<LuaValue>,
}

impl FrameHandlers {
    pub fn is_empty(&self) -> bool {
        self.continuation.is_none() && self.error_handler.is_none() && self.pre_unwind.is_none()
    }
}

pub struct CallInfo {
    pub closure: Rc<LuaClosure>,
    /// First argument slot; the callee itself sits at `args_base - 1`.
    pub args_base: usize,
    pub arg_count: usize,
    /// First local slot.
    pub base: usize,
    /// Next instruction to execute.
    pub pc: usize,
    /// Caller pc to continue at after this frame returns.
    pub return_address: usize,
    pub call_status: CallFlags,
    pub handlers: FrameHandlers,
    /// Upvalues open on this frame's slots, keyed by absolute slot.
    pub open_upvalues: Vec<(usize, Rc<LuaUpvalue>)>,
}

impl CallInfo {
    pub fn new(
        closure: Rc<LuaClosure>,
        args_base: usize,
        arg_count: usize,
        return_address: usize,
        call_status: CallFlags,
        handlers: FrameHandlers,
    ) -> Self {
        CallInfo {
            closure,
            args_base,
            arg_count,
            base: args_base + arg_count,
            pc: 0,
            return_address,
            call_status,
            handlers,
            open_upvalues: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn has(&self, flag: CallFlags) -> bool {
        self.call_status & flag != 0
    }

    #[inline(always)]
    pub fn is_entry_point(&self) -> bool {
        self.has(call_flags::ENTRY_POINT)
    }

    /// Frames whose result or errors need host attention cannot be elided
    /// by a tail call.
    pub fn blocks_tail_call(&self) -> bool {
        !self.handlers.is_empty() || self.has(call_flags::INHERITED)
    }

    /// Find or create the open upvalue for absolute `slot`.
    pub fn capture(&mut self, slot: usize, make: impl FnOnce() -> Rc<LuaUpvalue>) -> Rc<LuaUpvalue> {
        if let Some((_, uv)) = self.open_upvalues.iter().find(|(s, _)| *s == slot) {
            return uv.clone();
        }
        let uv = make();
        self.open_upvalues.push((slot, uv.clone()));
        uv
    }
}
