// Debug hook and traceback

use smol_str::SmolStr;

use crate::lua_value::{Chunk, SourceRef, ThreadId};
use crate::lua_vm::{LuaVM, OpCode, call_flags};

/// One dispatched instruction, as seen by the debug hook.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugEvent {
    pub thread: ThreadId,
    /// Call depth of the executing frame (1 for the bottom frame).
    pub depth: usize,
    pub pc: usize,
    pub opcode: OpCode,
    pub source: Option<SourceRef>,
    /// Name of the executing function's chunk.
    pub function: SmolStr,
}

pub type DebugHook = Box<dyn FnMut(&DebugEvent)>;

impl LuaVM {
    /// Install (or remove) a hook called before every instruction.
    pub fn set_debug_hook(&mut self, hook: Option<DebugHook>) {
        self.debug_hook = hook;
    }

    pub fn has_debug_hook(&self) -> bool {
        self.debug_hook.is_some()
    }

    pub(crate) fn fire_debug_hook(&mut self, chunk: &Chunk, depth: usize, pc: usize, opcode: OpCode) {
        let event = DebugEvent {
            thread: self.thread.id,
            depth,
            pc,
            opcode,
            source: chunk.source_ref_at(pc),
            function: chunk.name.clone(),
        };
        if let Some(hook) = self.debug_hook.as_mut() {
            hook(&event);
        }
    }

    /// Location of the instruction running at `level`: 1 is the innermost
    /// script frame, 2 its caller and so on.
    pub fn location_at_level(&self, level: usize) -> Option<String> {
        let frames = &self.thread.frames;
        if level == 0 || level > frames.len() {
            return None;
        }
        let frame = &frames[frames.len() - level];
        frame.closure.chunk().location(frame.pc.saturating_sub(1))
    }

    /// Call stack of the running thread, innermost frame first.
    pub fn traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for frame in self.thread.frames.iter().rev() {
            let chunk = frame.closure.chunk();
            let location = chunk
                .location(frame.pc.saturating_sub(1))
                .unwrap_or_else(|| format!("{}:?", chunk.source_name));
            out.push_str(&format!("\n\t{}: in function '{}'", location, chunk.name));
            if frame.has(call_flags::TAIL_CALL) {
                out.push_str("\n\t(...tail calls...)");
            }
        }
        out
    }
}
