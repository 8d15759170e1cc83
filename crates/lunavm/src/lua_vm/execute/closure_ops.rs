// Function prologue, closures and upvalues
//
// An open upvalue names an absolute slot of one thread. While that thread
// is not the running one its stack lives either on the resume chain or
// inside its coroutine handle, and is reached there.

use std::rc::Rc;

use tracing::trace;

use crate::lua_value::{Chunk, LuaClosure, LuaUpvalue, LuaValue, ThreadId};
use crate::lua_vm::{CallInfo, LuaError, LuaResult, LuaVM, RuntimeErrorKind};

impl LuaVM {
    /// Reserve `count` local slots above the arguments.
    pub(super) fn op_begin_fn(&mut self, frame_idx: usize, count: usize) -> LuaResult<()> {
        let base = self.thread.frames[frame_idx].base;
        let top = base + count;
        if top > self.safe_option.max_stack_size {
            return Err(LuaError::runtime(
                RuntimeErrorKind::StackOverflow,
                "stack overflow",
            ));
        }
        self.thread.stack.resize(top, LuaValue::Nil);
        Ok(())
    }

    /// Copy arguments into locals `0..count`. For a vararg chunk the last
    /// of those locals receives every remaining argument as a tuple.
    pub(super) fn op_args(&mut self, chunk: &Chunk, frame_idx: usize, count: usize) -> LuaResult<()> {
        let frame = &self.thread.frames[frame_idx];
        let (args_base, arg_count, base) = (frame.args_base, frame.arg_count, frame.base);
        if base + count > self.thread.stack.len() {
            return Err(LuaError::internal("arguments bound before locals were reserved"));
        }
        let stack = &mut self.thread.stack;
        for i in 0..count {
            let value = if chunk.is_vararg && i + 1 == count {
                let rest = if i < arg_count {
                    stack[args_base + i..args_base + arg_count].to_vec()
                } else {
                    Vec::new()
                };
                LuaValue::tuple(rest)
            } else if i < arg_count {
                stack[args_base + i].clone()
            } else {
                LuaValue::Nil
            };
            stack[base + i] = value;
        }
        Ok(())
    }

    pub(super) fn op_closure(
        &mut self,
        chunk: &Chunk,
        closure: &Rc<LuaClosure>,
        frame_idx: usize,
        index: usize,
    ) -> LuaResult<()> {
        let proto = chunk
            .protos
            .get(index)
            .cloned()
            .ok_or_else(|| LuaError::internal(format!("proto {} out of range", index)))?;
        let base = self.thread.frames[frame_idx].base;
        let thread = self.thread.id;
        let mut upvalues = Vec::with_capacity(proto.upvalue_descs.len());
        for desc in &proto.upvalue_descs {
            let uv = if desc.from_parent_local {
                let slot = base + desc.index as usize;
                self.thread.frames[frame_idx].capture(slot, || LuaUpvalue::new_open(thread, slot))
            } else {
                closure
                    .upvalues()
                    .get(desc.index as usize)
                    .cloned()
                    .ok_or_else(|| {
                        LuaError::internal(format!("enclosing upvalue {} out of range", desc.index))
                    })?
            };
            upvalues.push(uv);
        }
        self.push(LuaValue::Function(Rc::new(LuaClosure::new(proto, upvalues))));
        Ok(())
    }

    /// Close upvalues over locals `from..=to` and clear those slots, so the
    /// next loop iteration captures fresh variables.
    pub(super) fn op_clean(&mut self, frame_idx: usize, from: usize, to: usize) -> LuaResult<()> {
        let base = self.thread.frames[frame_idx].base;
        for local in from..=to {
            let slot = base + local;
            let frame = &mut self.thread.frames[frame_idx];
            if let Some(pos) = frame.open_upvalues.iter().position(|(s, _)| *s == slot) {
                let (_, uv) = frame.open_upvalues.swap_remove(pos);
                let value = self.thread.stack.get(slot).cloned().unwrap_or_default();
                uv.close(value);
                trace!(slot, "upvalue closed");
            }
            if let Some(value) = self.thread.stack.get_mut(slot) {
                *value = LuaValue::Nil;
            }
        }
        Ok(())
    }

    pub(crate) fn close_frame_upvalues(&self, frame: &mut CallInfo) {
        for (slot, uv) in frame.open_upvalues.drain(..) {
            let value = self.thread.stack.get(slot).cloned().unwrap_or_default();
            uv.close(value);
        }
    }

    // ============ Upvalue access ============

    pub(crate) fn upvalue_get(&self, uv: &LuaUpvalue) -> LuaValue {
        match uv.open_slot() {
            None => uv.closed_value().unwrap_or_default(),
            Some((thread, slot)) => self.read_thread_slot(thread, slot),
        }
    }

    pub(crate) fn upvalue_set(&mut self, uv: &LuaUpvalue, value: LuaValue) {
        match uv.open_slot() {
            None => {
                uv.set_closed_value(value);
            }
            Some((thread, slot)) => self.write_thread_slot(thread, slot, value),
        }
    }

    fn read_thread_slot(&self, thread: ThreadId, slot: usize) -> LuaValue {
        if thread == self.thread.id {
            return self.thread.stack.get(slot).cloned().unwrap_or_default();
        }
        if let Some(state) = self.resume_chain.iter().rev().find(|s| s.id == thread) {
            return state.stack.get(slot).cloned().unwrap_or_default();
        }
        if let Some(co) = self.coroutines.get(&thread).and_then(|w| w.upgrade())
            && let Ok(inner) = co.inner.try_borrow()
            && let Some(state) = &inner.state
        {
            return state.stack.get(slot).cloned().unwrap_or_default();
        }
        LuaValue::Nil
    }

    fn write_thread_slot(&mut self, thread: ThreadId, slot: usize, value: LuaValue) {
        let target = if thread == self.thread.id {
            self.thread.stack.get_mut(slot)
        } else if let Some(state) = self.resume_chain.iter_mut().rev().find(|s| s.id == thread) {
            state.stack.get_mut(slot)
        } else {
            if let Some(co) = self.coroutines.get(&thread).and_then(|w| w.upgrade())
                && let Ok(mut inner) = co.inner.try_borrow_mut()
                && let Some(state) = inner.state.as_mut()
                && let Some(target) = state.stack.get_mut(slot)
            {
                *target = value;
            }
            return;
        };
        if let Some(target) = target {
            *target = value;
        }
    }
}
