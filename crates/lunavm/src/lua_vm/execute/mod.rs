/*----------------------------------------------------------------------
  Stack VM Execution Engine

  - One `'startfunc` iteration per frame switch: calls, returns, spliced
    metamethod handlers and tail calls all reload the top frame instead
    of recursing on the Rust stack.
  - The running frame's saved pc is advanced before an instruction runs,
    so error locations, yields and returns all see the next pc.
  - Host re-entry (`LuaVM::call`, `__iterator`, `__tostring`) starts a
    nested loop whose bottom frame is flagged ENTRY_POINT and sits at
    `target_depth`.
----------------------------------------------------------------------*/

mod call;
mod closure_ops;
mod loop_ops;
mod metamethod;
mod operators;
mod table_ops;
mod unwind;

use std::rc::Rc;

use tracing::{debug, trace};

use crate::lua_value::{AwaitRequest, Chunk, LuaClosure, LuaValue, YieldKind};
use crate::lua_vm::{FrameHandlers, Instruction, LuaError, LuaResult, LuaVM, OpCode, call_flags};

pub use metamethod::TmKind;

/// Parameters of one `execute` invocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExecContext {
    /// Frame count below the entry frame; the loop ends when the entry
    /// frame returns.
    pub target_depth: usize,
    /// Yields are allowed (coroutine body, not under a host call).
    pub can_yield: bool,
    /// Instructions per slice before a forced yield; 0 disables it.
    pub auto_yield: u64,
}

impl ExecContext {
    pub(crate) fn nested(target_depth: usize) -> Self {
        ExecContext {
            target_depth,
            can_yield: false,
            auto_yield: 0,
        }
    }
}

/// Why `execute` returned.
pub(crate) enum ExecOutcome {
    Returned(LuaValue),
    /// `coroutine.yield` payload (a tuple of the yielded values).
    Yielded(LuaValue),
    ForcedYield,
    Awaiting(Rc<AwaitRequest>),
}

/// What the loop does after an instruction.
pub(crate) enum Flow {
    /// Continue with the same frame.
    Next,
    /// The frame stack changed; reload the top frame.
    Reload,
    Exit(ExecOutcome),
}

#[inline(always)]
fn stack_underflow() -> LuaError {
    LuaError::internal("value stack underflow")
}

impl LuaVM {
    // ============ Stack primitives ============

    #[inline(always)]
    pub(crate) fn push(&mut self, value: LuaValue) {
        self.thread.stack.push(value);
    }

    #[inline(always)]
    pub(crate) fn pop(&mut self) -> LuaResult<LuaValue> {
        self.thread.stack.pop().ok_or_else(stack_underflow)
    }

    #[inline(always)]
    pub(crate) fn peek(&self, depth: usize) -> LuaResult<&LuaValue> {
        let len = self.thread.stack.len();
        if depth >= len {
            return Err(stack_underflow());
        }
        Ok(&self.thread.stack[len - 1 - depth])
    }

    #[inline(always)]
    fn top_mut(&mut self) -> LuaResult<&mut LuaValue> {
        self.thread.stack.last_mut().ok_or_else(stack_underflow)
    }

    // ============ Loop ============

    /// Run frames above `ctx.target_depth` until the entry frame returns,
    /// the thread suspends, or an error escapes every handler.
    pub(crate) fn execute(&mut self, ctx: ExecContext) -> LuaResult<ExecOutcome> {
        let mut executed = 0u64;
        let mut result = self.run(ctx, &mut executed);
        loop {
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(LuaError::Runtime(error)) if self.thread.frames.len() > ctx.target_depth => {
                    result = match self.unwind(error, ctx) {
                        Ok(Some(outcome)) => Ok(outcome),
                        Ok(None) => self.run(ctx, &mut executed),
                        Err(e) => Err(e),
                    };
                }
                Err(e) => {
                    self.abandon_frames(ctx.target_depth);
                    return Err(e);
                }
            }
        }
    }

    fn run(&mut self, ctx: ExecContext, executed: &mut u64) -> LuaResult<ExecOutcome> {
        'startfunc: loop {
            let depth = self.thread.frames.len();
            if depth <= ctx.target_depth {
                return Err(LuaError::internal("dispatch loop lost its entry frame"));
            }
            let frame_idx = depth - 1;
            let closure = self.thread.frames[frame_idx].closure.clone();
            let chunk = closure.chunk().clone();
            let base = self.thread.frames[frame_idx].base;

            loop {
                if ctx.auto_yield != 0 {
                    if *executed >= ctx.auto_yield {
                        self.thread.pending = Some(YieldKind::Forced);
                        debug!(
                            thread = self.thread.id.as_u32(),
                            executed = *executed,
                            "instruction budget exhausted"
                        );
                        return Ok(ExecOutcome::ForcedYield);
                    }
                    *executed += 1;
                }

                let pc = self.thread.frames[frame_idx].pc;
                let Some(&instr) = chunk.code.get(pc) else {
                    return Err(LuaError::internal(format!(
                        "pc {} out of range in '{}'",
                        pc, chunk.name
                    )));
                };
                let Some(op) = instr.get_opcode() else {
                    return Err(LuaError::internal(format!(
                        "unknown opcode {:#04x} at pc {} in '{}'",
                        instr.as_u64() & 0xFF,
                        pc,
                        chunk.name
                    )));
                };
                self.thread.frames[frame_idx].pc = pc + 1;
                self.stats.instructions += 1;
                if self.debug_hook.is_some() {
                    self.fire_debug_hook(&chunk, depth, pc, op);
                }
                trace!(pc, depth, "{}", instr);

                match self.step(op, instr, frame_idx, base, &chunk, &closure, ctx)? {
                    Flow::Next => {}
                    Flow::Reload => continue 'startfunc,
                    Flow::Exit(outcome) => return Ok(outcome),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &mut self,
        op: OpCode,
        instr: Instruction,
        frame_idx: usize,
        base: usize,
        chunk: &Chunk,
        closure: &Rc<LuaClosure>,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        let a = instr.get_a();
        let b = instr.get_b() as usize;
        let c = instr.get_c() as usize;
        match op {
            OpCode::Nop => {}

            // ============ Stack shuffling ============
            OpCode::Pop => {
                let n = instr.get_a_usize();
                let len = self.thread.stack.len();
                if n > len {
                    return Err(stack_underflow());
                }
                self.thread.stack.truncate(len - n);
            }
            OpCode::Copy => {
                let value = self.peek(instr.get_a_usize())?.clone();
                self.push(value);
            }
            OpCode::Swap => {
                let len = self.thread.stack.len();
                let (da, db) = (instr.get_a_usize(), b);
                if da >= len || db >= len {
                    return Err(stack_underflow());
                }
                self.thread.stack.swap(len - 1 - da, len - 1 - db);
            }

            // ============ Literals ============
            OpCode::LoadNil => self.push(LuaValue::Nil),
            OpCode::LoadBool => self.push(LuaValue::Boolean(a != 0)),
            OpCode::LoadNum => {
                let n = *chunk
                    .numbers
                    .get(b)
                    .ok_or_else(|| LuaError::internal(format!("number constant {} out of range", b)))?;
                self.push(LuaValue::Number(n));
            }
            OpCode::LoadStr => {
                let s = self.string_const(chunk, b)?;
                self.push(LuaValue::String(s));
            }

            // ============ Symbols ============
            OpCode::Load => return self.op_load(chunk, closure, base, instr.get_a_usize(), ctx),
            OpCode::Store => {
                return self.op_store(chunk, closure, base, instr.get_a_usize(), b, c == 1, ctx);
            }

            // ============ Tuples ============
            OpCode::MkTuple => {
                let n = instr.get_a_usize();
                let len = self.thread.stack.len();
                if n > len {
                    return Err(stack_underflow());
                }
                let items = self.thread.stack.split_off(len - n);
                self.push(LuaValue::tuple(expand_values(items)));
            }
            OpCode::ExpTuple => {
                let value = self.peek(instr.get_a_usize())?.clone();
                match value {
                    LuaValue::Tuple(items) => {
                        self.thread.stack.extend(items.iter().map(LuaValue::to_scalar));
                    }
                    LuaValue::Void => {}
                    other => self.push(other),
                }
            }
            OpCode::Scalar => {
                let top = self.top_mut()?;
                *top = std::mem::take(top).into_scalar();
            }

            // ============ Operators ============
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Concat => return self.op_arith(op, ctx),
            OpCode::Neg => return self.op_neg(ctx),
            OpCode::Len => return self.op_len(ctx),
            OpCode::Not => {
                let top = self.top_mut()?;
                *top = LuaValue::Boolean(!top.cast_to_bool());
            }
            OpCode::Eq => return self.op_eq(ctx),
            OpCode::Lt => return self.op_lt(ctx),
            OpCode::Le => return self.op_le(ctx),
            OpCode::ToBool => {
                let top = self.top_mut()?;
                *top = LuaValue::Boolean(top.cast_to_bool());
            }

            // ============ Tables ============
            OpCode::NewTable => {
                let table = self.create_table();
                self.push(table);
            }
            OpCode::TblInitN => self.op_tbl_init_named()?,
            OpCode::TblInitI => self.op_tbl_init_positional(a == 1)?,
            OpCode::Index => {
                let key = self.pop()?.into_scalar();
                let obj = self.pop()?.into_scalar();
                return self.index_into(obj, key, call_flags::NONE, ctx);
            }
            OpCode::IndexN => {
                let key = LuaValue::String(self.string_const(chunk, b)?);
                let obj = self.pop()?.into_scalar();
                return self.index_into(obj, key, call_flags::NONE, ctx);
            }
            OpCode::IndexL => {
                let key = LuaValue::String(self.string_const(chunk, b)?);
                let obj = self.peek(0)?.to_scalar();
                return self.index_into(obj, key, call_flags::METHOD_LOOKUP, ctx);
            }
            OpCode::IndexSet => {
                let key = self.pop()?.into_scalar();
                let obj = self.pop()?.into_scalar();
                let value = self.peek(instr.get_a_usize())?.tuple_get(b);
                return self.newindex_into(obj, key, value, ctx);
            }
            OpCode::IndexSetN => {
                let key = LuaValue::String(self.string_const(chunk, c)?);
                let obj = self.pop()?.into_scalar();
                let value = self.peek(instr.get_a_usize())?.tuple_get(b);
                return self.newindex_into(obj, key, value, ctx);
            }

            // ============ Control flow ============
            OpCode::Jump => self.jump(frame_idx, a),
            OpCode::Jf => {
                if !self.pop()?.cast_to_bool() {
                    self.jump(frame_idx, a);
                }
            }
            OpCode::JtOrPop => {
                if self.peek(0)?.cast_to_bool() {
                    self.jump(frame_idx, a);
                } else {
                    self.pop()?;
                }
            }
            OpCode::JfOrPop => {
                if !self.peek(0)?.cast_to_bool() {
                    self.jump(frame_idx, a);
                } else {
                    self.pop()?;
                }
            }
            OpCode::JNil => {
                if self.pop()?.to_scalar().is_nil() {
                    self.jump(frame_idx, a);
                }
            }
            OpCode::JFor => {
                if self.for_loop_done()? {
                    self.jump(frame_idx, a);
                }
            }
            OpCode::ToNum => self.op_to_num(a)?,
            OpCode::Incr => self.op_incr(instr.get_a_usize())?,

            // ============ Calls ============
            OpCode::Call => {
                return self.exec_call(
                    instr.get_a_usize(),
                    call_flags::NONE,
                    FrameHandlers::default(),
                    ctx,
                );
            }
            OpCode::ThisCall => {
                return self.exec_call(
                    instr.get_a_usize(),
                    call_flags::METHOD_CALL,
                    FrameHandlers::default(),
                    ctx,
                );
            }
            OpCode::Ret => return self.op_ret(a != 0, ctx),
            OpCode::BeginFn => self.op_begin_fn(frame_idx, instr.get_a_usize())?,
            OpCode::Args => self.op_args(chunk, frame_idx, instr.get_a_usize())?,
            OpCode::Closure => self.op_closure(chunk, closure, frame_idx, instr.get_a_usize())?,
            OpCode::Clean => self.op_clean(frame_idx, instr.get_a_usize(), b)?,

            // ============ Generic for ============
            OpCode::IterPrep => self.op_iter_prep()?,
            OpCode::IterUpd => self.op_iter_upd()?,
        }
        Ok(Flow::Next)
    }

    #[inline(always)]
    fn jump(&mut self, frame_idx: usize, target: i32) {
        self.thread.frames[frame_idx].pc = target.max(0) as usize;
    }

    #[inline]
    fn string_const(&self, chunk: &Chunk, index: usize) -> LuaResult<smol_str::SmolStr> {
        chunk
            .strings
            .get(index)
            .cloned()
            .ok_or_else(|| LuaError::internal(format!("string constant {} out of range", index)))
    }

    /// Drop every frame above `target_depth` after an error that handlers
    /// cannot see, leaving the stack as the entry frame's caller left it.
    pub(crate) fn abandon_frames(&mut self, target_depth: usize) {
        let mut truncate_to = None;
        while self.thread.frames.len() > target_depth {
            let Some(mut frame) = self.thread.frames.pop() else {
                break;
            };
            self.close_frame_upvalues(&mut frame);
            truncate_to = Some(frame.args_base.saturating_sub(1));
        }
        if let Some(len) = truncate_to {
            self.thread.stack.truncate(len);
        }
    }
}

/// Normalize a value list: every value but the last is reduced to a
/// scalar, the last one is expanded in place.
pub(crate) fn expand_values(values: Vec<LuaValue>) -> Vec<LuaValue> {
    let n = values.len();
    let mut out = Vec::with_capacity(n);
    for (i, value) in values.into_iter().enumerate() {
        if i + 1 == n {
            out.extend(value.into_multi());
        } else {
            out.push(value.into_scalar());
        }
    }
    out
}
