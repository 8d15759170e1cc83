// Calls, returns and host-function results
//
// A call pushes a frame and reloads the loop; a host function runs inline
// and its result goes through `dispatch_result`, which turns the three
// request values into a call, a yield or an await.

use std::rc::Rc;

use tracing::{debug, trace};

use super::{ExecContext, ExecOutcome, Flow, TmKind};
use crate::lua_value::{HostFunction, LuaClosure, LuaValue, TailCallData, YieldKind};
use crate::lua_vm::lua_limits::MAX_CALL_CHAIN;
use crate::lua_vm::{
    CallFlags, CallInfo, FrameHandlers, LuaError, LuaResult, LuaVM, OpCode, RuntimeErrorKind,
    call_flags,
};

impl LuaVM {
    // ============ Host entry ============

    /// Call `func` from host code and wait for its result.
    ///
    /// Runs a nested dispatch loop on the current thread; a script yield
    /// inside it is an error.
    pub fn call(&mut self, func: LuaValue, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
        self.call_guarded(func, args, FrameHandlers::default())
    }

    /// Nested call with handlers installed on the callee frame.
    pub(crate) fn call_guarded(
        &mut self,
        func: LuaValue,
        args: Vec<LuaValue>,
        handlers: FrameHandlers,
    ) -> LuaResult<LuaValue> {
        if self.host_call_depth >= self.safe_option.max_host_call_depth {
            return Err(LuaError::runtime(
                RuntimeErrorKind::StackOverflow,
                "stack overflow (too many nested host calls)",
            ));
        }
        self.host_call_depth += 1;
        let result = self.call_nested(func, args, handlers);
        self.host_call_depth -= 1;
        result
    }

    fn call_nested(
        &mut self,
        func: LuaValue,
        args: Vec<LuaValue>,
        handlers: FrameHandlers,
    ) -> LuaResult<LuaValue> {
        let depth = self.thread.frames.len();
        let mark = self.thread.stack.len();
        let ctx = ExecContext::nested(depth);

        let argc = args.len();
        self.push(func);
        self.thread.stack.extend(args);
        let outcome = match self.exec_call(argc, call_flags::ENTRY_POINT, handlers, ctx) {
            Ok(Flow::Reload) if self.thread.frames.len() > depth => self.execute(ctx),
            Ok(Flow::Exit(outcome)) => Ok(outcome),
            Ok(_) => self.pop().map(ExecOutcome::Returned),
            Err(e) => Err(e),
        };
        self.thread.stack.truncate(mark);
        match outcome? {
            ExecOutcome::Returned(value) => Ok(value),
            _ => Err(LuaError::internal("host call suspended")),
        }
    }

    /// Run a request value returned by a host function that was itself
    /// called outside the loop, until it produces a plain value.
    pub(crate) fn resolve_request(&mut self, value: LuaValue) -> LuaResult<LuaValue> {
        match value {
            LuaValue::TailCallRequest(data) => {
                let handlers = handlers_of(&data);
                self.call_guarded(data.function.clone(), data.args.clone(), handlers)
            }
            LuaValue::YieldRequest(_) | LuaValue::AwaitRequest(_) => Err(self.yield_error()),
            other => Ok(other),
        }
    }

    // ============ Calls ============

    /// Call the value sitting below the `argc` values on top of the stack.
    ///
    /// Non-callable values are replaced by their `__call` handler, the
    /// original value becoming the first argument.
    pub(crate) fn exec_call(
        &mut self,
        argc: usize,
        flags: CallFlags,
        handlers: FrameHandlers,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        let len = self.thread.stack.len();
        if argc >= len {
            return Err(LuaError::internal("call without a callee on the stack"));
        }
        let func_idx = len - argc - 1;
        let mut chain = 0;
        loop {
            match self.thread.stack[func_idx].clone() {
                LuaValue::Function(closure) => {
                    return self.call_closure(closure, func_idx, flags, handlers, ctx);
                }
                LuaValue::HostFunction(host) => {
                    return self.call_host(host, func_idx, flags, handlers, ctx);
                }
                other => {
                    let Some(handler) = self.get_metamethod(&other, TmKind::Call) else {
                        return Err(LuaError::runtime(
                            RuntimeErrorKind::NotCallable,
                            format!("attempt to call a {} value", other.type_name()),
                        ));
                    };
                    chain += 1;
                    if chain > MAX_CALL_CHAIN {
                        return Err(LuaError::runtime(
                            RuntimeErrorKind::NotCallable,
                            "'__call' chain too long",
                        ));
                    }
                    self.thread.stack.insert(func_idx, handler);
                }
            }
        }
    }

    fn call_closure(
        &mut self,
        closure: Rc<LuaClosure>,
        mut func_idx: usize,
        mut flags: CallFlags,
        handlers: FrameHandlers,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        let argc = self.normalize_args(func_idx + 1);
        let mut return_address = self.thread.frames.last().map_or(0, |f| f.pc);

        if self.should_elide_caller(&handlers, flags, ctx) {
            if let Some(mut caller) = self.thread.frames.pop() {
                self.close_frame_upvalues(&mut caller);
                let dest = caller.args_base - 1;
                self.thread.stack.drain(dest..func_idx);
                func_idx = dest;
                return_address = caller.return_address;
                flags |= call_flags::TAIL_CALL;
                self.stats.tail_calls += 1;
                trace!(callee = %closure.name(), replaced = %caller.closure.name(), "tail call");
            }
        }

        let depth = self.thread.frames.len() + 1;
        if depth > self.safe_option.max_call_depth
            || self.thread.stack.len() > self.safe_option.max_stack_size
        {
            return Err(LuaError::runtime(
                RuntimeErrorKind::StackOverflow,
                "stack overflow",
            ));
        }
        self.thread.frames.push(CallInfo::new(
            closure,
            func_idx + 1,
            argc,
            return_address,
            flags,
            handlers,
        ));
        if depth > self.stats.peak_call_depth {
            self.stats.peak_call_depth = depth;
        }
        Ok(Flow::Reload)
    }

    /// A call replaces its caller when the call stack is deep, the caller
    /// would return the callee's result unchanged (`Ret 1` next), and
    /// neither frame needs to observe the result or errors.
    fn should_elide_caller(&self, handlers: &FrameHandlers, flags: CallFlags, ctx: ExecContext) -> bool {
        if !handlers.is_empty() || flags & call_flags::INHERITED != 0 {
            return false;
        }
        let frames = self.thread.frames.len();
        if frames <= ctx.target_depth + 1 {
            return false;
        }
        let Some(caller) = self.thread.frames.last() else {
            return false;
        };
        if caller.blocks_tail_call() {
            return false;
        }
        let deep = frames > self.safe_option.tail_call_threshold
            || self.thread.stack.len() > self.safe_option.tail_call_value_threshold;
        if !deep {
            return false;
        }
        matches!(
            caller.closure.chunk().code.get(caller.pc),
            Some(next) if next.get_opcode() == Some(OpCode::Ret) && next.get_a() == 1
        )
    }

    fn call_host(
        &mut self,
        host: Rc<HostFunction>,
        func_idx: usize,
        flags: CallFlags,
        handlers: FrameHandlers,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        self.normalize_args(func_idx + 1);
        let args = self.thread.stack.split_off(func_idx + 1);
        self.thread.stack.truncate(func_idx);
        trace!(name = %host.name, argc = args.len(), "host call");
        let result = if handlers.is_empty() {
            (host.func)(self, args)?
        } else {
            self.invoke_guarded(&host, args, &handlers, ctx)?
        };
        self.dispatch_result(result, flags, ctx)
    }

    /// Host function called with handlers (e.g. `pcall(print, ...)`): no
    /// frame exists to carry them, so they are applied here.
    fn invoke_guarded(
        &mut self,
        host: &HostFunction,
        args: Vec<LuaValue>,
        handlers: &FrameHandlers,
        ctx: ExecContext,
    ) -> LuaResult<LuaValue> {
        let mark = self.thread.stack.len();
        let result = (host.func)(self, args).and_then(|value| {
            if value.is_request() {
                self.resolve_request(value)
            } else {
                Ok(value)
            }
        });
        match result {
            Ok(value) => match &handlers.continuation {
                Some(continuation) => continuation(self, value),
                None => Ok(value),
            },
            Err(LuaError::Runtime(mut error)) => {
                self.thread.stack.truncate(mark);
                self.decorate_error(&mut error);
                if let Some(msgh) = &handlers.pre_unwind {
                    self.apply_message_handler(msgh, &mut error)?;
                }
                if handlers.error_handler.is_some() {
                    self.run_pre_unwind(ctx.target_depth, &mut error)?;
                }
                match &handlers.error_handler {
                    Some(handler) => handler(self, error.handler_value()),
                    None => Err(LuaError::Runtime(error)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Scalarize every argument above `first` but the last, expand the
    /// last. Returns the resulting argument count.
    fn normalize_args(&mut self, first: usize) -> usize {
        let stack = &mut self.thread.stack;
        let needs_expansion = stack[first..]
            .iter()
            .any(|v| matches!(v, LuaValue::Tuple(_) | LuaValue::Void));
        if needs_expansion {
            let args = stack.split_off(first);
            stack.extend(super::expand_values(args));
        }
        stack.len() - first
    }

    // ============ Results ============

    /// Deliver a host result to the caller. Requests are acted upon here.
    pub(crate) fn dispatch_result(
        &mut self,
        value: LuaValue,
        flags: CallFlags,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        match value {
            LuaValue::TailCallRequest(data) => {
                let argc = data.args.len();
                self.push(data.function.clone());
                self.thread.stack.extend(data.args.iter().cloned());
                self.exec_call(argc, flags & call_flags::INHERITED, handlers_of(&data), ctx)
            }
            LuaValue::YieldRequest(request) => {
                let payload = LuaValue::tuple(request.values.clone());
                self.suspend(flags, ctx)?;
                Ok(Flow::Exit(ExecOutcome::Yielded(payload)))
            }
            LuaValue::AwaitRequest(request) => {
                self.suspend(flags, ctx)?;
                Ok(Flow::Exit(ExecOutcome::Awaiting(request)))
            }
            value => {
                self.push_result(value, flags);
                Ok(Flow::Next)
            }
        }
    }

    /// Push a call result, applying the caller's result transform.
    pub(crate) fn push_result(&mut self, value: LuaValue, flags: CallFlags) {
        if flags & call_flags::DISCARD_RESULT != 0 {
            return;
        }
        if flags & call_flags::NEGATE_RESULT != 0 {
            self.push(LuaValue::Boolean(!value.cast_to_bool()));
        } else if flags & call_flags::TO_BOOL != 0 {
            self.push(LuaValue::Boolean(value.cast_to_bool()));
        } else if flags & call_flags::METHOD_LOOKUP != 0 {
            let obj = self.thread.stack.pop().unwrap_or_default();
            self.push(value.into_scalar());
            self.push(obj);
        } else {
            self.push(value);
        }
    }

    fn suspend(&mut self, flags: CallFlags, ctx: ExecContext) -> LuaResult<()> {
        if self.running.is_empty() {
            return Err(LuaError::runtime(
                RuntimeErrorKind::CannotYieldMain,
                "attempt to yield from outside a coroutine",
            ));
        }
        if !ctx.can_yield {
            return Err(self.yield_error());
        }
        self.thread.pending = Some(YieldKind::Call);
        self.thread.resume_flags = flags & call_flags::INHERITED;
        debug!(thread = self.thread.id.as_u32(), "suspend");
        Ok(())
    }

    pub(crate) fn yield_error(&self) -> LuaError {
        if self.running.is_empty() {
            LuaError::runtime(
                RuntimeErrorKind::CannotYieldMain,
                "attempt to yield from outside a coroutine",
            )
        } else {
            LuaError::runtime(
                RuntimeErrorKind::YieldAcrossHostBoundary,
                "attempt to yield across a host-call boundary",
            )
        }
    }

    // ============ Returns ============

    pub(super) fn op_ret(&mut self, has_value: bool, ctx: ExecContext) -> LuaResult<Flow> {
        let value = if has_value { self.pop()? } else { LuaValue::Void };
        let Some(mut frame) = self.thread.frames.pop() else {
            return Err(LuaError::internal("return without a frame"));
        };
        self.close_frame_upvalues(&mut frame);
        self.thread.stack.truncate(frame.args_base - 1);
        trace!(function = %frame.closure.name(), depth = self.thread.frames.len(), "return");
        self.finish_frame(frame, value, ctx)
    }

    /// Route a popped frame's result to its caller (or out of the loop).
    pub(super) fn finish_frame(
        &mut self,
        frame: CallInfo,
        value: LuaValue,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        let value = match &frame.handlers.continuation {
            Some(continuation) => continuation(self, value)?,
            None => value,
        };
        if frame.is_entry_point() {
            if !value.is_request() {
                return Ok(Flow::Exit(ExecOutcome::Returned(value)));
            }
            return match self.dispatch_result(value, call_flags::ENTRY_POINT, ctx)? {
                Flow::Next => Ok(Flow::Exit(ExecOutcome::Returned(self.pop()?))),
                other => Ok(other),
            };
        }
        if let Some(caller) = self.thread.frames.last_mut() {
            caller.pc = frame.return_address;
        }
        match self.dispatch_result(value, frame.call_status & call_flags::RESULT_TRANSFORMS, ctx)? {
            Flow::Next => Ok(Flow::Reload),
            other => Ok(other),
        }
    }
}

pub(crate) fn handlers_of(data: &TailCallData) -> FrameHandlers {
    FrameHandlers {
        continuation: data.continuation.clone(),
        error_handler: data.error_handler.clone(),
        pre_unwind: data.pre_unwind.clone(),
    }
}
