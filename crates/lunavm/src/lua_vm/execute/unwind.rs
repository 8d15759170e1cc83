// Error unwinding
//
// Pre-unwind handlers of every frame run first, top to bottom, while the
// faulting frames are still on the stack. Frames are then popped until one
// carries an error handler or the entry frame is reached.

use tracing::debug;

use super::{ExecContext, ExecOutcome, Flow};
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, RuntimeError, call_flags};

impl LuaVM {
    /// Unwind after `error`. `Some` ends the loop, `None` resumes it at the
    /// frame that caught the error; `Err` means nothing caught it.
    pub(super) fn unwind(
        &mut self,
        mut error: Box<RuntimeError>,
        ctx: ExecContext,
    ) -> LuaResult<Option<ExecOutcome>> {
        self.decorate_error(&mut error);
        debug!(error = %error, depth = self.thread.frames.len(), "unwinding");

        self.run_pre_unwind(ctx.target_depth, &mut error)?;

        while self.thread.frames.len() > ctx.target_depth {
            let Some(mut frame) = self.thread.frames.pop() else {
                break;
            };
            self.close_frame_upvalues(&mut frame);
            self.thread.stack.truncate(frame.args_base.saturating_sub(1));

            let Some(handler) = frame.handlers.error_handler.clone() else {
                if frame.is_entry_point() {
                    break;
                }
                continue;
            };
            debug!(function = %frame.closure.name(), "error caught");
            let handled = match handler(self, error.handler_value()) {
                Ok(value) => value,
                Err(LuaError::Runtime(next)) => {
                    error = next;
                    self.decorate_error(&mut error);
                    if frame.is_entry_point() {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if frame.is_entry_point() {
                let value = if handled.is_request() {
                    self.resolve_request(handled)?
                } else {
                    handled
                };
                return Ok(Some(ExecOutcome::Returned(value)));
            }
            if let Some(caller) = self.thread.frames.last_mut() {
                caller.pc = frame.return_address;
            }
            let flags = frame.call_status & call_flags::RESULT_TRANSFORMS;
            return match self.dispatch_result(handled, flags, ctx)? {
                Flow::Exit(outcome) => Ok(Some(outcome)),
                Flow::Next | Flow::Reload => Ok(None),
            };
        }
        Err(LuaError::Runtime(error))
    }

    /// Give every frame above `target_depth` with a pre-unwind handler,
    /// topmost first, the error before any frame is popped.
    pub(crate) fn run_pre_unwind(
        &mut self,
        target_depth: usize,
        error: &mut RuntimeError,
    ) -> LuaResult<()> {
        let start = target_depth.min(self.thread.frames.len());
        let message_handlers: Vec<LuaValue> = self.thread.frames[start..]
            .iter()
            .rev()
            .filter_map(|f| f.handlers.pre_unwind.clone())
            .collect();
        for msgh in &message_handlers {
            self.apply_message_handler(msgh, error)?;
        }
        Ok(())
    }

    /// Prefix string errors with the location of the faulting instruction.
    pub(crate) fn decorate_error(&self, error: &mut RuntimeError) {
        if error.decorated.is_some() || error.value.is_some() {
            return;
        }
        let Some(frame) = self.thread.frames.last() else {
            return;
        };
        let pc = frame.pc.saturating_sub(1);
        if let Some(location) = frame.closure.chunk().location(pc) {
            error.decorated = Some(format!("{}: {}", location, error.message));
        }
    }

    /// Run a pre-unwind handler (the `xpcall` message handler) over the
    /// error value and store what it returns.
    pub(crate) fn apply_message_handler(
        &mut self,
        msgh: &LuaValue,
        error: &mut RuntimeError,
    ) -> LuaResult<()> {
        match self.call(msgh.clone(), vec![error.handler_value()]) {
            Ok(result) => {
                match result.into_scalar() {
                    LuaValue::String(s) => {
                        error.decorated = Some(s.to_string());
                        error.value = None;
                    }
                    other => {
                        error.decorated = Some(other.to_string());
                        error.value = Some(other);
                    }
                }
                Ok(())
            }
            Err(LuaError::Runtime(_)) => {
                error.decorated = Some("error in error handling".to_string());
                error.value = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
