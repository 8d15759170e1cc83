// Coroutine scheduler
//
// A resume swaps the coroutine's saved ThreadState into the VM, runs the
// loop on it and swaps it back out. The resumer's state waits on
// `resume_chain` meanwhile.

use std::rc::{Rc, Weak};

use tracing::debug;

use super::execute::{ExecContext, ExecOutcome, Flow};
use crate::lua_value::{AwaitRequest, CoroutineStatus, LuaCoroutine, LuaValue, YieldKind};
use crate::lua_vm::{FrameHandlers, LuaError, LuaResult, LuaVM, RuntimeErrorKind, call_flags};

/// How a resume slice ended.
pub enum CoroutineResult {
    /// The body returned; the coroutine is dead.
    Returned(LuaValue),
    /// `coroutine.yield` with these values (a tuple).
    Yielded(LuaValue),
    /// The instruction budget ran out.
    ForcedYield,
    /// The body is waiting on a host future.
    Awaiting(Rc<AwaitRequest>),
}

impl CoroutineResult {
    pub fn is_finished(&self) -> bool {
        matches!(self, CoroutineResult::Returned(_))
    }
}

impl From<ExecOutcome> for CoroutineResult {
    fn from(outcome: ExecOutcome) -> Self {
        match outcome {
            ExecOutcome::Returned(v) => CoroutineResult::Returned(v),
            ExecOutcome::Yielded(v) => CoroutineResult::Yielded(v),
            ExecOutcome::ForcedYield => CoroutineResult::ForcedYield,
            ExecOutcome::Awaiting(r) => CoroutineResult::Awaiting(r),
        }
    }
}

impl LuaVM {
    /// New suspended coroutine running `function`, with the VM's default
    /// instruction budget.
    pub fn create_coroutine(&mut self, function: LuaValue) -> LuaResult<Rc<LuaCoroutine>> {
        if !function.is_callable() && self.get_metamethod(&function, super::TmKind::Call).is_none() {
            return Err(LuaError::runtime(
                RuntimeErrorKind::BadArgument,
                format!(
                    "bad argument #1 to 'create' (function expected, got {})",
                    function.type_name()
                ),
            ));
        }
        let id = self.allocate_thread_id();
        let co = Rc::new(LuaCoroutine::new(
            id,
            function,
            self.safe_option.auto_yield_counter,
        ));
        self.coroutines.retain(|_, w| w.strong_count() > 0);
        self.coroutines.insert(id, Rc::downgrade(&co));
        debug!(thread = id.as_u32(), "coroutine created");
        Ok(co)
    }

    /// Coroutine handle for a thread id, while it is alive.
    pub fn find_coroutine(&self, id: crate::lua_value::ThreadId) -> Option<Rc<LuaCoroutine>> {
        self.coroutines.get(&id).and_then(Weak::upgrade)
    }

    /// Run `co` until it returns, yields or suspends. On first resume
    /// `args` are the body's arguments, afterwards they become the result
    /// of the call that suspended it.
    pub fn resume(&mut self, co: &Rc<LuaCoroutine>, args: Vec<LuaValue>) -> LuaResult<CoroutineResult> {
        let (state, first, function, auto_yield) = {
            let mut inner = co.inner.borrow_mut();
            match inner.status {
                CoroutineStatus::Dead => {
                    return Err(LuaError::runtime(
                        RuntimeErrorKind::CoroutineState,
                        "cannot resume dead coroutine",
                    ));
                }
                CoroutineStatus::Running => {
                    return Err(LuaError::runtime(
                        RuntimeErrorKind::CoroutineState,
                        "cannot resume non-suspended coroutine",
                    ));
                }
                CoroutineStatus::NotStarted | CoroutineStatus::Suspended => {}
            }
            let Some(state) = inner.state.take() else {
                return Err(LuaError::internal("suspended coroutine without a thread state"));
            };
            let first = inner.status == CoroutineStatus::NotStarted;
            inner.status = CoroutineStatus::Running;
            (state, first, inner.function.clone(), inner.auto_yield)
        };

        if self.host_call_depth >= self.safe_option.max_host_call_depth {
            let mut inner = co.inner.borrow_mut();
            inner.state = Some(state);
            inner.status = if first {
                CoroutineStatus::NotStarted
            } else {
                CoroutineStatus::Suspended
            };
            return Err(LuaError::runtime(
                RuntimeErrorKind::StackOverflow,
                "stack overflow (too many nested resumes)",
            ));
        }

        let resumer = std::mem::replace(&mut self.thread, state);
        self.resume_chain.push(resumer);
        self.running.push(co.clone());
        self.host_call_depth += 1;
        self.resume_depths.push(self.host_call_depth);
        debug!(thread = co.id().as_u32(), first, "resume");

        let result = self.run_coroutine(first, function, args, auto_yield);

        self.resume_depths.pop();
        self.host_call_depth -= 1;
        self.running.pop();
        let Some(resumer) = self.resume_chain.pop() else {
            return Err(LuaError::internal("resume chain underflow"));
        };
        let state = std::mem::replace(&mut self.thread, resumer);

        let finished = !matches!(
            result,
            Ok(CoroutineResult::Yielded(_) | CoroutineResult::ForcedYield | CoroutineResult::Awaiting(_))
        );
        {
            let mut inner = co.inner.borrow_mut();
            if finished {
                inner.status = CoroutineStatus::Dead;
                inner.state = None;
            } else {
                inner.status = CoroutineStatus::Suspended;
                inner.state = Some(state);
            }
        }
        if finished {
            self.coroutines.remove(&co.id());
        }
        debug!(thread = co.id().as_u32(), finished, ok = result.is_ok(), "resume finished");
        result
    }

    fn run_coroutine(
        &mut self,
        first: bool,
        function: LuaValue,
        args: Vec<LuaValue>,
        auto_yield: u64,
    ) -> LuaResult<CoroutineResult> {
        let ctx = ExecContext {
            target_depth: 0,
            can_yield: true,
            auto_yield,
        };
        let flow = if first {
            let argc = args.len();
            self.push(function);
            self.thread.stack.extend(args);
            self.exec_call(argc, call_flags::ENTRY_POINT, FrameHandlers::default(), ctx)?
        } else {
            match self.thread.pending.take() {
                Some(YieldKind::Call) => {
                    let flags = std::mem::take(&mut self.thread.resume_flags);
                    self.push_result(LuaValue::from_multi(args), flags);
                    Flow::Reload
                }
                Some(YieldKind::Forced) => Flow::Reload,
                None => return Err(LuaError::internal("resumed a thread that never suspended")),
            }
        };
        let outcome = match flow {
            Flow::Exit(outcome) => outcome,
            _ if self.thread.frames.is_empty() => ExecOutcome::Returned(self.pop()?),
            _ => self.execute(ctx)?,
        };
        Ok(outcome.into())
    }
}
