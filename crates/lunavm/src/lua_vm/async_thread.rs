//! Async support: bridge coroutines to Rust futures.
//!
//! An async host function is registered as an ordinary host function that
//! returns an `AwaitRequest` wrapping its future. The loop treats that value
//! like a yield, so the coroutine running the script suspends with
//! `CoroutineResult::Awaiting`. `AsyncThread` implements `Future` and drives
//! the coroutine:
//!
//! ```text
//! async runtime
//!   └── AsyncThread::poll()
//!         ├── pending future? → poll it
//!         │     ├── Pending → Poll::Pending
//!         │     └── Ready(value) → resume(value) → check again
//!         └── resume(args)
//!               ├── returned → Poll::Ready
//!               ├── awaiting → take the future, poll it
//!               └── plain or forced yield → wake & Poll::Pending
//! ```
//!
//! From the script's point of view the async function is a normal call.
//! The futures are not `Send`; run them on a current-thread runtime or a
//! `LocalSet`.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tracing::debug;

use super::CoroutineResult;
use crate::lua_value::{AsyncFuture, Chunk, LuaCoroutine, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Future driving one coroutine to completion.
pub struct AsyncThread<'vm> {
    vm: &'vm mut LuaVM,
    co: Rc<LuaCoroutine>,
    pending: Option<AsyncFuture>,
    resume_args: Option<Vec<LuaValue>>,
}

impl<'vm> AsyncThread<'vm> {
    pub fn coroutine(&self) -> &Rc<LuaCoroutine> {
        &self.co
    }
}

impl Future for AsyncThread<'_> {
    type Output = LuaResult<LuaValue>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(future) = this.pending.as_mut() {
                match future.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(value)) => {
                        this.pending = None;
                        this.resume_args = Some(value.into_multi());
                    }
                    Poll::Ready(Err(e)) => {
                        this.pending = None;
                        return Poll::Ready(Err(e));
                    }
                }
            }

            let args = this.resume_args.take().unwrap_or_default();
            match this.vm.resume(&this.co, args) {
                Ok(CoroutineResult::Returned(value)) => return Poll::Ready(Ok(value)),
                Ok(CoroutineResult::Awaiting(request)) => match request.take_future() {
                    Some(future) => {
                        debug!(thread = this.co.id().as_u32(), "awaiting host future");
                        this.pending = Some(future);
                    }
                    None => {
                        return Poll::Ready(Err(LuaError::internal(
                            "await request was already consumed",
                        )));
                    }
                },
                Ok(CoroutineResult::Yielded(_) | CoroutineResult::ForcedYield) => {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl LuaVM {
    /// Register an async host function as a global.
    ///
    /// Calling it from a script suspends the running coroutine until the
    /// future resolves; its value becomes the call's result.
    pub fn register_async<F, Fut>(&mut self, name: &str, f: F) -> LuaResult<()>
    where
        F: Fn(Vec<LuaValue>) -> Fut + 'static,
        Fut: Future<Output = LuaResult<LuaValue>> + 'static,
    {
        let function = self.create_async_function(name, f);
        self.set_global(name, function)
    }

    pub fn create_async_function<F, Fut>(&self, name: &str, f: F) -> LuaValue
    where
        F: Fn(Vec<LuaValue>) -> Fut + 'static,
        Fut: Future<Output = LuaResult<LuaValue>> + 'static,
    {
        LuaValue::host_function(name, move |_vm, args| {
            Ok(LuaValue::await_request(Box::pin(f(args))))
        })
    }

    /// Wrap `function` in a coroutine driven by the returned future.
    pub fn create_async_thread(
        &mut self,
        function: LuaValue,
        args: Vec<LuaValue>,
    ) -> LuaResult<AsyncThread<'_>> {
        let co = self.create_coroutine(function)?;
        Ok(AsyncThread {
            vm: self,
            co,
            pending: None,
            resume_args: Some(args),
        })
    }

    /// Run a chunk to completion, awaiting any async host functions it
    /// calls.
    pub async fn execute_chunk_async(&mut self, chunk: Rc<Chunk>) -> LuaResult<LuaValue> {
        let function = self.load(chunk);
        self.create_async_thread(function, Vec::new())?.await
    }

    pub async fn call_async(&mut self, function: LuaValue, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
        self.create_async_thread(function, args)?.await
    }
}
