// Coroutine library
// Implements: create, resume, yield, status, running, wrap, isyieldable

use std::rc::Rc;

use crate::lib_registry::{LibraryModule, get_arg, type_error};
use crate::lua_value::{CoroutineStatus, LuaCoroutine, LuaValue};
use crate::lua_vm::{CoroutineResult, LuaError, LuaResult, LuaVM, RuntimeErrorKind};

const AWAIT_OUTSIDE_ASYNC: &str = "attempt to await outside an async thread";

pub fn create_coroutine_lib() -> LibraryModule {
    crate::lib_module!("coroutine", {
        "create" => coroutine_create,
        "resume" => coroutine_resume,
        "yield" => coroutine_yield,
        "status" => coroutine_status,
        "running" => coroutine_running,
        "wrap" => coroutine_wrap,
        "isyieldable" => coroutine_isyieldable,
    })
}

fn thread_arg(args: &[LuaValue], func_name: &str) -> LuaResult<Rc<LuaCoroutine>> {
    let value = get_arg(args, 1);
    match value.as_thread() {
        Some(co) => Ok(co.clone()),
        None => Err(type_error(1, func_name, "coroutine", &value)),
    }
}

/// coroutine.create(f) - Create a new coroutine
fn coroutine_create(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let func = get_arg(&args, 1);
    let co = vm.create_coroutine(func)?;
    Ok(LuaValue::Thread(co))
}

/// coroutine.resume(co, ...) - true plus the yielded or returned values,
/// or false plus the error
fn coroutine_resume(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let co = thread_arg(&args, "resume")?;
    let resume_args = args.into_iter().skip(1).collect();

    let values = match vm.resume(&co, resume_args) {
        Ok(CoroutineResult::Returned(value) | CoroutineResult::Yielded(value)) => {
            value.into_multi()
        }
        Ok(CoroutineResult::ForcedYield) => Vec::new(),
        Ok(CoroutineResult::Awaiting(_)) => {
            return Ok(LuaValue::tuple(vec![
                LuaValue::Boolean(false),
                LuaValue::string(AWAIT_OUTSIDE_ASYNC),
            ]));
        }
        Err(LuaError::Runtime(error)) => {
            return Ok(LuaValue::tuple(vec![LuaValue::Boolean(false), error.handler_value()]));
        }
        Err(e) => return Err(e),
    };

    let mut results = Vec::with_capacity(values.len() + 1);
    results.push(LuaValue::Boolean(true));
    results.extend(values);
    Ok(LuaValue::tuple(results))
}

/// coroutine.yield(...) - Suspend the running coroutine
fn coroutine_yield(_vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    Ok(LuaValue::yield_request(args))
}

/// coroutine.status(co) - "suspended", "running", "normal" or "dead"
fn coroutine_status(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let co = thread_arg(&args, "status")?;
    let status = if co.status() == CoroutineStatus::Running && vm.is_resuming(&co) {
        "normal"
    } else {
        co.status().as_str()
    };
    Ok(LuaValue::string(status))
}

/// coroutine.running() - The running coroutine and false, or nil and true
/// on the main thread
fn coroutine_running(vm: &mut LuaVM, _args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let result = match vm.running_coroutine() {
        Some(co) => vec![LuaValue::Thread(co), LuaValue::Boolean(false)],
        None => vec![LuaValue::Nil, LuaValue::Boolean(true)],
    };
    Ok(LuaValue::tuple(result))
}

/// coroutine.wrap(f) - Function resuming a new coroutine on every call;
/// errors propagate to the caller
fn coroutine_wrap(vm: &mut LuaVM, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let func = get_arg(&args, 1);
    let co = vm.create_coroutine(func)?;
    Ok(LuaValue::host_function("wrap", move |vm, args| {
        match vm.resume(&co, args)? {
            CoroutineResult::Returned(value) | CoroutineResult::Yielded(value) => {
                Ok(LuaValue::from_multi(value.into_multi()))
            }
            CoroutineResult::ForcedYield => Ok(LuaValue::Void),
            CoroutineResult::Awaiting(_) => Err(LuaError::runtime(
                RuntimeErrorKind::CoroutineState,
                AWAIT_OUTSIDE_ASYNC,
            )),
        }
    }))
}

/// coroutine.isyieldable() - Whether the running code can yield
fn coroutine_isyieldable(vm: &mut LuaVM, _args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    Ok(LuaValue::Boolean(vm.is_yieldable()))
}
