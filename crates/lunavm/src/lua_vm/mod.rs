// Lua Virtual Machine
// Executes chunk bytecode on a symbol-addressed value stack
pub mod async_thread;
mod call_info;
mod coroutine;
pub mod debug_info;
mod execute;
mod lua_error;
pub mod lua_limits;
mod opcode;
mod safe_option;

use std::cell::Cell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use smol_str::SmolStr;
use tracing::debug;

use crate::lua_value::{
    Chunk, LuaClosure, LuaCoroutine, LuaTable, LuaUpvalue, LuaValue, ScriptId, TableRef, ThreadId,
    ThreadState, chunk_serializer,
};
use crate::stdlib::Stdlib;

pub use call_info::{CallFlags, CallInfo, FrameHandlers, call_flags};
pub use coroutine::CoroutineResult;
pub use debug_info::{DebugEvent, DebugHook};
pub use execute::TmKind;
pub use lua_error::{ChunkLoadError, LuaError, LuaResult, RuntimeError, RuntimeErrorKind};
pub use opcode::{FieldUsage, Instruction, OpCode};
pub use safe_option::SafeOption;

/// Counters kept by the dispatch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub instructions: u64,
    pub tail_calls: u64,
    /// Deepest call stack seen on any thread.
    pub peak_call_depth: usize,
}

pub struct LuaVM {
    script_id: ScriptId,

    // Global environment table (`_G`, and the default `_ENV` of loaded chunks)
    pub(crate) globals: TableRef,

    // Metatable shared by every string value
    pub(crate) string_metatable: Option<TableRef>,

    // Thread currently executing; other threads' states are parked either
    // in `resume_chain` (resumers) or inside their coroutine handle
    pub(crate) thread: ThreadState,
    pub(crate) resume_chain: Vec<ThreadState>,
    pub(crate) running: Vec<Rc<LuaCoroutine>>,
    // Host call depth at which each running coroutine was entered
    pub(crate) resume_depths: Vec<usize>,
    pub(crate) coroutines: AHashMap<ThreadId, Weak<LuaCoroutine>>,
    next_thread_id: Cell<u32>,

    pub(crate) safe_option: SafeOption,
    pub(crate) host_call_depth: usize,
    pub(crate) stats: ExecStats,
    pub(crate) debug_hook: Option<DebugHook>,

    // Builtin `next`, used by `IterPrep` when iterating a plain table
    pub(crate) next_function: LuaValue,
}

impl LuaVM {
    pub fn new(safe_option: SafeOption) -> Self {
        let script_id = ScriptId::next();
        let globals = Rc::new(std::cell::RefCell::new(LuaTable::new(
            Some(script_id),
            safe_option.index_base,
        )));
        LuaVM {
            script_id,
            globals,
            string_metatable: None,
            thread: ThreadState::new(ThreadId::MAIN),
            resume_chain: Vec::new(),
            running: Vec::new(),
            resume_depths: Vec::new(),
            coroutines: AHashMap::new(),
            next_thread_id: Cell::new(1),
            safe_option,
            host_call_depth: 0,
            stats: ExecStats::default(),
            debug_hook: None,
            next_function: LuaValue::host_function("next", crate::stdlib::basic::lua_next),
        }
    }

    pub fn open_stdlib(&mut self, lib: Stdlib) -> LuaResult<()> {
        crate::lib_registry::create_standard_registry(lib).load_all(self)
    }

    #[inline(always)]
    pub fn script_id(&self) -> ScriptId {
        self.script_id
    }

    pub fn safe_option(&self) -> &SafeOption {
        &self.safe_option
    }

    pub fn globals(&self) -> TableRef {
        self.globals.clone()
    }

    pub fn get_global(&self, name: &str) -> LuaValue {
        self.globals.borrow().get_str(name)
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) -> LuaResult<()> {
        self.globals.borrow_mut().set_str(name, value)?;
        Ok(())
    }

    /// Fresh table owned by this VM.
    pub fn new_table(&self) -> TableRef {
        Rc::new(std::cell::RefCell::new(LuaTable::new(
            Some(self.script_id),
            self.safe_option.index_base,
        )))
    }

    pub fn create_table(&self) -> LuaValue {
        LuaValue::Table(self.new_table())
    }

    /// Table pre-filled with `values` at consecutive integer keys.
    pub fn create_array(&self, values: Vec<LuaValue>) -> LuaResult<LuaValue> {
        let table = self.new_table();
        {
            let mut t = table.borrow_mut();
            for value in values {
                t.append(value)?;
            }
        }
        Ok(LuaValue::Table(table))
    }

    pub fn create_function(
        &self,
        name: &str,
        func: impl Fn(&mut LuaVM, Vec<LuaValue>) -> LuaResult<LuaValue> + 'static,
    ) -> LuaValue {
        LuaValue::host_function(name, func)
    }

    /// Bind a host function to a global name.
    pub fn register_function(
        &mut self,
        name: &str,
        func: impl Fn(&mut LuaVM, Vec<LuaValue>) -> LuaResult<LuaValue> + 'static,
    ) -> LuaResult<()> {
        let value = self.create_function(name, func);
        self.set_global(name, value)
    }

    pub fn string_metatable(&self) -> Option<TableRef> {
        self.string_metatable.clone()
    }

    pub fn set_string_metatable(&mut self, metatable: Option<TableRef>) {
        self.string_metatable = metatable;
    }

    // ============ Loading ============

    /// Instantiate a top-level chunk. An upvalue named `_ENV` is bound to
    /// the globals table, any other root upvalue starts out nil.
    pub fn load(&self, chunk: Rc<Chunk>) -> LuaValue {
        let upvalues = chunk
            .upvalue_descs
            .iter()
            .map(|desc| {
                if desc.name == "_ENV" {
                    LuaUpvalue::new_closed(LuaValue::Table(self.globals.clone()))
                } else {
                    LuaUpvalue::new_closed(LuaValue::Nil)
                }
            })
            .collect();
        debug!(chunk = %chunk.name, "chunk loaded");
        LuaValue::Function(Rc::new(LuaClosure::new(chunk, upvalues)))
    }

    /// Decode a dumped chunk and instantiate it.
    pub fn load_binary(&self, bytes: &[u8]) -> LuaResult<LuaValue> {
        let chunk = chunk_serializer::load_chunk(bytes)?;
        Ok(self.load(Rc::new(chunk)))
    }

    /// Serialize the prototype of a script function.
    pub fn dump_function(&self, function: &LuaValue) -> LuaResult<Vec<u8>> {
        match function {
            LuaValue::Function(closure) => Ok(chunk_serializer::dump_chunk(closure.chunk())),
            other => Err(LuaError::runtime(
                RuntimeErrorKind::BadArgument,
                format!("unable to dump given function (a {} value)", other.type_name()),
            )),
        }
    }

    /// Load and run a chunk on the current thread.
    pub fn execute_chunk(&mut self, chunk: Rc<Chunk>) -> LuaResult<LuaValue> {
        let function = self.load(chunk);
        self.call(function, Vec::new())
    }

    // ============ Threads ============

    pub(crate) fn allocate_thread_id(&self) -> ThreadId {
        let id = self.next_thread_id.get();
        self.next_thread_id.set(id.wrapping_add(1).max(1));
        ThreadId(id)
    }

    /// Id of the thread currently executing.
    pub fn current_thread(&self) -> ThreadId {
        self.thread.id
    }

    /// Coroutine currently running, `None` on the main thread.
    pub fn running_coroutine(&self) -> Option<Rc<LuaCoroutine>> {
        self.running.last().cloned()
    }

    /// True if the coroutine is suspended in the middle of a resume chain
    /// (it resumed another coroutine).
    pub fn is_resuming(&self, co: &LuaCoroutine) -> bool {
        let n = self.running.len();
        n > 1 && self.running[..n - 1].iter().any(|c| c.id() == co.id())
    }

    /// True when a yield would suspend a coroutine: one is running and no
    /// host call sits between it and the current code.
    pub fn is_yieldable(&self) -> bool {
        self.resume_depths.last() == Some(&self.host_call_depth)
    }

    pub fn call_depth(&self) -> usize {
        self.thread.frames.len()
    }

    pub fn stats(&self) -> &ExecStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ExecStats::default();
    }

    // ============ Conversions ============

    /// `tostring` semantics: `__tostring` first, then the default rendering.
    pub fn tostring(&mut self, value: &LuaValue) -> LuaResult<SmolStr> {
        if let Some(handler) = self.get_metamethod(value, TmKind::ToString) {
            let result = self.call(handler, vec![value.clone()])?.into_scalar();
            return match result {
                LuaValue::String(s) => Ok(s),
                LuaValue::Number(_) => Ok(result.cast_to_string().unwrap_or_default()),
                _ => Err(LuaError::runtime(
                    RuntimeErrorKind::BadArgument,
                    "'__tostring' must return a string",
                )),
            };
        }
        Ok(match value.to_scalar() {
            LuaValue::String(s) => s,
            other => SmolStr::from(other.to_string()),
        })
    }
}

impl Default for LuaVM {
    fn default() -> Self {
        LuaVM::new(SafeOption::default())
    }
}
