// Value model: tagged values, hybrid tables, closures, coroutine handles
// and compiled chunks
pub mod chunk;
pub mod chunk_builder;
pub mod chunk_serializer;
mod lua_function;
mod lua_table;
mod lua_thread;
mod lua_userdata;
#[allow(clippy::module_inception)]
mod lua_value;

use std::cell::Cell;

pub use chunk::{Chunk, SourceRef, SymbolKind, SymbolRef, UpvalueDesc};
pub use chunk_builder::{ChunkBuilder, Label};
pub use lua_function::{CFunction, HostCallback, HostFunction, LuaClosure, LuaUpvalue, UpvalueState};
pub use lua_table::{LuaTable, TableError, TablePair, TableRef};
pub use lua_thread::{CoroutineStatus, LuaCoroutine, ThreadId, ThreadState, YieldKind};
pub use lua_userdata::LuaUserdata;
pub use lua_value::{
    AsyncFuture, AwaitRequest, LuaValue, LuaValueKind, TailCallData, YieldRequest, format_number,
    number_to_integer, parse_number,
};

pub(crate) use lua_thread::CoroutineInner;

/// Identity of the VM (script) that created a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(pub(crate) u32);

thread_local! {
    static NEXT_SCRIPT_ID: Cell<u32> = const { Cell::new(1) };
}

impl ScriptId {
    /// Fresh id; unique per OS thread, which is the only place a VM lives.
    pub fn next() -> Self {
        NEXT_SCRIPT_ID.with(|next| {
            let id = next.get();
            next.set(id.wrapping_add(1));
            ScriptId(id)
        })
    }
}
