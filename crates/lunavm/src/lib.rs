// Lunavm Runtime
// An embeddable stack-based bytecode VM with hybrid tables, closures,
// coroutines and metatable dispatch

#[cfg(test)]
mod test;

pub mod lib_registry;
pub mod lua_value;
pub mod lua_vm;
pub mod stdlib;

pub use lib_registry::LibraryRegistry;
pub use lua_value::{Chunk, ChunkBuilder, LuaTable, LuaValue, LuaValueKind};
pub use lua_vm::{
    CoroutineResult, Instruction, LuaError, LuaResult, LuaVM, OpCode, RuntimeErrorKind,
    SafeOption,
};
pub use stdlib::Stdlib;
