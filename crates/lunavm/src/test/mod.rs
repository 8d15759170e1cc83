pub mod test_basic;
pub mod test_closures;
pub mod test_error_handling;
pub mod test_metamethods;
pub mod test_tail_call;

use std::rc::Rc;

use crate::lua_value::{Chunk, ChunkBuilder, LuaValue};
use crate::lua_vm::{LuaResult, LuaVM, SafeOption};
use crate::stdlib::Stdlib;

/// VM with every standard library loaded.
pub fn new_vm() -> LuaVM {
    vm_with(SafeOption::default())
}

pub fn vm_with(option: SafeOption) -> LuaVM {
    let mut vm = LuaVM::new(option);
    vm.open_stdlib(Stdlib::All).unwrap();
    vm
}

/// Builder for a top-level script named "test".
pub fn script() -> ChunkBuilder {
    let mut b = ChunkBuilder::new("main");
    b.set_source_name("test");
    b
}

pub fn build(b: ChunkBuilder) -> Rc<Chunk> {
    Rc::new(b.build().unwrap())
}

pub fn run(vm: &mut LuaVM, b: ChunkBuilder) -> LuaResult<LuaValue> {
    vm.execute_chunk(build(b))
}

/// Call a global function from the host.
pub fn call_global(vm: &mut LuaVM, name: &str, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let func = vm.get_global(name);
    vm.call(func, args)
}

/// Call `lib.name` from the host.
pub fn call_lib(vm: &mut LuaVM, lib: &str, name: &str, args: Vec<LuaValue>) -> LuaResult<LuaValue> {
    let table = vm.get_global(lib);
    let func = vm.index(table, LuaValue::string(name))?;
    vm.call(func, args)
}

pub fn num(n: f64) -> LuaValue {
    LuaValue::number(n)
}

pub fn s(text: &str) -> LuaValue {
    LuaValue::string(text)
}
