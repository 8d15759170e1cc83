// Library registration system for the standard libraries
// Provides a clean way to register Rust functions as script libraries

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult, LuaVM, RuntimeErrorKind};
use crate::stdlib::{self, Stdlib};

/// Host function as stored in a library module.
pub type LibFunction = fn(&mut LuaVM, Vec<LuaValue>) -> LuaResult<LuaValue>;

/// Type for value initializers - functions that create values when the module loads
pub type ValueInitializer = fn(&mut LuaVM) -> LuaValue;

/// Entry in a library module - can be a function or a value
pub enum LibraryEntry {
    Function(LibFunction),
    Value(ValueInitializer),
}

/// A library module containing multiple functions and values
pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, LibraryEntry)>,
}

impl LibraryModule {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn with_function(mut self, name: &'static str, func: LibFunction) -> Self {
        self.entries.push((name, LibraryEntry::Function(func)));
        self
    }

    pub fn with_value(mut self, name: &'static str, value_init: ValueInitializer) -> Self {
        self.entries.push((name, LibraryEntry::Value(value_init)));
        self
    }
}

/// Builder for creating library modules with functions
#[macro_export]
macro_rules! lib_module {
    ($name:expr, {
        $($item_name:expr => $item:expr),* $(,)?
    }) => {{
        let mut module = $crate::lib_registry::LibraryModule::new($name);
        $(
            module.entries.push(($item_name, $crate::lib_registry::LibraryEntry::Function($item)));
        )*
        module
    }};
}

/// Registry for the standard libraries
pub struct LibraryRegistry {
    modules: Vec<LibraryModule>, // Vec preserves load order
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: LibraryModule) {
        self.modules.push(module);
    }

    /// Load all registered libraries into a VM
    pub fn load_all(&self, vm: &mut LuaVM) -> LuaResult<()> {
        for module in &self.modules {
            self.load_module(vm, module)?;
        }
        Ok(())
    }

    /// Load one module. `_G` entries become globals, any other module
    /// becomes a global table of its entries.
    pub fn load_module(&self, vm: &mut LuaVM, module: &LibraryModule) -> LuaResult<()> {
        if module.name == "_G" {
            for (name, entry) in &module.entries {
                let value = Self::entry_value(vm, name, entry);
                vm.set_global(name, value)?;
            }
            return Ok(());
        }

        let lib_table = vm.new_table();
        for (name, entry) in &module.entries {
            let value = Self::entry_value(vm, name, entry);
            lib_table.borrow_mut().set_str(name, value)?;
        }
        vm.set_global(module.name, LuaValue::Table(lib_table))
    }

    fn entry_value(vm: &mut LuaVM, name: &str, entry: &LibraryEntry) -> LuaValue {
        match entry {
            LibraryEntry::Function(func) => LuaValue::host_function(name, *func),
            LibraryEntry::Value(value_init) => value_init(vm),
        }
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry holding the requested standard libraries
pub fn create_standard_registry(lib: Stdlib) -> LibraryRegistry {
    let mut registry = LibraryRegistry::new();
    if matches!(lib, Stdlib::Basic | Stdlib::All) {
        registry.register(stdlib::basic::create_basic_lib());
    }
    if matches!(lib, Stdlib::Coroutine | Stdlib::All) {
        registry.register(stdlib::coroutine::create_coroutine_lib());
    }
    registry
}

// ============ Argument helpers ============

/// Argument `index` (1-based), nil when absent.
#[inline(always)]
pub fn get_arg(args: &[LuaValue], index: usize) -> LuaValue {
    args.get(index - 1).cloned().unwrap_or_default()
}

/// Argument `index` (1-based); an absent argument is an error.
pub fn require_arg(args: &[LuaValue], index: usize, func_name: &str) -> LuaResult<LuaValue> {
    args.get(index - 1)
        .cloned()
        .ok_or_else(|| bad_argument(index, func_name, "value expected"))
}

pub fn bad_argument(index: usize, func_name: &str, message: &str) -> LuaError {
    LuaError::runtime(
        RuntimeErrorKind::BadArgument,
        format!("bad argument #{} to '{}' ({})", index, func_name, message),
    )
}

/// "X expected, got Y" for argument `index`.
pub fn type_error(index: usize, func_name: &str, expected: &str, got: &LuaValue) -> LuaError {
    let got = if got.is_void() { "no value" } else { got.type_name() };
    bad_argument(index, func_name, &format!("{} expected, got {}", expected, got))
}
