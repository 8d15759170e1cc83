// Chunk assembler
// Builds well-formed protos for hosts and tests: deduplicated constant
// pools, symbol table, labels resolved to code addresses, nested protos.
// Every proto starts with `BeginFn locals; Args params`, patched in `build`.
use std::rc::Rc;

use ahash::AHashMap;
use smol_str::SmolStr;

use super::{Chunk, SourceRef, SymbolKind, SymbolRef, UpvalueDesc};
use crate::lua_vm::{Instruction, LuaError, LuaResult, OpCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

pub struct ChunkBuilder {
    chunk: Chunk,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
    string_lookup: AHashMap<SmolStr, u32>,
    number_lookup: AHashMap<u64, u32>,
    current_source: Option<SourceRef>,
    env_symbol: Option<u32>,
    error: Option<String>,
}

impl ChunkBuilder {
    pub fn new(name: &str) -> Self {
        let mut builder = ChunkBuilder {
            chunk: Chunk {
                name: SmolStr::new(name),
                ..Chunk::default()
            },
            labels: Vec::new(),
            fixups: Vec::new(),
            string_lookup: AHashMap::new(),
            number_lookup: AHashMap::new(),
            current_source: None,
            env_symbol: None,
            error: None,
        };
        builder.emit(OpCode::BeginFn, 0, 0, 0);
        builder.emit(OpCode::Args, 0, 0, 0);
        builder
    }

    pub fn set_source_name(&mut self, name: &str) -> &mut Self {
        self.chunk.source_name = SmolStr::new(name);
        self
    }

    /// Tag following instructions with `line`.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.current_source = Some(SourceRef::line(line));
        self
    }

    pub fn set_source(&mut self, source: Option<SourceRef>) -> &mut Self {
        self.current_source = source;
        self
    }

    // ============ Symbols ============

    fn push_symbol(&mut self, symbol: SymbolRef) -> u32 {
        self.chunk.symbols.push(symbol);
        (self.chunk.symbols.len() - 1) as u32
    }

    /// Declare a parameter. Parameters must precede every other local.
    pub fn param(&mut self, name: &str) -> u32 {
        if self.chunk.locals.len() != self.chunk.param_count as usize || self.chunk.is_vararg {
            self.fail(format!("parameter '{}' declared after a local", name));
        }
        self.chunk.param_count += 1;
        self.local(name)
    }

    /// Declare the trailing `...` parameter.
    pub fn vararg(&mut self) -> u32 {
        if self.chunk.locals.len() != self.chunk.param_count as usize {
            self.fail("vararg declared after a local".to_string());
        }
        self.chunk.is_vararg = true;
        self.local("...")
    }

    pub fn local(&mut self, name: &str) -> u32 {
        let slot = self.chunk.locals.len() as u32;
        self.chunk.locals.push(SmolStr::new(name));
        self.push_symbol(SymbolRef {
            kind: SymbolKind::Local,
            index: slot,
            name: SmolStr::new(name),
            env: None,
        })
    }

    /// Declare an upvalue captured from the enclosing function's local slot
    /// (`from_parent_local`) or from its upvalue list.
    pub fn upvalue(&mut self, name: &str, from_parent_local: bool, index: u32) -> u32 {
        let slot = self.chunk.upvalue_descs.len() as u32;
        self.chunk.upvalue_descs.push(UpvalueDesc {
            from_parent_local,
            index,
            name: SmolStr::new(name),
        });
        self.push_symbol(SymbolRef {
            kind: SymbolKind::Upvalue,
            index: slot,
            name: SmolStr::new(name),
            env: None,
        })
    }

    /// Resolve later `global` symbols through `symbol` (usually an `_ENV`
    /// upvalue) instead of the script's global table.
    pub fn use_env(&mut self, symbol: u32) -> &mut Self {
        self.env_symbol = Some(symbol);
        self
    }

    pub fn global(&mut self, name: &str) -> u32 {
        let env = match self.env_symbol {
            Some(env) => env,
            None => {
                let env = self.push_symbol(SymbolRef {
                    kind: SymbolKind::DefaultEnv,
                    index: 0,
                    name: SmolStr::new("_ENV"),
                    env: None,
                });
                self.env_symbol = Some(env);
                env
            }
        };
        self.push_symbol(SymbolRef {
            kind: SymbolKind::Global,
            index: 0,
            name: SmolStr::new(name),
            env: Some(env),
        })
    }

    /// Local slot of a local symbol.
    pub fn slot_of(&self, symbol: u32) -> u32 {
        self.chunk
            .symbols
            .get(symbol as usize)
            .filter(|s| s.kind == SymbolKind::Local)
            .map(|s| s.index)
            .unwrap_or(0)
    }

    // ============ Constants ============

    pub fn string_const(&mut self, s: &str) -> u32 {
        if let Some(&k) = self.string_lookup.get(s) {
            return k;
        }
        let k = self.chunk.strings.len() as u32;
        self.chunk.strings.push(SmolStr::new(s));
        self.string_lookup.insert(SmolStr::new(s), k);
        k
    }

    /// Numbers are deduplicated by bit pattern, so `0.0` and `-0.0` stay
    /// distinct constants.
    pub fn number_const(&mut self, n: f64) -> u32 {
        if let Some(&k) = self.number_lookup.get(&n.to_bits()) {
            return k;
        }
        let k = self.chunk.numbers.len() as u32;
        self.chunk.numbers.push(n);
        self.number_lookup.insert(n.to_bits(), k);
        k
    }

    pub fn add_proto(&mut self, proto: Chunk) -> u32 {
        self.chunk.protos.push(Rc::new(proto));
        (self.chunk.protos.len() - 1) as u32
    }

    // ============ Code ============

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    /// Append an instruction and return its pc.
    pub fn emit(&mut self, op: OpCode, a: i32, b: u32, c: u32) -> usize {
        if !(Instruction::MIN_SIGNED_A..=Instruction::MAX_SIGNED_A).contains(&a)
            || b > Instruction::MAX_B
            || c > Instruction::MAX_C
        {
            self.fail(format!("operand out of range in {} {} {} {}", op, a, b, c));
        }
        self.chunk.code.push(Instruction::new(op, a, b, c));
        self.chunk.source_refs.push(self.current_source);
        self.chunk.code.len() - 1
    }

    pub fn here(&self) -> usize {
        self.chunk.code.len()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction.
    pub fn mark(&mut self, label: Label) -> &mut Self {
        let here = self.here();
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(here);
        }
        self
    }

    /// Emit a jump-family instruction targeting `label`.
    pub fn jump(&mut self, op: OpCode, label: Label) -> &mut Self {
        if !op.field_usage().a_is_address() {
            self.fail(format!("{} does not take a code address", op));
        }
        let pc = self.emit(op, 0, 0, 0);
        self.fixups.push((pc, label));
        self
    }

    /// Emit an instruction without operands.
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.emit(op, 0, 0, 0);
        self
    }

    pub fn op_a(&mut self, op: OpCode, a: i32) -> &mut Self {
        self.emit(op, a, 0, 0);
        self
    }

    pub fn load_nil(&mut self) -> &mut Self {
        self.op(OpCode::LoadNil)
    }

    pub fn load_bool(&mut self, b: bool) -> &mut Self {
        self.op_a(OpCode::LoadBool, b as i32)
    }

    pub fn load_num(&mut self, n: f64) -> &mut Self {
        let k = self.number_const(n);
        self.emit(OpCode::LoadNum, 0, k, 0);
        self
    }

    pub fn load_str(&mut self, s: &str) -> &mut Self {
        let k = self.string_const(s);
        self.emit(OpCode::LoadStr, 0, k, 0);
        self
    }

    pub fn load(&mut self, symbol: u32) -> &mut Self {
        self.op_a(OpCode::Load, symbol as i32)
    }

    /// `symbol = top`, popping it.
    pub fn store(&mut self, symbol: u32) -> &mut Self {
        self.emit(OpCode::Store, symbol as i32, 0, 1);
        self
    }

    /// `symbol = expand(top, tuple_index)`, leaving top in place.
    pub fn store_keep(&mut self, symbol: u32, tuple_index: u32) -> &mut Self {
        self.emit(OpCode::Store, symbol as i32, tuple_index, 0);
        self
    }

    pub fn pop(&mut self, n: i32) -> &mut Self {
        self.op_a(OpCode::Pop, n)
    }

    pub fn call(&mut self, argc: i32) -> &mut Self {
        self.op_a(OpCode::Call, argc)
    }

    pub fn this_call(&mut self, argc: i32) -> &mut Self {
        self.op_a(OpCode::ThisCall, argc)
    }

    pub fn ret(&mut self, count: i32) -> &mut Self {
        self.op_a(OpCode::Ret, count)
    }

    pub fn index_n(&mut self, name: &str) -> &mut Self {
        let k = self.string_const(name);
        self.emit(OpCode::IndexN, 0, k, 0);
        self
    }

    pub fn index_l(&mut self, name: &str) -> &mut Self {
        let k = self.string_const(name);
        self.emit(OpCode::IndexL, 0, k, 0);
        self
    }

    pub fn index_set(&mut self, depth: i32, tuple_index: u32) -> &mut Self {
        self.emit(OpCode::IndexSet, depth, tuple_index, 0);
        self
    }

    pub fn index_set_n(&mut self, name: &str, depth: i32) -> &mut Self {
        let k = self.string_const(name);
        self.emit(OpCode::IndexSetN, depth, 0, k);
        self
    }

    pub fn closure(&mut self, proto: u32) -> &mut Self {
        self.op_a(OpCode::Closure, proto as i32)
    }

    pub fn clean(&mut self, from: u32, to: u32) -> &mut Self {
        self.emit(OpCode::Clean, from as i32, to, 0);
        self
    }

    pub fn build(mut self) -> LuaResult<Chunk> {
        if let Some(message) = self.error.take() {
            return Err(LuaError::internal(message));
        }
        let locals = self.chunk.locals.len() as i32;
        let params = self.chunk.param_count as i32 + self.chunk.is_vararg as i32;
        self.chunk.code[0].set_a(locals);
        self.chunk.code[1].set_a(params);

        for (pc, label) in std::mem::take(&mut self.fixups) {
            let Some(Some(target)) = self.labels.get(label.0).copied() else {
                return Err(LuaError::internal(format!(
                    "unresolved label {} in '{}'",
                    label.0, self.chunk.name
                )));
            };
            self.chunk.code[pc].set_a(target as i32);
        }
        Ok(self.chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prologue_is_patched() {
        let mut b = ChunkBuilder::new("f");
        b.param("a");
        b.param("b");
        b.vararg();
        b.local("tmp");
        b.ret(0);
        let chunk = b.build().unwrap();
        assert_eq!(chunk.code[0].get_opcode(), Some(OpCode::BeginFn));
        assert_eq!(chunk.code[0].get_a(), 4);
        assert_eq!(chunk.code[1].get_a(), 3);
        assert_eq!(chunk.param_count, 2);
        assert!(chunk.is_vararg);
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let mut b = ChunkBuilder::new("k");
        b.load_num(1.0).load_num(1.0).load_num(-0.0).load_num(0.0);
        b.load_str("x").load_str("x");
        let chunk = b.build().unwrap();
        assert_eq!(chunk.numbers.len(), 3);
        assert_eq!(chunk.strings.len(), 1);
    }

    #[test]
    fn test_labels_resolve_forward_and_backward() {
        let mut b = ChunkBuilder::new("loop");
        let top = b.new_label();
        let exit = b.new_label();
        b.mark(top);
        b.load_bool(false).jump(OpCode::Jf, exit).jump(OpCode::Jump, top);
        b.mark(exit).ret(0);
        let chunk = b.build().unwrap();
        assert_eq!(chunk.code[3].get_a(), 5);
        assert_eq!(chunk.code[4].get_a(), 2);
    }

    #[test]
    fn test_unresolved_label_fails() {
        let mut b = ChunkBuilder::new("bad");
        let nowhere = b.new_label();
        b.jump(OpCode::Jump, nowhere);
        assert!(matches!(b.build(), Err(LuaError::Internal(_))));
    }

    #[test]
    fn test_globals_share_default_env() {
        let mut b = ChunkBuilder::new("g");
        let x = b.global("x");
        let y = b.global("y");
        let chunk = b.build().unwrap();
        let env = chunk.symbols[x as usize].env.unwrap();
        assert_eq!(chunk.symbols[y as usize].env, Some(env));
        assert_eq!(chunk.symbols[env as usize].kind, SymbolKind::DefaultEnv);
    }
}
