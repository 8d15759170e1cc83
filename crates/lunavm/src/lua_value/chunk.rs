use std::fmt;
use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_vm::Instruction;

/// Source span of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceRef {
    pub source_id: u32,
    pub from_line: u32,
    pub to_line: u32,
    pub from_char: u32,
    pub to_char: u32,
}

impl SourceRef {
    pub fn line(line: u32) -> Self {
        SourceRef {
            source_id: 0,
            from_line: line,
            to_line: line,
            from_char: 0,
            to_char: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SymbolKind {
    Local = 0,
    Upvalue = 1,
    Global = 2,
    /// The script's global table itself.
    DefaultEnv = 3,
}

impl SymbolKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SymbolKind::Local),
            1 => Some(SymbolKind::Upvalue),
            2 => Some(SymbolKind::Global),
            3 => Some(SymbolKind::DefaultEnv),
            _ => None,
        }
    }
}

/// Operand of `Load` / `Store`.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRef {
    pub kind: SymbolKind,
    /// Local slot or upvalue index; unused for globals.
    pub index: u32,
    pub name: SmolStr,
    /// For globals: symbol (same table) that yields the environment.
    pub env: Option<u32>,
}

/// How a nested proto captures one upvalue when instantiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpvalueDesc {
    /// Capture a local of the enclosing frame (else one of the enclosing
    /// closure's upvalues).
    pub from_parent_local: bool,
    pub index: u32,
    pub name: SmolStr,
}

/// Compiled function prototype. Immutable once built; closures share it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chunk {
    pub name: SmolStr,
    pub source_name: SmolStr,
    pub code: Vec<Instruction>,
    pub source_refs: Vec<Option<SourceRef>>,
    pub strings: Vec<SmolStr>,
    pub numbers: Vec<f64>,
    pub symbols: Vec<SymbolRef>,
    pub locals: Vec<SmolStr>,
    pub param_count: u32,
    pub is_vararg: bool,
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub protos: Vec<Rc<Chunk>>,
}

impl Chunk {
    pub fn source_ref_at(&self, pc: usize) -> Option<SourceRef> {
        self.source_refs.get(pc).copied().flatten()
    }

    /// "source:line" of the instruction at `pc`.
    pub fn location(&self, pc: usize) -> Option<String> {
        let sref = self.source_ref_at(pc)?;
        let source = if self.source_name.is_empty() {
            "?"
        } else {
            self.source_name.as_str()
        };
        Some(format!("{}:{}", source, sref.from_line))
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }
}

/// Disassembly listing, one instruction per line.
impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function <{}:{}> ({} instructions, {} params{}, {} locals, {} upvalues)",
            self.source_name,
            self.name,
            self.code.len(),
            self.param_count,
            if self.is_vararg { "+" } else { "" },
            self.locals.len(),
            self.upvalue_descs.len()
        )?;
        for (pc, instr) in self.code.iter().enumerate() {
            match self.source_ref_at(pc) {
                Some(sref) => writeln!(f, "\t{}\t[{}]\t{}", pc, sref.from_line, instr)?,
                None => writeln!(f, "\t{}\t[-]\t{}", pc, instr)?,
            }
        }
        for proto in &self.protos {
            write!(f, "{}", proto)?;
        }
        Ok(())
    }
}
