mod instruction;

pub use instruction::Instruction;

/// Which instruction fields an opcode reads.
///
/// Unused fields are always zero in well-formed chunks and are skipped by
/// the binary dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldUsage(u8);

impl FieldUsage {
    pub const NONE: FieldUsage = FieldUsage(0);
    pub const A: FieldUsage = FieldUsage(1);
    pub const B: FieldUsage = FieldUsage(1 << 1);
    pub const C: FieldUsage = FieldUsage(1 << 2);
    /// A holds a proto-relative code address.
    pub const A_ADDR: FieldUsage = FieldUsage(1 << 3 | 1);

    pub const AB: FieldUsage = FieldUsage(Self::A.0 | Self::B.0);
    pub const ABC: FieldUsage = FieldUsage(Self::A.0 | Self::B.0 | Self::C.0);

    #[inline(always)]
    pub const fn uses_a(self) -> bool {
        self.0 & Self::A.0 != 0
    }

    #[inline(always)]
    pub const fn uses_b(self) -> bool {
        self.0 & Self::B.0 != 0
    }

    #[inline(always)]
    pub const fn uses_c(self) -> bool {
        self.0 & Self::C.0 != 0
    }

    #[inline(always)]
    pub const fn a_is_address(self) -> bool {
        self.0 & Self::A_ADDR.0 == Self::A_ADDR.0
    }
}

/// Stack-machine opcode set.
///
/// `top` is the last pushed value; "depth d" counts down from `top` (depth 0
/// is `top` itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0, // nothing

    // Stack shuffling
    Pop,  // pop A values
    Copy, // push copy of value at depth A
    Swap, // swap values at depths A and B

    // Literals
    LoadNil,  // push nil
    LoadBool, // push A != 0
    LoadNum,  // push numbers[B]
    LoadStr,  // push strings[B]

    // Symbols
    Load,  // push value of symbols[A]
    Store, // symbols[A] := expand(top, B); pop when C == 1

    // Tuples
    MkTuple,  // pop A values (last one expanded) and push them as a tuple
    ExpTuple, // push every element of the tuple at depth A
    Scalar,   // top := scalar(top)

    // Arithmetic: pop b, pop a, push a op b
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Neg, // top := -top
    Len, // top := #top
    Not, // top := not top

    // Comparison: pop b, pop a, push boolean
    Eq,
    Lt,
    Le,
    ToBool, // top := boolean(top)

    // Tables
    NewTable,  // push {}
    TblInitN,  // pop value, pop key; rawset(top, key, value)
    TblInitI,  // pop value; append to table at top (expand tuple when A == 1)
    Index,     // pop key, pop obj; push obj[key]
    IndexN,    // pop obj; push obj[strings[B]]
    IndexL,    // pop obj; push obj[strings[B]]; push obj
    IndexSet,  // pop key, pop obj; obj[key] := expand(value at depth A, B)
    IndexSetN, // pop obj; obj[strings[C]] := expand(value at depth A, B)

    // Control flow
    Jump,    // pc := A
    Jf,      // pop; if not value then pc := A
    JtOrPop, // if top then pc := A else pop
    JfOrPop, // if not top then pc := A else pop
    JNil,    // pop; if value is nil then pc := A
    JFor,    // [limit, step, var]: leave loop (pc := A) once var passed limit
    ToNum,   // top := tonumber(top); A names the for-loop stage on failure
    Incr,    // top := top + value at depth A

    // Calls
    Call,     // call value below the A arguments on top
    ThisCall, // same as Call, flagged as method call
    Ret,      // return void (A == 0) or the popped top (A == 1)
    BeginFn,  // reserve A local slots
    Args,     // bind caller arguments to locals 0..A
    Closure,  // push closure of protos[A]
    Clean,    // close upvalues and clear locals A..=B

    // Generic for
    IterPrep, // normalize iterator tuple at top
    IterUpd,  // pop result; store its first value as control variable
}

impl OpCode {
    const ALL: [OpCode; 52] = [
        OpCode::Nop,
        OpCode::Pop,
        OpCode::Copy,
        OpCode::Swap,
        OpCode::LoadNil,
        OpCode::LoadBool,
        OpCode::LoadNum,
        OpCode::LoadStr,
        OpCode::Load,
        OpCode::Store,
        OpCode::MkTuple,
        OpCode::ExpTuple,
        OpCode::Scalar,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Pow,
        OpCode::Concat,
        OpCode::Neg,
        OpCode::Len,
        OpCode::Not,
        OpCode::Eq,
        OpCode::Lt,
        OpCode::Le,
        OpCode::ToBool,
        OpCode::NewTable,
        OpCode::TblInitN,
        OpCode::TblInitI,
        OpCode::Index,
        OpCode::IndexN,
        OpCode::IndexL,
        OpCode::IndexSet,
        OpCode::IndexSetN,
        OpCode::Jump,
        OpCode::Jf,
        OpCode::JtOrPop,
        OpCode::JfOrPop,
        OpCode::JNil,
        OpCode::JFor,
        OpCode::ToNum,
        OpCode::Incr,
        OpCode::Call,
        OpCode::ThisCall,
        OpCode::Ret,
        OpCode::BeginFn,
        OpCode::Args,
        OpCode::Closure,
        OpCode::Clean,
        OpCode::IterPrep,
        OpCode::IterUpd,
    ];

    #[inline(always)]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    /// Static field-usage table.
    pub fn field_usage(self) -> FieldUsage {
        use OpCode::*;
        match self {
            Nop | LoadNil | Scalar | Add | Sub | Mul | Div | Mod | Pow | Concat | Neg | Len
            | Not | Eq | Lt | Le | ToBool | NewTable | TblInitN | Index | IterPrep | IterUpd => {
                FieldUsage::NONE
            }

            Pop | Copy | LoadBool | Load | MkTuple | ExpTuple | TblInitI | ToNum | Incr | Call
            | ThisCall | Ret | BeginFn | Args | Closure => FieldUsage::A,

            LoadNum | LoadStr | IndexN | IndexL => FieldUsage::B,

            Swap | IndexSet | Clean => FieldUsage::AB,

            Store | IndexSetN => FieldUsage::ABC,

            Jump | Jf | JtOrPop | JfOrPop | JNil | JFor => FieldUsage::A_ADDR,
        }
    }

    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Nop => "NOP",
            Pop => "POP",
            Copy => "COPY",
            Swap => "SWAP",
            LoadNil => "LOADNIL",
            LoadBool => "LOADBOOL",
            LoadNum => "LOADNUM",
            LoadStr => "LOADSTR",
            Load => "LOAD",
            Store => "STORE",
            MkTuple => "MKTUPLE",
            ExpTuple => "EXPTUPLE",
            Scalar => "SCALAR",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Concat => "CONCAT",
            Neg => "NEG",
            Len => "LEN",
            Not => "NOT",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            ToBool => "TOBOOL",
            NewTable => "NEWTABLE",
            TblInitN => "TBLINITN",
            TblInitI => "TBLINITI",
            Index => "INDEX",
            IndexN => "INDEXN",
            IndexL => "INDEXL",
            IndexSet => "INDEXSET",
            IndexSetN => "INDEXSETN",
            Jump => "JUMP",
            Jf => "JF",
            JtOrPop => "JTORPOP",
            JfOrPop => "JFORPOP",
            JNil => "JNIL",
            JFor => "JFOR",
            ToNum => "TONUM",
            Incr => "INCR",
            Call => "CALL",
            ThisCall => "THISCALL",
            Ret => "RET",
            BeginFn => "BEGINFN",
            Args => "ARGS",
            Closure => "CLOSURE",
            Clean => "CLEAN",
            IterPrep => "ITERPREP",
            IterUpd => "ITERUPD",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_covers_every_opcode() {
        for byte in 0..=OpCode::IterUpd as u8 {
            let op = OpCode::from_u8(byte).unwrap();
            assert_eq!(op as u8, byte, "{}", op);
        }
        assert_eq!(OpCode::from_u8(OpCode::IterUpd as u8 + 1), None);
    }

    #[test]
    fn test_jumps_use_address_field() {
        assert!(OpCode::Jump.field_usage().a_is_address());
        assert!(OpCode::JFor.field_usage().a_is_address());
        assert!(!OpCode::Call.field_usage().a_is_address());
        assert!(OpCode::Store.field_usage().uses_c());
        assert!(!OpCode::Add.field_usage().uses_a());
    }
}
