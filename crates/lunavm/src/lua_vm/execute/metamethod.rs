// Metamethod lookup and spliced handler calls
//
// Handlers invoked by instructions are pushed as ordinary calls with a
// result transform flag, so a script handler runs in the same loop and
// may yield.

use super::{ExecContext, Flow};
use crate::lua_value::{LuaValue, TableRef};
use crate::lua_vm::{CallFlags, FrameHandlers, LuaResult, LuaVM};

/// Metamethod events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Concat,
    Len,
    Eq,
    Lt,
    Le,
    Call,
    ToString,
    Iterator,
    Metatable,
}

impl TmKind {
    pub const fn name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Div => "__div",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Unm => "__unm",
            TmKind::Concat => "__concat",
            TmKind::Len => "__len",
            TmKind::Eq => "__eq",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Call => "__call",
            TmKind::ToString => "__tostring",
            TmKind::Iterator => "__iterator",
            TmKind::Metatable => "__metatable",
        }
    }
}

impl LuaVM {
    /// Metatable of any value: tables and userdata carry their own, strings
    /// share one, everything else has none.
    pub fn get_metatable(&self, value: &LuaValue) -> Option<TableRef> {
        match value {
            LuaValue::Table(t) => t.borrow().metatable(),
            LuaValue::UserData(u) => u.metatable(),
            LuaValue::String(_) => self.string_metatable.clone(),
            _ => None,
        }
    }

    pub fn get_metamethod(&self, value: &LuaValue, tm: TmKind) -> Option<LuaValue> {
        let mt = self.get_metatable(value)?;
        let handler = mt.borrow().get_str(tm.name());
        if handler.is_nil() { None } else { Some(handler) }
    }

    /// Handler of a binary event: the left operand's, else the right's.
    pub(crate) fn get_binary_metamethod(
        &self,
        lhs: &LuaValue,
        rhs: &LuaValue,
        tm: TmKind,
    ) -> Option<LuaValue> {
        self.get_metamethod(lhs, tm)
            .or_else(|| self.get_metamethod(rhs, tm))
    }

    /// Push `handler(args...)` as a call whose result is transformed by
    /// `flags` before it lands on the stack.
    pub(crate) fn splice_call(
        &mut self,
        handler: LuaValue,
        args: Vec<LuaValue>,
        flags: CallFlags,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        let argc = args.len();
        self.push(handler);
        self.thread.stack.extend(args);
        self.exec_call(argc, flags, FrameHandlers::default(), ctx)
    }
}
