// Indexing, assignment, symbol access and table constructors
//
// `__index` / `__newindex` chains are walked here; a table handler is
// indexed again, a callable one is called. The walk is bounded by
// MAX_META_LOOP.

use std::rc::Rc;

use super::{ExecContext, Flow, TmKind};
use crate::lua_value::{Chunk, LuaClosure, LuaValue, SymbolKind, SymbolRef};
use crate::lua_vm::lua_limits::MAX_META_LOOP;
use crate::lua_vm::{CallFlags, LuaError, LuaResult, LuaVM, RuntimeErrorKind, call_flags};

/// End of an `__index` / `__newindex` walk.
pub(crate) enum MetaStep {
    /// Lookup finished (for assignment: the raw set was done).
    Done(LuaValue),
    /// Call `handler` with the object it was found on.
    Call { handler: LuaValue, target: LuaValue },
}

fn not_indexable(value: &LuaValue) -> LuaError {
    LuaError::runtime(
        RuntimeErrorKind::NotIndexable,
        format!("attempt to index a {} value", value.type_name()),
    )
}

impl LuaVM {
    // ============ Walks ============

    pub(crate) fn resolve_index(&self, obj: LuaValue, key: &LuaValue) -> LuaResult<MetaStep> {
        let mut current = obj;
        for _ in 0..MAX_META_LOOP {
            let handler = match &current {
                LuaValue::Table(t) => {
                    let (raw, mt) = {
                        let t = t.borrow();
                        (t.raw_get(key), t.metatable())
                    };
                    if !raw.is_nil() {
                        return Ok(MetaStep::Done(raw));
                    }
                    let handler = mt.map(|mt| mt.borrow().get_str(TmKind::Index.name()));
                    match handler {
                        Some(h) if !h.is_nil() => h,
                        _ => return Ok(MetaStep::Done(LuaValue::Nil)),
                    }
                }
                other => self
                    .get_metamethod(other, TmKind::Index)
                    .ok_or_else(|| not_indexable(other))?,
            };
            if handler.is_callable() {
                return Ok(MetaStep::Call {
                    handler,
                    target: current,
                });
            }
            current = handler;
        }
        Err(LuaError::runtime(RuntimeErrorKind::LoopInIndex, "loop in index"))
    }

    pub(crate) fn resolve_newindex(
        &self,
        obj: LuaValue,
        key: &LuaValue,
        value: &LuaValue,
    ) -> LuaResult<MetaStep> {
        let mut current = obj;
        for _ in 0..MAX_META_LOOP {
            let handler = match &current {
                LuaValue::Table(t) => {
                    let handler = {
                        let t = t.borrow();
                        if t.raw_get(key).is_nil() {
                            t.metatable()
                                .map(|mt| mt.borrow().get_str(TmKind::NewIndex.name()))
                                .filter(|h| !h.is_nil())
                        } else {
                            None
                        }
                    };
                    match handler {
                        Some(h) => h,
                        None => {
                            t.borrow_mut().set(key.clone(), value.clone())?;
                            return Ok(MetaStep::Done(LuaValue::Void));
                        }
                    }
                }
                other => self
                    .get_metamethod(other, TmKind::NewIndex)
                    .ok_or_else(|| not_indexable(other))?,
            };
            if handler.is_callable() {
                return Ok(MetaStep::Call {
                    handler,
                    target: current,
                });
            }
            current = handler;
        }
        Err(LuaError::runtime(
            RuntimeErrorKind::LoopInNewIndex,
            "loop in newindex",
        ))
    }

    // ============ Instruction paths ============

    /// Push `obj[key]`, splicing a handler call when one is reached.
    pub(crate) fn index_into(
        &mut self,
        obj: LuaValue,
        key: LuaValue,
        flags: CallFlags,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        match self.resolve_index(obj, &key)? {
            MetaStep::Done(value) => {
                self.push_result(value, flags);
                Ok(Flow::Next)
            }
            MetaStep::Call { handler, target } => {
                self.splice_call(handler, vec![target, key], flags, ctx)
            }
        }
    }

    pub(crate) fn newindex_into(
        &mut self,
        obj: LuaValue,
        key: LuaValue,
        value: LuaValue,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        match self.resolve_newindex(obj, &key, &value)? {
            MetaStep::Done(_) => Ok(Flow::Next),
            MetaStep::Call { handler, target } => self.splice_call(
                handler,
                vec![target, key, value],
                call_flags::DISCARD_RESULT,
                ctx,
            ),
        }
    }

    // ============ Host paths ============

    /// `obj[key]` with metamethods, handlers run as nested calls.
    pub fn index(&mut self, obj: LuaValue, key: LuaValue) -> LuaResult<LuaValue> {
        match self.resolve_index(obj, &key)? {
            MetaStep::Done(value) => Ok(value),
            MetaStep::Call { handler, target } => {
                Ok(self.call(handler, vec![target, key])?.into_scalar())
            }
        }
    }

    /// `obj[key] = value` with metamethods.
    pub fn set_index(&mut self, obj: LuaValue, key: LuaValue, value: LuaValue) -> LuaResult<()> {
        if let MetaStep::Call { handler, target } = self.resolve_newindex(obj, &key, &value)? {
            self.call(handler, vec![target, key, value])?;
        }
        Ok(())
    }

    // ============ Symbols ============

    fn symbol<'c>(chunk: &'c Chunk, index: usize) -> LuaResult<&'c SymbolRef> {
        chunk
            .symbols
            .get(index)
            .ok_or_else(|| LuaError::internal(format!("symbol {} out of range", index)))
    }

    /// Value of a local, upvalue or default-environment symbol.
    fn direct_symbol_value(
        &self,
        symbol: &SymbolRef,
        closure: &LuaClosure,
        base: usize,
    ) -> LuaResult<LuaValue> {
        match symbol.kind {
            SymbolKind::Local => Ok(self
                .thread
                .stack
                .get(base + symbol.index as usize)
                .cloned()
                .unwrap_or_default()),
            SymbolKind::Upvalue => {
                let uv = closure.upvalues().get(symbol.index as usize).ok_or_else(|| {
                    LuaError::internal(format!("upvalue {} out of range", symbol.index))
                })?;
                Ok(self.upvalue_get(uv))
            }
            SymbolKind::DefaultEnv => Ok(LuaValue::Table(self.globals.clone())),
            SymbolKind::Global => Err(LuaError::internal(format!(
                "global '{}' used as an environment",
                symbol.name
            ))),
        }
    }

    fn global_env(&self, chunk: &Chunk, symbol: &SymbolRef, closure: &LuaClosure, base: usize) -> LuaResult<LuaValue> {
        match symbol.env {
            Some(env) => self.direct_symbol_value(Self::symbol(chunk, env as usize)?, closure, base),
            None => Ok(LuaValue::Table(self.globals.clone())),
        }
    }

    pub(super) fn op_load(
        &mut self,
        chunk: &Chunk,
        closure: &Rc<LuaClosure>,
        base: usize,
        index: usize,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        let symbol = Self::symbol(chunk, index)?;
        if symbol.kind != SymbolKind::Global {
            let value = self.direct_symbol_value(symbol, closure, base)?;
            self.push(value);
            return Ok(Flow::Next);
        }
        let env = self.global_env(chunk, symbol, closure, base)?;
        let key = LuaValue::String(symbol.name.clone());
        self.index_into(env, key, call_flags::NONE, ctx)
    }

    /// Assign element `element` of the value on top to a symbol, popping
    /// the value when `pop` is set.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn op_store(
        &mut self,
        chunk: &Chunk,
        closure: &Rc<LuaClosure>,
        base: usize,
        index: usize,
        element: usize,
        pop: bool,
        ctx: ExecContext,
    ) -> LuaResult<Flow> {
        let value = self.peek(0)?.tuple_get(element);
        if pop {
            self.pop()?;
        }
        let symbol = Self::symbol(chunk, index)?;
        match symbol.kind {
            SymbolKind::Local => {
                let slot = base + symbol.index as usize;
                let Some(target) = self.thread.stack.get_mut(slot) else {
                    return Err(LuaError::internal(format!("local slot {} out of range", slot)));
                };
                *target = value;
                Ok(Flow::Next)
            }
            SymbolKind::Upvalue => {
                let uv = closure.upvalues().get(symbol.index as usize).ok_or_else(|| {
                    LuaError::internal(format!("upvalue {} out of range", symbol.index))
                })?;
                self.upvalue_set(uv, value);
                Ok(Flow::Next)
            }
            SymbolKind::DefaultEnv => Err(LuaError::internal(
                "assignment to the default environment",
            )),
            SymbolKind::Global => {
                let env = self.global_env(chunk, symbol, closure, base)?;
                let key = LuaValue::String(symbol.name.clone());
                self.newindex_into(env, key, value, ctx)
            }
        }
    }

    // ============ Constructors ============

    pub(super) fn op_tbl_init_named(&mut self) -> LuaResult<()> {
        let value = self.pop()?.into_scalar();
        let key = self.pop()?.into_scalar();
        let LuaValue::Table(table) = self.peek(0)? else {
            return Err(LuaError::internal("table initializer without a table"));
        };
        table.borrow_mut().set(key, value)?;
        Ok(())
    }

    pub(super) fn op_tbl_init_positional(&mut self, expand: bool) -> LuaResult<()> {
        let value = self.pop()?;
        let LuaValue::Table(table) = self.peek(0)? else {
            return Err(LuaError::internal("table initializer without a table"));
        };
        let mut table = table.borrow_mut();
        if expand {
            for item in value.into_multi() {
                table.init_next_array_key(item)?;
            }
        } else {
            table.init_next_array_key(value.into_scalar())?;
        }
        Ok(())
    }
}
