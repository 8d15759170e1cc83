// Hybrid ordered table
// - Insertion-ordered node list holding every (key, value) pair
// - Three indices over the nodes: string keys, integral keys >= index base,
//   and everything else
// - Writing nil keeps the node as a tombstone so `next` stays valid while
//   a traversal is in flight
mod node_list;
mod table_key;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use smol_str::SmolStr;
use thiserror::Error;

use super::lua_value::number_to_integer;
use super::{LuaValue, ScriptId};
use node_list::{NodeId, NodeList};
use table_key::TableKey;

pub type TableRef = Rc<RefCell<LuaTable>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("table index is nil")]
    NilKey,
    #[error("table index is NaN")]
    NaNKey,
    #[error("attempt to link objects owned by different scripts")]
    CrossScriptLinkage,
}

/// Result of `next`: a live pair, or the nil pair at the end of traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePair {
    pub key: LuaValue,
    pub value: LuaValue,
}

impl TablePair {
    pub fn new(key: LuaValue, value: LuaValue) -> Self {
        Self { key, value }
    }

    pub fn nil() -> Self {
        Self {
            key: LuaValue::Nil,
            value: LuaValue::Nil,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.key.is_nil()
    }
}

struct Entry {
    key: LuaValue,
    value: LuaValue,
}

enum Route {
    Str(SmolStr),
    Int(i64),
    Value,
}

pub struct LuaTable {
    nodes: NodeList<Entry>,
    string_index: AHashMap<SmolStr, NodeId>,
    array_index: AHashMap<i64, NodeId>,
    value_index: AHashMap<TableKey, NodeId>,
    /// Border of the array part; `None` until recomputed.
    cached_length: Cell<Option<usize>>,
    /// Nodes currently holding nil.
    dead_count: usize,
    index_base: i64,
    /// Positional entries written by the table constructor so far.
    init_count: i64,
    metatable: Option<TableRef>,
    owner: Option<ScriptId>,
}

impl LuaTable {
    pub fn new(owner: Option<ScriptId>, index_base: i64) -> Self {
        LuaTable {
            nodes: NodeList::new(),
            string_index: AHashMap::new(),
            array_index: AHashMap::new(),
            value_index: AHashMap::new(),
            cached_length: Cell::new(Some(0)),
            dead_count: 0,
            index_base,
            init_count: 0,
            metatable: None,
            owner,
        }
    }

    /// Free-standing table with the default index base.
    pub fn new_ref() -> TableRef {
        Rc::new(RefCell::new(LuaTable::default()))
    }

    #[inline(always)]
    pub fn owner(&self) -> Option<ScriptId> {
        self.owner
    }

    #[inline(always)]
    pub fn index_base(&self) -> i64 {
        self.index_base
    }

    /// Number of linked nodes, tombstones included.
    pub fn len_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_dead_keys(&self) -> bool {
        self.dead_count > 0
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, metatable: Option<TableRef>) -> Result<(), TableError> {
        if let Some(mt) = &metatable {
            self.check_link_table(mt)?;
        }
        self.metatable = metatable;
        Ok(())
    }

    // ============ Lookup ============

    fn route(&self, key: &LuaValue) -> Route {
        match key {
            LuaValue::String(s) => Route::Str(s.clone()),
            LuaValue::Number(n) => match number_to_integer(*n) {
                Some(i) if i >= self.index_base => Route::Int(i),
                _ => Route::Value,
            },
            _ => Route::Value,
        }
    }

    fn lookup(&self, route: &Route, key: &LuaValue) -> Option<NodeId> {
        match route {
            Route::Str(s) => self.string_index.get(s).copied(),
            Route::Int(i) => self.array_index.get(i).copied(),
            Route::Value => self.value_index.get(&TableKey(key.clone())).copied(),
        }
    }

    fn find(&self, key: &LuaValue) -> Option<NodeId> {
        match key {
            LuaValue::Nil | LuaValue::Void => None,
            LuaValue::Number(n) if n.is_nan() => None,
            LuaValue::Tuple(_) => self.find(&key.to_scalar()),
            _ => self.lookup(&self.route(key), key),
        }
    }

    #[inline]
    fn value_of(&self, id: Option<NodeId>) -> LuaValue {
        id.and_then(|id| self.nodes.get(id))
            .map(|entry| entry.value.clone())
            .unwrap_or_default()
    }

    /// Raw lookup; `Nil` when absent.
    pub fn raw_get(&self, key: &LuaValue) -> LuaValue {
        self.value_of(self.find(key))
    }

    pub fn get(&self, key: &LuaValue) -> LuaValue {
        self.raw_get(key)
    }

    pub fn get_str(&self, key: &str) -> LuaValue {
        self.value_of(self.string_index.get(key).copied())
    }

    pub fn get_int(&self, key: i64) -> LuaValue {
        if key >= self.index_base {
            self.value_of(self.array_index.get(&key).copied())
        } else {
            self.raw_get(&LuaValue::integer(key))
        }
    }

    // ============ Mutation ============

    fn check_link_table(&self, table: &TableRef) -> Result<(), TableError> {
        // A failed borrow means `table` is this very table.
        if let Ok(other) = table.try_borrow()
            && let (Some(mine), Some(theirs)) = (self.owner, other.owner)
            && mine != theirs
        {
            return Err(TableError::CrossScriptLinkage);
        }
        Ok(())
    }

    fn check_link(&self, value: &LuaValue) -> Result<(), TableError> {
        match value {
            LuaValue::Table(t) => self.check_link_table(t),
            _ => Ok(()),
        }
    }

    pub fn set(&mut self, key: LuaValue, value: LuaValue) -> Result<(), TableError> {
        let key = key.into_scalar();
        let value = value.into_scalar();
        match &key {
            LuaValue::Nil | LuaValue::Void => return Err(TableError::NilKey),
            LuaValue::Number(n) if n.is_nan() => return Err(TableError::NaNKey),
            _ => {}
        }
        self.check_link(&key)?;
        self.check_link(&value)?;
        let route = self.route(&key);
        self.perform_set(key, route, value);
        Ok(())
    }

    pub fn set_str(&mut self, key: &str, value: LuaValue) -> Result<(), TableError> {
        self.set(LuaValue::string(key), value)
    }

    pub fn set_int(&mut self, key: i64, value: LuaValue) -> Result<(), TableError> {
        self.set(LuaValue::integer(key), value)
    }

    /// `t[#t + base] = value`.
    pub fn append(&mut self, value: LuaValue) -> Result<(), TableError> {
        let key = self.index_base + self.length() as i64;
        self.set_int(key, value)
    }

    /// Next positional constructor entry. The n-th entry lands at
    /// `base + n` whether or not earlier entries were nil.
    pub fn init_next_array_key(&mut self, value: LuaValue) -> Result<(), TableError> {
        let key = self.index_base + self.init_count;
        self.init_count += 1;
        self.set_int(key, value)
    }

    fn perform_set(&mut self, key: LuaValue, route: Route, value: LuaValue) {
        let existing = self.lookup(&route, &key);
        let array_key = match route {
            Route::Int(i) => Some(i),
            _ => None,
        };
        let value_is_nil = value.is_nil();

        let was_absent = match existing {
            Some(id) => match self.nodes.get_mut(id) {
                Some(entry) => {
                    let was_nil = entry.value.is_nil();
                    entry.value = value;
                    was_nil
                }
                None => return,
            },
            None => {
                if value_is_nil {
                    return;
                }
                let index_key = key.clone();
                let id = self.nodes.push_back(Entry { key, value });
                match route {
                    Route::Str(s) => {
                        self.string_index.insert(s, id);
                    }
                    Route::Int(i) => {
                        self.array_index.insert(i, id);
                    }
                    Route::Value => {
                        self.value_index.insert(TableKey(index_key), id);
                    }
                }
                true
            }
        };

        if existing.is_some() {
            match (was_absent, value_is_nil) {
                (false, true) => self.dead_count += 1,
                (true, false) => self.dead_count = self.dead_count.saturating_sub(1),
                _ => {}
            }
        }

        if let Some(k) = array_key {
            self.update_length(k, was_absent, value_is_nil);
        }

        if was_absent && !value_is_nil && self.dead_count > 0 {
            self.collect_dead_keys();
        }
    }

    fn update_length(&mut self, key: i64, was_absent: bool, value_is_nil: bool) {
        let Some(len) = self.cached_length.get() else {
            return;
        };
        let border = self.index_base + len as i64;
        if value_is_nil {
            if !was_absent && key < border {
                self.cached_length.set(None);
            }
        } else if was_absent {
            if key == border && self.get_int(key + 1).is_nil() {
                self.cached_length.set(Some(len + 1));
            } else {
                self.cached_length.set(None);
            }
        }
    }

    /// Unlink `key` physically; tombstones and live nodes alike.
    pub fn remove(&mut self, key: &LuaValue) -> bool {
        let Some(id) = self.find(key) else {
            return false;
        };
        let Some(entry) = self.nodes.remove(id) else {
            return false;
        };
        let route = self.route(&entry.key);
        self.unindex(&route, &entry.key);
        if entry.value.is_nil() {
            self.dead_count = self.dead_count.saturating_sub(1);
        }
        if matches!(route, Route::Int(_)) {
            self.cached_length.set(None);
        }
        true
    }

    fn unindex(&mut self, route: &Route, key: &LuaValue) {
        match route {
            Route::Str(s) => {
                self.string_index.remove(s);
            }
            Route::Int(i) => {
                self.array_index.remove(i);
            }
            Route::Value => {
                self.value_index.remove(&TableKey(key.clone()));
            }
        }
    }

    /// Purge tombstones. Invalidates any traversal in flight.
    pub fn collect_dead_keys(&mut self) {
        let dead: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.value.is_nil())
            .map(|(id, _)| id)
            .collect();
        for id in dead {
            if let Some(entry) = self.nodes.remove(id) {
                let route = self.route(&entry.key);
                self.unindex(&route, &entry.key);
            }
        }
        self.dead_count = 0;
    }

    // ============ Length & traversal ============

    /// First border of the array part: `[base, base + len)` are all non-nil
    /// and `base + len` is nil.
    pub fn length(&self) -> usize {
        if let Some(len) = self.cached_length.get() {
            return len;
        }
        let mut len = 0usize;
        while !self.get_int(self.index_base + len as i64).is_nil() {
            len += 1;
        }
        self.cached_length.set(Some(len));
        len
    }

    /// Pair following `key` in insertion order, skipping tombstones.
    /// `None` when `key` is not in the table.
    pub fn next(&self, key: &LuaValue) -> Option<TablePair> {
        let mut cursor = if key.is_nil() {
            self.nodes.first()
        } else {
            let id = self.find(key)?;
            self.nodes.next_of(id)
        };
        while let Some(id) = cursor {
            if let Some(entry) = self.nodes.get(id)
                && !entry.value.is_nil()
            {
                return Some(TablePair::new(entry.key.clone(), entry.value.clone()));
            }
            cursor = self.nodes.next_of(id);
        }
        Some(TablePair::nil())
    }

    /// Live pairs in insertion order.
    pub fn pairs(&self) -> impl Iterator<Item = (&LuaValue, &LuaValue)> {
        self.nodes
            .iter()
            .filter(|(_, entry)| !entry.value.is_nil())
            .map(|(_, entry)| (&entry.key, &entry.value))
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.string_index.clear();
        self.array_index.clear();
        self.value_index.clear();
        self.cached_length.set(Some(0));
        self.dead_count = 0;
    }
}

impl Default for LuaTable {
    fn default() -> Self {
        LuaTable::new(None, crate::lua_vm::lua_limits::DEFAULT_INDEX_BASE)
    }
}

impl fmt::Debug for LuaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.pairs()).finish()
    }
}
