use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::lua_value::LuaValue;

/// Hashable wrapper for keys routed to the generic index.
///
/// Keys are scalar, non-nil and never NaN by the time they get here;
/// `-0.0` hashes like `0.0` because the two compare equal.
#[derive(Clone, Debug)]
pub(crate) struct TableKey(pub LuaValue);

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.0).hash(state);
        match &self.0 {
            LuaValue::Boolean(b) => b.hash(state),
            LuaValue::Number(n) => {
                let n = if *n == 0.0 { 0.0 } else { *n };
                n.to_bits().hash(state)
            }
            LuaValue::String(s) => s.hash(state),
            LuaValue::Function(f) => (Rc::as_ptr(f) as usize).hash(state),
            LuaValue::HostFunction(f) => (Rc::as_ptr(f) as usize).hash(state),
            LuaValue::Table(t) => (Rc::as_ptr(t) as usize).hash(state),
            LuaValue::UserData(u) => (Rc::as_ptr(u) as usize).hash(state),
            LuaValue::Thread(co) => (Rc::as_ptr(co) as usize).hash(state),
            _ => {}
        }
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.raw_equals(&other.0)
    }
}

impl Eq for TableKey {}
