use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;

use super::TableRef;

/// Opaque host object with an optional metatable.
pub struct LuaUserdata {
    data: RefCell<Box<dyn Any>>,
    metatable: RefCell<Option<TableRef>>,
}

impl LuaUserdata {
    pub fn new<T: Any>(data: T) -> Self {
        LuaUserdata {
            data: RefCell::new(Box::new(data)),
            metatable: RefCell::new(None),
        }
    }

    pub fn with_metatable<T: Any>(data: T, metatable: TableRef) -> Self {
        LuaUserdata {
            data: RefCell::new(Box::new(data)),
            metatable: RefCell::new(Some(metatable)),
        }
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.borrow().clone()
    }

    pub fn set_metatable(&self, metatable: Option<TableRef>) {
        *self.metatable.borrow_mut() = metatable;
    }

    pub fn is<T: Any>(&self) -> bool {
        self.data.borrow().is::<T>()
    }

    pub fn borrow<T: Any>(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.data.borrow(), |data| data.downcast_ref::<T>()).ok()
    }

    pub fn borrow_mut<T: Any>(&self) -> Option<RefMut<'_, T>> {
        RefMut::filter_map(self.data.borrow_mut(), |data| data.downcast_mut::<T>()).ok()
    }
}

impl fmt::Debug for LuaUserdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LuaUserdata")
    }
}
