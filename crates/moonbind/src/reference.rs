use std::cell::RefCell;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::rc::Rc;

use mlua_sys as ffi;

use crate::error::{Error, Result};
use crate::lua::Lua;
use crate::stack::{check_stack, StackGuard};
use crate::value::{FromLua, IntoLua, Value};

/// A strong reference to a guest value, stored in the registry under `index`.
///
/// Every handle type (`Table`, `Function`, `AnyUserData`, `Thread`) is one of these. The value
/// stays reachable for the guest collector until the reference is dropped.
pub(crate) struct LuaRef<'lua> {
    pub(crate) lua: &'lua Lua,
    pub(crate) index: c_int,
}

impl<'lua> LuaRef<'lua> {
    pub(crate) fn to_pointer(&self) -> *const c_void {
        unsafe {
            let state = self.lua.state();
            let _sg = StackGuard::new(state);

            if check_stack(state, 1).is_err() {
                return std::ptr::null();
            }

            self.lua.push_ref_unchecked(self);
            ffi::lua_topointer(state, -1)
        }
    }
}

impl fmt::Debug for LuaRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ref({:p})", self.to_pointer())
    }
}

impl Clone for LuaRef<'_> {
    fn clone(&self) -> Self {
        self.lua.clone_ref(self)
    }
}

impl Drop for LuaRef<'_> {
    fn drop(&mut self) {
        self.lua.drop_ref(self);
    }
}

impl PartialEq for LuaRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.lua.main_state, other.lua.main_state)
            && self.to_pointer() == other.to_pointer()
    }
}

impl Lua {
    /// Pins the value on top of the stack, popping it.
    pub(crate) unsafe fn pop_ref(&self) -> LuaRef<'_> {
        let index = ffi::luaL_ref(self.state(), ffi::LUA_REGISTRYINDEX);
        LuaRef { lua: self, index }
    }

    /// Pushes the pinned value. The caller reserves the stack slot.
    pub(crate) unsafe fn push_ref(&self, lref: &LuaRef) -> Result<()> {
        if !std::ptr::eq(lref.lua.main_state, self.main_state) {
            return Err(Error::MismatchedLua);
        }

        self.push_ref_unchecked(lref);
        Ok(())
    }

    pub(crate) unsafe fn push_ref_unchecked(&self, lref: &LuaRef) {
        ffi::lua_rawgeti(
            self.state(),
            ffi::LUA_REGISTRYINDEX,
            lref.index as ffi::lua_Integer,
        );
    }

    pub(crate) fn clone_ref<'lua>(&'lua self, lref: &LuaRef<'lua>) -> LuaRef<'lua> {
        unsafe {
            let state = self.state();
            ffi::lua_checkstack(state, 1);
            self.push_ref_unchecked(lref);
            self.pop_ref()
        }
    }

    pub(crate) fn drop_ref(&self, lref: &LuaRef) {
        unsafe {
            ffi::luaL_unref(self.state(), ffi::LUA_REGISTRYINDEX, lref.index);
        }
    }

    /// Stores a value in the registry, returning a key that keeps it alive until it is removed.
    ///
    /// A key dropped without [`Lua::remove_registry_value`] is released on the next
    /// [`Lua::expire_registry_values`].
    pub fn create_registry_value<'lua, T: IntoLua<'lua>>(&'lua self, t: T) -> Result<RegistryKey> {
        let value = t.into_lua(self)?;

        if value.is_nil() {
            return Ok(RegistryKey {
                index: ffi::LUA_REFNIL,
                unref_list: self.extra.unref_list.clone(),
                removed: false,
            });
        }

        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 2)?;

            self.push_value(&value)?;
            let index = ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX);

            Ok(RegistryKey {
                index,
                unref_list: self.extra.unref_list.clone(),
                removed: false,
            })
        }
    }

    pub fn registry_value<'lua, T: FromLua<'lua>>(&'lua self, key: &RegistryKey) -> Result<T> {
        if !self.owns_registry_value(key) {
            return Err(Error::MismatchedRegistryKey);
        }

        let value = match key.index {
            ffi::LUA_REFNIL => Value::Nil,
            index => unsafe {
                let state = self.state();
                let _sg = StackGuard::new(state);
                check_stack(state, 1)?;

                ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, index as ffi::lua_Integer);
                self.pop_value(-1).unwrap_or(Value::Nil)
            },
        };

        T::from_lua(value, self)
    }

    /// Replaces the value behind `key`, keeping the key valid.
    pub fn replace_registry_value<'lua, T: IntoLua<'lua>>(
        &'lua self,
        key: &mut RegistryKey,
        t: T,
    ) -> Result<()> {
        if !self.owns_registry_value(key) {
            return Err(Error::MismatchedRegistryKey);
        }

        let value = t.into_lua(self)?;

        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 2)?;

            match (key.index, value.is_nil()) {
                (ffi::LUA_REFNIL, true) => {}
                (ffi::LUA_REFNIL, false) => {
                    self.push_value(&value)?;
                    key.index = ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX);
                }
                (index, true) => {
                    ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, index);
                    key.index = ffi::LUA_REFNIL;
                }
                (index, false) => {
                    self.push_value(&value)?;
                    ffi::lua_rawseti(state, ffi::LUA_REGISTRYINDEX, index as ffi::lua_Integer);
                }
            }
        }

        Ok(())
    }

    pub fn remove_registry_value(&self, mut key: RegistryKey) -> Result<()> {
        if !self.owns_registry_value(&key) {
            return Err(Error::MismatchedRegistryKey);
        }

        key.removed = true;

        if key.index != ffi::LUA_REFNIL {
            unsafe {
                ffi::luaL_unref(self.state(), ffi::LUA_REGISTRYINDEX, key.index);
            }
        }

        Ok(())
    }

    /// Returns true if `key` was created by this `Lua`.
    pub fn owns_registry_value(&self, key: &RegistryKey) -> bool {
        Rc::ptr_eq(&key.unref_list, &self.extra.unref_list)
    }

    /// Releases the registry slots of keys dropped since the last call.
    pub fn expire_registry_values(&self) {
        let expired = std::mem::take(&mut *self.extra.unref_list.borrow_mut());

        unsafe {
            let state = self.state();

            for index in expired {
                ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, index);
            }
        }
    }

    /// Sets a value in the registry under a string key.
    ///
    /// Names are shared with custom type metatables, avoid using a registered type name.
    pub fn set_named_registry_value<'lua, T: IntoLua<'lua>>(&'lua self, name: &str, t: T) -> Result<()> {
        let value = t.into_lua(self)?;

        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 3)?;

            crate::stack::push_bytes(state, name.as_bytes());
            self.push_value(&value)?;
            ffi::lua_rawset(state, ffi::LUA_REGISTRYINDEX);
        }

        Ok(())
    }

    pub fn named_registry_value<'lua, T: FromLua<'lua>>(&'lua self, name: &str) -> Result<T> {
        let value = unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 2)?;

            crate::stack::push_bytes(state, name.as_bytes());
            ffi::lua_rawget(state, ffi::LUA_REGISTRYINDEX);
            self.pop_value(-1).unwrap_or(Value::Nil)
        };

        T::from_lua(value, self)
    }

    pub fn unset_named_registry_value(&self, name: &str) -> Result<()> {
        self.set_named_registry_value(name, Value::Nil)
    }
}

/// An owned key into the registry, usable across `'lua` lifetimes.
pub struct RegistryKey {
    pub(crate) index: c_int,
    pub(crate) unref_list: Rc<RefCell<Vec<c_int>>>,
    removed: bool,
}

impl fmt::Debug for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RegistryKey({})", self.index)
    }
}

impl Drop for RegistryKey {
    fn drop(&mut self) {
        if self.removed || self.index == ffi::LUA_REFNIL {
            return;
        }

        if let Ok(mut list) = self.unref_list.try_borrow_mut() {
            list.push(self.index);
        }
    }
}

impl PartialEq for RegistryKey {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && Rc::ptr_eq(&self.unref_list, &other.unref_list)
    }
}
