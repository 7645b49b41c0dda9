use std::any::Any;
use std::ffi::{c_int, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::{ptr, slice};

use mlua_sys as ffi;

use crate::error::{Error, Result};
use crate::function::Function;
use crate::lua::{ExtraData, Lua};
use crate::string::String;
use crate::table::Table;
use crate::thread::Thread;
use crate::types::LightUserData;
use crate::userdata::AnyUserData;
use crate::value::Value;

/// Restores the stack top when dropped.
///
/// Only shrinks the stack: values a caller intentionally left below the saved top are kept.
pub(crate) struct StackGuard {
    state: *mut ffi::lua_State,
    top: c_int,
}

impl StackGuard {
    #[inline]
    pub(crate) unsafe fn new(state: *mut ffi::lua_State) -> StackGuard {
        StackGuard {
            state,
            top: ffi::lua_gettop(state),
        }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        unsafe {
            if ffi::lua_gettop(self.state) > self.top {
                ffi::lua_settop(self.state, self.top);
            }
        }
    }
}

#[inline]
pub(crate) unsafe fn check_stack(state: *mut ffi::lua_State, n: c_int) -> Result<()> {
    if ffi::lua_checkstack(state, n) != 0 {
        Ok(())
    } else {
        Err(Error::StackError)
    }
}

#[inline]
pub(crate) unsafe fn push_bytes(state: *mut ffi::lua_State, bytes: &[u8]) {
    ffi::lua_pushlstring(state, bytes.as_ptr() as *const _, bytes.len());
}

/// Copies the string at `index` out of the guest. Numbers are converted in place.
pub(crate) unsafe fn to_bytes<'a>(state: *mut ffi::lua_State, index: c_int) -> Option<&'a [u8]> {
    let mut len = 0;
    let data = ffi::lua_tolstring(state, index, &mut len);

    if data.is_null() {
        return None;
    }

    Some(slice::from_raw_parts(data as *const u8, len))
}

pub(crate) unsafe fn type_name(state: *mut ffi::lua_State, index: c_int) -> &'static str {
    let name = ffi::lua_typename(state, ffi::lua_type(state, index));
    CStr::from_ptr(name).to_str().unwrap_or("?")
}

// Helpers run inside `lua_pcall`. Arguments start at index 1.

pub(crate) unsafe extern "C-unwind" fn safe_gettable(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_gettable(state, 1);
    1
}

pub(crate) unsafe extern "C-unwind" fn safe_settable(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_settable(state, 1);
    0
}

pub(crate) unsafe extern "C-unwind" fn safe_rawset(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_rawset(state, 1);
    0
}

pub(crate) unsafe extern "C-unwind" fn safe_len(state: *mut ffi::lua_State) -> c_int {
    let len = ffi::luaL_len(state, 1);
    ffi::lua_pushinteger(state, len);
    1
}

pub(crate) unsafe extern "C-unwind" fn safe_equal(state: *mut ffi::lua_State) -> c_int {
    let equal = ffi::lua_compare(state, 1, 2, ffi::LUA_OPEQ);
    ffi::lua_pushboolean(state, equal);
    1
}

pub(crate) unsafe extern "C-unwind" fn safe_tostring(state: *mut ffi::lua_State) -> c_int {
    ffi::luaL_tolstring(state, 1, ptr::null_mut());
    1
}

/// Advances a raw traversal, always leaving two results. A nil key marks the end.
pub(crate) unsafe extern "C-unwind" fn safe_next(state: *mut ffi::lua_State) -> c_int {
    if ffi::lua_next(state, 1) == 0 {
        ffi::lua_pushnil(state);
        ffi::lua_pushnil(state);
    }
    2
}

#[inline]
unsafe fn is_panic_sentinel(state: *mut ffi::lua_State, index: c_int, sentinel: c_int) -> bool {
    ffi::lua_type(state, index) == ffi::LUA_TLIGHTUSERDATA
        && ffi::lua_touserdata(state, index) == ffi::lua_touserdata(state, sentinel)
}

/// Replacement for the base library `pcall` that lets a host panic through.
///
/// Upvalue 1 is the panic sentinel of the owning state.
pub(crate) unsafe extern "C-unwind" fn safe_pcall(state: *mut ffi::lua_State) -> c_int {
    ffi::luaL_checkany(state, 1);

    match ffi::lua_pcall(state, ffi::lua_gettop(state) - 1, ffi::LUA_MULTRET, 0) {
        ffi::LUA_OK => {
            ffi::lua_pushboolean(state, 1);
            ffi::lua_insert(state, 1);
            ffi::lua_gettop(state)
        }
        _ if is_panic_sentinel(state, -1, ffi::lua_upvalueindex(1)) => ffi::lua_error(state),
        _ => {
            ffi::lua_pushboolean(state, 0);
            ffi::lua_insert(state, -2);
            2
        }
    }
}

/// Message handler installed by [`safe_xpcall`]. Upvalue 1 is the guest handler, upvalue 2 the
/// panic sentinel, which is passed through untouched.
unsafe extern "C-unwind" fn xpcall_message_handler(state: *mut ffi::lua_State) -> c_int {
    if is_panic_sentinel(state, 1, ffi::lua_upvalueindex(2)) {
        return 1;
    }

    ffi::lua_pushvalue(state, ffi::lua_upvalueindex(1));
    ffi::lua_insert(state, 1);
    ffi::lua_call(state, ffi::lua_gettop(state) - 1, ffi::LUA_MULTRET);
    ffi::lua_gettop(state)
}

/// Replacement for the base library `xpcall` that lets a host panic through.
///
/// Upvalue 1 is the panic sentinel of the owning state.
pub(crate) unsafe extern "C-unwind" fn safe_xpcall(state: *mut ffi::lua_State) -> c_int {
    ffi::luaL_checktype(state, 2, ffi::LUA_TFUNCTION);
    ffi::luaL_checkstack(state, 2, ptr::null());

    // [f, handler, args...] becomes [message handler, f, args...]
    ffi::lua_pushvalue(state, 2);
    ffi::lua_pushvalue(state, ffi::lua_upvalueindex(1));
    ffi::lua_pushcclosure(state, xpcall_message_handler, 2);
    ffi::lua_copy(state, 1, 2);
    ffi::lua_replace(state, 1);

    match ffi::lua_pcall(state, ffi::lua_gettop(state) - 2, ffi::LUA_MULTRET, 1) {
        ffi::LUA_OK => {
            ffi::lua_pushboolean(state, 1);
            ffi::lua_replace(state, 1);
            ffi::lua_gettop(state)
        }
        _ if is_panic_sentinel(state, -1, ffi::lua_upvalueindex(1)) => ffi::lua_error(state),
        _ => {
            ffi::lua_pushboolean(state, 0);
            ffi::lua_replace(state, 1);
            2
        }
    }
}

/// Runs the host side of a trampoline, turning an `Err` or a panic into a guest error.
///
/// Nothing with a destructor may be alive when `lua_error` unwinds past this frame, so the
/// error message is pushed and dropped before raising.
pub(crate) unsafe fn callback_error<F>(
    state: *mut ffi::lua_State,
    extra: &ExtraData,
    f: F,
) -> c_int
where
    F: FnOnce(c_int) -> Result<c_int>,
{
    let nargs = ffi::lua_gettop(state);

    match panic::catch_unwind(AssertUnwindSafe(|| f(nargs))) {
        Ok(Ok(nresults)) => return nresults,
        Ok(Err(err)) => {
            let message = err.to_string();
            drop(err);

            ffi::lua_settop(state, 0);
            push_bytes(state, message.as_bytes());
            drop(message);
        }
        Err(panic) => {
            extra.pending_panic.set(Some(panic));

            ffi::lua_settop(state, 0);
            ffi::lua_pushlightuserdata(state, extra.panic_sentinel());
        }
    }

    ffi::lua_error(state)
}

impl Lua {
    /// Pushes `value` onto the active stack. The caller reserves the slot.
    pub(crate) unsafe fn push_value(&self, value: &Value) -> Result<()> {
        let state = self.state();

        match value {
            Value::Nil => ffi::lua_pushnil(state),
            Value::Boolean(b) => ffi::lua_pushboolean(state, *b as c_int),
            Value::LightUserData(ud) => ffi::lua_pushlightuserdata(state, ud.0),
            Value::Integer(i) => ffi::lua_pushinteger(state, *i),
            Value::Number(n) => ffi::lua_pushnumber(state, *n),
            Value::String(s) => push_bytes(state, s.as_bytes()),
            Value::Table(t) => self.push_ref(&t.0)?,
            Value::Function(f) => self.push_ref(&f.0)?,
            Value::UserData(ud) => self.push_ref(&ud.0)?,
            Value::Thread(t) => self.push_ref(&t.0)?,
        }

        Ok(())
    }

    /// Converts the slot at `position` into a [`Value`] and removes it.
    ///
    /// Positions may be absolute or relative to the top. A slot that maps to no value, such as
    /// a position past the top, yields `None` and leaves the stack untouched.
    pub(crate) unsafe fn pop_value(&self, position: c_int) -> Option<Value<'_>> {
        let state = self.state();
        let ty = ffi::lua_type(state, position);

        if ty == ffi::LUA_TNONE || position <= ffi::LUA_REGISTRYINDEX {
            return None;
        }

        let index = ffi::lua_absindex(state, position);

        if index != ffi::lua_gettop(state) {
            ffi::lua_pushvalue(state, index);
            ffi::lua_remove(state, index);
        }

        let value = match ty {
            ffi::LUA_TNIL => {
                ffi::lua_pop(state, 1);
                Value::Nil
            }
            ffi::LUA_TBOOLEAN => {
                let b = ffi::lua_toboolean(state, -1) != 0;
                ffi::lua_pop(state, 1);
                Value::Boolean(b)
            }
            ffi::LUA_TLIGHTUSERDATA => {
                let ud = ffi::lua_touserdata(state, -1);
                ffi::lua_pop(state, 1);
                Value::LightUserData(LightUserData(ud))
            }
            ffi::LUA_TNUMBER => {
                let value = if ffi::lua_isinteger(state, -1) != 0 {
                    Value::Integer(ffi::lua_tointeger(state, -1))
                } else {
                    Value::Number(ffi::lua_tonumber(state, -1))
                };
                ffi::lua_pop(state, 1);
                value
            }
            ffi::LUA_TSTRING => {
                let s = String::from_bytes(to_bytes(state, -1).unwrap_or_default());
                ffi::lua_pop(state, 1);
                Value::String(s)
            }
            ffi::LUA_TTABLE => Value::Table(Table(self.pop_ref())),
            ffi::LUA_TFUNCTION => Value::Function(Function(self.pop_ref())),
            ffi::LUA_TUSERDATA => Value::UserData(AnyUserData(self.pop_ref())),
            ffi::LUA_TTHREAD => Value::Thread(Thread(self.pop_ref())),
            _ => {
                ffi::lua_pop(state, 1);
                Value::Nil
            }
        };

        Some(value)
    }

    /// Calls `f` under `lua_pcall` with the top `nargs` values as arguments, leaving `nresults`
    /// results in their place. Any guest error raised by `f` is returned instead of unwinding.
    pub(crate) unsafe fn protect_lua(
        &self,
        state: *mut ffi::lua_State,
        nargs: c_int,
        nresults: c_int,
        f: ffi::lua_CFunction,
    ) -> Result<()> {
        check_stack(state, 2)?;

        ffi::lua_pushcfunction(state, f);
        ffi::lua_rotate(state, -(nargs + 1), 1);

        match ffi::lua_pcall(state, nargs, nresults, 0) {
            ffi::LUA_OK => {
                self.resume_pending_panic();
                Ok(())
            }
            code => Err(self.pop_error(state, code)),
        }
    }

    /// Resumes a host panic the guest caught and discarded, for instance through
    /// `coroutine.resume`, once control is back at the host call site.
    pub(crate) fn resume_pending_panic(&self) {
        if let Some(panic) = self.extra.pending_panic.take() {
            resume_panic(panic);
        }
    }

    /// Pops the error object left by a failed call and converts it.
    ///
    /// A host panic carried through the guest is resumed here.
    pub(crate) unsafe fn pop_error(&self, state: *mut ffi::lua_State, code: c_int) -> Error {
        if ffi::lua_type(state, -1) == ffi::LUA_TLIGHTUSERDATA
            && ffi::lua_touserdata(state, -1) == self.extra.panic_sentinel()
        {
            ffi::lua_pop(state, 1);

            if let Some(panic) = self.extra.pending_panic.take() {
                resume_panic(panic);
            }

            return Error::runtime("host callback panicked");
        }

        let message = match ffi::lua_type(state, -1) {
            ffi::LUA_TSTRING | ffi::LUA_TNUMBER => to_bytes(state, -1)
                .map(|bytes| std::string::String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default(),
            _ => format!(
                "({} object at {:p})",
                type_name(state, -1),
                ffi::lua_topointer(state, -1)
            ),
        };
        ffi::lua_pop(state, 1);

        match code {
            ffi::LUA_ERRSYNTAX => Error::SyntaxError {
                incomplete_input: message.ends_with("<eof>"),
                message,
            },
            ffi::LUA_ERRMEM => Error::MemoryError(message),
            _ => Error::RuntimeError(message),
        }
    }
}

fn resume_panic(panic: Box<dyn Any + Send>) -> ! {
    panic::resume_unwind(panic)
}
