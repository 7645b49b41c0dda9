use std::ffi::c_void;
use std::fmt;

use mlua_sys as ffi;

use crate::reference::LuaRef;
use crate::stack::{check_stack, StackGuard};

/// Status of a Lua thread (coroutine).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadStatus {
    /// The thread was just created or is suspended at a yield.
    Resumable,
    /// The thread finished its body or is currently running.
    Unresumable,
    /// The thread raised an error and cannot be resumed.
    Error,
}

/// Handle to a guest coroutine.
///
/// The binding does not drive coroutines itself; guest code resumes them through the
/// `coroutine` library.
#[derive(Clone)]
pub struct Thread<'lua>(pub(crate) LuaRef<'lua>);

impl<'lua> Thread<'lua> {
    /// Gets the status of the thread.
    pub fn status(&self) -> ThreadStatus {
        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);

            if check_stack(state, 1).is_err() {
                return ThreadStatus::Error;
            }

            lua.push_ref_unchecked(&self.0);
            let thread_state = ffi::lua_tothread(state, -1);

            if thread_state == state {
                return ThreadStatus::Unresumable;
            }

            match ffi::lua_status(thread_state) {
                ffi::LUA_YIELD => ThreadStatus::Resumable,
                ffi::LUA_OK if ffi::lua_gettop(thread_state) > 0 => ThreadStatus::Resumable,
                ffi::LUA_OK => ThreadStatus::Unresumable,
                _ => ThreadStatus::Error,
            }
        }
    }

    /// Converts the thread to a generic C pointer.
    ///
    /// There is no way to convert the pointer back to its original value.
    ///
    /// Typically this function is used only for hashing and debug information.
    #[inline]
    pub fn to_pointer(&self) -> *const c_void {
        self.0.to_pointer()
    }
}

impl fmt::Debug for Thread<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Thread({:?})", self.0)
    }
}

impl PartialEq for Thread<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

#[cfg(test)]
mod assertions {
    use super::*;

    static_assertions::assert_not_impl_any!(Thread<'_>: Send);
}
