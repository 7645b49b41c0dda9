use std::cell::{Cell, RefCell};
use std::ffi::{c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::{fmt, mem, ptr};

use mlua_sys as ffi;
use tracing::error;

use crate::error::{Error, Result};
use crate::lua::Lua;
use crate::reference::LuaRef;
use crate::stack::{callback_error, check_stack, push_bytes, StackGuard};
use crate::types::{Callback, CallbackKey, StaticCallback};
use crate::value::{FromLuaMulti, IntoLuaMulti, MultiValue, Value};

// registry key of the metatable shared by every callback upvalue
const CALLBACK_METATABLE: &str = "moonbind.callback";

/// Handle to a guest function, either compiled Lua or a host callback.
#[derive(Clone)]
pub struct Function<'lua>(pub(crate) LuaRef<'lua>);

impl PartialEq for Function<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<'lua> Function<'lua> {
    /// Calls the function, passing `args` as function arguments.
    ///
    /// The function's return values are converted to the generic type `R`.
    ///
    /// # Examples
    ///
    /// Call Lua's built-in `tostring` function:
    ///
    /// ```
    /// # use moonbind::{Function, Lua, Result};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let globals = lua.globals()?;
    ///
    /// let tostring: Function = globals.get("tostring")?;
    ///
    /// assert_eq!(tostring.call::<_, String>(123)?, "123");
    ///
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Call a function with multiple arguments:
    ///
    /// ```
    /// # use moonbind::{Function, Lua, Result};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let sum: Function = lua.load(
    ///     r#"
    ///         function(a, b)
    ///             return a + b
    ///         end
    /// "#).eval()?;
    ///
    /// assert_eq!(sum.call::<_, u32>((3, 4))?, 3 + 4);
    ///
    /// # Ok(())
    /// # }
    /// ```
    pub fn call<A: IntoLuaMulti<'lua>, R: FromLuaMulti<'lua>>(&self, args: A) -> Result<R> {
        let lua = self.0.lua;
        let args = args.into_lua_multi(lua)?;
        let nargs = c_int::try_from(args.len()).map_err(|_| Error::StackError)?;

        let results = unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, nargs + 2)?;

            let base = ffi::lua_gettop(state);

            lua.push_ref(&self.0)?;
            for arg in &args {
                lua.push_value(arg)?;
            }
            drop(args);

            let code = ffi::lua_pcall(state, nargs, ffi::LUA_MULTRET, 0);

            if code != ffi::LUA_OK {
                return Err(lua.pop_error(state, code));
            }
            lua.resume_pending_panic();

            let nresults = ffi::lua_gettop(state) - base;
            let mut results = MultiValue::with_lua_and_capacity(lua, nresults as usize);

            for _ in 0..nresults {
                results.push_front(lua.pop_value(-1).unwrap_or(Value::Nil));
            }

            results
        };

        R::from_lua_multi(results, lua)
    }

    /// Converts the function to a generic C pointer.
    ///
    /// There is no way to convert the pointer back to its original value.
    ///
    /// Typically this function is used only for hashing and debug information.
    #[inline]
    pub fn to_pointer(&self) -> *const c_void {
        self.0.to_pointer()
    }
}

impl fmt::Debug for Function<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Function({:?})", self.0)
    }
}

/// The single upvalue of every trampoline. Its `__gc` releases the host closure.
struct CallbackUpvalue {
    key: CallbackKey,
    lua: Weak<Cell<*const Lua>>,
}

impl Lua {
    /// Wraps a Rust function or closure, creating a callable Lua function handle to it.
    ///
    /// The function's return value is always a `Result`: If the function returns `Err`, the error
    /// is raised as a Lua error, which can be caught using `(x)pcall` or bubble up to the Rust code
    /// that invoked the Lua code. This allows using the `?` operator to propagate errors through
    /// intermediate Lua code.
    ///
    /// If the function returns `Ok`, the contained value will be converted to one or more Lua
    /// values. For details on Rust-to-Lua conversions, refer to the [`IntoLua`] and [`IntoLuaMulti`]
    /// traits.
    ///
    /// # Examples
    ///
    /// Create a function which prints its argument:
    ///
    /// ```
    /// # use moonbind::{Lua, Result};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let greet = lua.create_function(|_, name: String| {
    ///     println!("Hello, {}!", name);
    ///     Ok(())
    /// });
    /// # let _ = greet;    // used
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Use tuples to accept multiple arguments:
    ///
    /// ```
    /// # use moonbind::{Lua, Result};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let print_person = lua.create_function(|_, (name, age): (String, u8)| {
    ///     println!("{} is {} years old!", name, age);
    ///     Ok(())
    /// });
    /// # let _ = print_person;    // used
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// [`IntoLua`]: crate::IntoLua
    /// [`IntoLuaMulti`]: crate::IntoLuaMulti
    pub fn create_function<'lua, A, R, F>(&'lua self, func: F) -> Result<Function<'lua>>
    where
        A: FromLuaMulti<'lua>,
        R: IntoLuaMulti<'lua>,
        F: Fn(&'lua Lua, A) -> Result<R> + 'static,
    {
        let func: Callback<'lua> = Rc::new(move |lua: &'lua Lua, args: MultiValue<'lua>| {
            func(lua, A::from_lua_args(args, 1, None, lua)?)?.into_lua_multi(lua)
        });
        self.create_callback(func)
    }

    /// Wraps a Rust mutable closure, creating a callable Lua function handle to it.
    ///
    /// This is a version of [`create_function`] that accepts a FnMut argument. Calling it
    /// recursively from within itself fails with [`Error::RecursiveMutCallback`].
    ///
    /// [`create_function`]: #method.create_function
    pub fn create_function_mut<'lua, A, R, F>(&'lua self, func: F) -> Result<Function<'lua>>
    where
        A: FromLuaMulti<'lua>,
        R: IntoLuaMulti<'lua>,
        F: FnMut(&'lua Lua, A) -> Result<R> + 'static,
    {
        let func = RefCell::new(func);
        self.create_function(move |lua, args| {
            (*func
                .try_borrow_mut()
                .map_err(|_| Error::RecursiveMutCallback)?)(lua, args)
        })
    }

    pub(crate) fn create_callback<'lua>(
        &'lua self,
        func: Callback<'lua>,
    ) -> Result<Function<'lua>> {
        let func: StaticCallback = unsafe { mem::transmute(func) };
        let key = self.extra.callbacks.borrow_mut().insert(func);

        let result = unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);

            check_stack(state, 5).map(|_| {
                self.push_callback_upvalue(state, key);
                ffi::lua_pushcclosure(state, call_callback, 1);
                Function(self.pop_ref())
            })
        };

        if result.is_err() {
            let callback = self.extra.callbacks.borrow_mut().remove(key);
            drop(callback);
        }

        result
    }

    /// Pushes a fresh upvalue block for `key`. Needs four free slots.
    unsafe fn push_callback_upvalue(&self, state: *mut ffi::lua_State, key: CallbackKey) {
        let upvalue =
            ffi::lua_newuserdatauv(state, mem::size_of::<CallbackUpvalue>(), 0) as *mut CallbackUpvalue;

        ptr::write(
            upvalue,
            CallbackUpvalue {
                key,
                lua: Rc::downgrade(&self.self_ptr),
            },
        );

        push_bytes(state, CALLBACK_METATABLE.as_bytes());
        if ffi::lua_rawget(state, ffi::LUA_REGISTRYINDEX) == ffi::LUA_TNIL {
            ffi::lua_pop(state, 1);

            ffi::lua_createtable(state, 0, 1);
            ffi::lua_pushcfunction(state, drop_callback_upvalue);
            ffi::lua_setfield(state, -2, c"__gc".as_ptr());

            push_bytes(state, CALLBACK_METATABLE.as_bytes());
            ffi::lua_pushvalue(state, -2);
            ffi::lua_rawset(state, ffi::LUA_REGISTRYINDEX);
        }

        ffi::lua_setmetatable(state, -2);
    }
}

/// Swaps the running thread in for the duration of a callback.
struct ActiveState<'a> {
    lua: &'a Lua,
    previous: *mut ffi::lua_State,
}

impl<'a> ActiveState<'a> {
    fn enter(lua: &'a Lua, state: *mut ffi::lua_State) -> Self {
        ActiveState {
            lua,
            previous: lua.replace_state(state),
        }
    }
}

impl Drop for ActiveState<'_> {
    fn drop(&mut self) {
        self.lua.replace_state(self.previous);
    }
}

unsafe extern "C-unwind" fn call_callback(state: *mut ffi::lua_State) -> c_int {
    let upvalue = ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const CallbackUpvalue;

    if upvalue.is_null() {
        return 0;
    }

    let key = (*upvalue).key;
    let lua = match (*upvalue).lua.upgrade() {
        Some(self_ptr) => self_ptr.get(),
        None => return 0,
    };

    // the state is closing
    if lua.is_null() {
        return 0;
    }

    let lua: &'static Lua = &*lua;

    callback_error(state, &lua.extra, |nargs| {
        let callback = lua
            .extra
            .callbacks
            .borrow()
            .get(key)
            .cloned()
            .ok_or(Error::CallbackDestructed)?;

        let _active = ActiveState::enter(lua, state);

        let mut args = MultiValue::with_lua_and_capacity(lua, nargs as usize);
        for _ in 0..nargs {
            args.push_front(lua.pop_value(-1).unwrap_or(Value::Nil));
        }

        let results = callback(lua, args).map_err(|err| name_bad_argument(state, err))?;
        let nresults = c_int::try_from(results.len()).map_err(|_| Error::StackError)?;

        check_stack(state, nresults)?;
        for result in &results {
            lua.push_value(result)?;
        }

        Ok(nresults)
    })
}

/// Fills in the called function's name on argument errors, the way `luaL_argerror` does.
unsafe fn name_bad_argument(state: *mut ffi::lua_State, err: Error) -> Error {
    let (mut pos, name, cause) = match err {
        Error::BadArgument {
            to: None,
            pos,
            name,
            cause,
        } => (pos, name, cause),
        err => return err,
    };

    let mut ar: ffi::lua_Debug = mem::zeroed();
    let mut to = None;

    if ffi::lua_getstack(state, 0, &mut ar) != 0 && ffi::lua_getinfo(state, c"n".as_ptr(), &mut ar) != 0 {
        if !ar.name.is_null() {
            to = Some(CStr::from_ptr(ar.name).to_string_lossy().into_owned());
        }

        // `obj:method(x)` passes `obj` first
        if !ar.namewhat.is_null() && CStr::from_ptr(ar.namewhat).to_bytes() == b"method" && pos > 1 {
            pos -= 1;
        }
    }

    Error::BadArgument {
        to,
        pos,
        name,
        cause,
    }
}

unsafe extern "C-unwind" fn drop_callback_upvalue(state: *mut ffi::lua_State) -> c_int {
    let upvalue = ffi::lua_touserdata(state, 1) as *mut CallbackUpvalue;

    if upvalue.is_null() {
        return 0;
    }

    let CallbackUpvalue { key, lua } = ptr::read(upvalue);

    // never read twice, even if the block is resurrected
    ffi::lua_pushnil(state);
    ffi::lua_setmetatable(state, 1);

    let released = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(self_ptr) = lua.upgrade() else {
            return;
        };

        let lua = self_ptr.get();

        // closing: the callbacks are dropped with the state
        if lua.is_null() {
            return;
        }

        let callback = match (*lua).extra.callbacks.try_borrow_mut() {
            Ok(mut callbacks) => callbacks.remove(key),
            Err(_) => None,
        };

        drop(callback);
    }));

    if released.is_err() {
        error!(target: "moonbind", "panic while releasing a host callback");
    }

    0
}

#[cfg(test)]
mod assertions {
    use super::*;

    static_assertions::assert_not_impl_any!(Function<'_>: Send);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn failed_calls_leave_the_stack_balanced() -> Result<()> {
        let lua = Lua::new();
        let fail = lua.create_function(|_, n: i64| -> Result<()> {
            Err(Error::runtime(format!("failed with {n}")))
        })?;

        let top = unsafe { ffi::lua_gettop(lua.state()) };
        for n in 0..10 {
            let err = fail.call::<_, ()>(n).unwrap_err();
            assert_eq!(err.to_string(), format!("failed with {n}"));
        }
        assert_eq!(unsafe { ffi::lua_gettop(lua.state()) }, top);

        Ok(())
    }

    #[test]
    fn bad_arguments_from_methods_skip_the_receiver() -> Result<()> {
        let lua = Lua::new();
        let method = lua.create_function(|_, (_this, n): (Value, i64)| Ok(n))?;
        lua.globals()?.set("obj", lua.create_table_from([("method", method)])?)?;

        let err = lua.load("obj:method('x')").exec().unwrap_err();
        assert_eq!(
            err.to_string(),
            "bad argument #1 to 'method' (i64 expected, got string)"
        );

        Ok(())
    }
}
