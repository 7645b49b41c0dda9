use std::any::TypeId;
use std::cell::{Ref, RefCell, RefMut};
use std::ffi::{c_int, c_void};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::string::String as StdString;
use std::{fmt, mem, ptr};

use mlua_sys as ffi;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::function::Function;
use crate::lua::{ExtraData, Lua};
use crate::reference::LuaRef;
use crate::stack::{callback_error, check_stack, push_bytes, safe_equal, to_bytes, StackGuard};
use crate::table::Table;
use crate::types::Callback;
use crate::value::{FromLuaMulti, IntoLua, IntoLuaMulti, MultiValue, Value};

/// A host type that can live inside guest-managed memory.
///
/// The type is registered once with [`Lua::create_custom_type`], after which values are moved
/// into the guest with [`Lua::create_userdata`].
///
/// # Examples
///
/// ```
/// # use moonbind::{Lua, Result, UserDataType};
/// # fn main() -> Result<()> {
/// # let lua = Lua::new();
/// struct Counter(i64);
///
/// impl UserDataType for Counter {
///     const TYPE_NAME: &'static str = "Counter";
/// }
///
/// lua.create_custom_type::<Counter>(|ty| {
///     ty.add_method("get", |_, this, ()| Ok(this.0))?;
///     ty.add_method_mut("bump", |_, this, by: i64| {
///         this.0 += by;
///         Ok(())
///     })
/// })?;
///
/// lua.globals()?.set("counter", lua.create_userdata(Counter(1))?)?;
/// let value: i64 = lua.load("counter:bump(2); return counter:get()").eval()?;
/// assert_eq!(value, 3);
/// # Ok(())
/// # }
/// ```
pub trait UserDataType: 'static {
    /// Name of the registry entry holding the type's metatable, also used as `__name`.
    const TYPE_NAME: &'static str;
}

type FinalizeHook<T> = Box<dyn Fn(&mut T)>;
type EqualsHook<T> = Box<dyn Fn(&T, &T) -> bool>;

/// Hooks of one registration, owned by the `Lua` until the state is closed.
struct TypeHooks<T> {
    lua: Weak<std::cell::Cell<*const Lua>>,
    finalize: Option<FinalizeHook<T>>,
    equals: Option<EqualsHook<T>>,
}

/// Describes a custom type while it is being registered.
///
/// Created by [`Lua::create_custom_type`]. Everything added here lands in the table that
/// becomes the metatable and `__index` of every instance.
pub struct CustomType<'lua, T> {
    lua: &'lua Lua,
    table: Table<'lua>,
    finalize: Option<FinalizeHook<T>>,
    equals: Option<EqualsHook<T>>,
    _phantom: PhantomData<T>,
}

impl<'lua, T: UserDataType> CustomType<'lua, T> {
    /// Sets a plain field shared by every instance.
    ///
    /// Metamethods such as `__tostring` or `__add` can be set this way too.
    pub fn set_field<V: IntoLua<'lua>>(&mut self, name: &str, value: V) -> Result<()> {
        self.table.raw_set(name, value)
    }

    /// Adds a function that does not take the instance, reachable as `Type.name(...)` from any
    /// instance.
    pub fn add_function<A, R, F>(&mut self, name: &str, function: F) -> Result<()>
    where
        A: FromLuaMulti<'lua>,
        R: IntoLuaMulti<'lua>,
        F: Fn(&'lua Lua, A) -> Result<R> + 'static,
    {
        let function = self.lua.create_function(function)?;
        self.table.raw_set(name, function)
    }

    /// Adds a method called as `obj:name(...)`, borrowing the instance immutably.
    pub fn add_method<A, R, M>(&mut self, name: &str, method: M) -> Result<()>
    where
        A: FromLuaMulti<'lua>,
        R: IntoLuaMulti<'lua>,
        M: Fn(&'lua Lua, &T, A) -> Result<R> + 'static,
    {
        let callback: Callback<'lua> = Rc::new(move |lua: &'lua Lua, mut args: MultiValue<'lua>| {
            let this = method_self::<T>(args.pop_front())?;
            let this = this.borrow::<T>()?;
            let args = A::from_lua_args(args, 2, None, lua)?;

            method(lua, &this, args)?.into_lua_multi(lua)
        });

        let method = self.lua.create_callback(callback)?;
        self.table.raw_set(name, method)
    }

    /// Adds a method called as `obj:name(...)`, borrowing the instance mutably.
    ///
    /// Calling it while the same instance is already borrowed, for example from inside another
    /// of its methods, fails with [`Error::UserDataBorrowMutError`].
    pub fn add_method_mut<A, R, M>(&mut self, name: &str, method: M) -> Result<()>
    where
        A: FromLuaMulti<'lua>,
        R: IntoLuaMulti<'lua>,
        M: Fn(&'lua Lua, &mut T, A) -> Result<R> + 'static,
    {
        let callback: Callback<'lua> = Rc::new(move |lua: &'lua Lua, mut args: MultiValue<'lua>| {
            let this = method_self::<T>(args.pop_front())?;
            let mut this = this.borrow_mut::<T>()?;
            let args = A::from_lua_args(args, 2, None, lua)?;

            method(lua, &mut this, args)?.into_lua_multi(lua)
        });

        let method = self.lua.create_callback(callback)?;
        self.table.raw_set(name, method)
    }

    /// Sets a hook run on the value right before it is dropped by the guest collector.
    pub fn on_finalize(&mut self, hook: impl Fn(&mut T) + 'static) {
        self.finalize = Some(Box::new(hook));
    }

    /// Sets the hook behind `==` between two instances. Without it instances compare by
    /// identity.
    pub fn on_equals(&mut self, hook: impl Fn(&T, &T) -> bool + 'static) {
        self.equals = Some(Box::new(hook));
    }
}

/// Mirrors `LUAI_MAXALIGN`, the strictest alignment a userdata block is guaranteed.
#[allow(dead_code)]
#[repr(C)]
union MaxAlign {
    n: ffi::lua_Number,
    u: f64,
    s: *mut c_void,
    i: ffi::lua_Integer,
    l: std::ffi::c_long,
}

/// Resolves the receiver of a method call. Light userdata is never a valid receiver.
fn method_self<'lua, T: UserDataType>(value: Option<Value<'lua>>) -> Result<AnyUserData<'lua>> {
    let value = value.unwrap_or(Value::Nil);

    match value {
        Value::UserData(ud) => Ok(ud),
        other => Err(Error::bad_argument(
            None,
            1,
            Some("self"),
            Error::from_lua_conversion(other.type_name(), T::TYPE_NAME, None),
        )),
    }
}

impl Lua {
    /// Registers `T` as a custom type.
    ///
    /// `setup` fills a fresh table with fields and methods. The table is stored in the registry
    /// under [`UserDataType::TYPE_NAME`] and becomes the metatable of every instance created
    /// afterwards. Registering the same name again replaces the registration; instances created
    /// earlier keep the metatable and hooks they were created with.
    pub fn create_custom_type<'lua, T: UserDataType>(
        &'lua self,
        setup: impl FnOnce(&mut CustomType<'lua, T>) -> Result<()>,
    ) -> Result<()> {
        if mem::align_of::<RefCell<T>>() > mem::align_of::<MaxAlign>() {
            return Err(Error::UnsupportedAlignment {
                type_name: T::TYPE_NAME,
                align: mem::align_of::<RefCell<T>>(),
            });
        }

        let mut custom_type = CustomType {
            lua: self,
            table: self.create_table()?,
            finalize: None,
            equals: None,
            _phantom: PhantomData,
        };

        setup(&mut custom_type)?;

        let CustomType {
            table,
            finalize,
            equals,
            ..
        } = custom_type;
        let has_equals = equals.is_some();

        let hooks = Box::new(TypeHooks::<T> {
            lua: Rc::downgrade(&self.self_ptr),
            finalize,
            equals,
        });
        let hooks_ptr = &*hooks as *const TypeHooks<T> as *mut c_void;
        self.extra.type_hooks.borrow_mut().push(hooks);

        table.raw_set("__index", table.clone())?;
        table.raw_set("__name", T::TYPE_NAME)?;
        let gc = self.create_hook_closure(finalize_userdata::<T>, hooks_ptr, &table)?;
        table.raw_set("__gc", gc)?;
        if has_equals {
            let eq = self.create_hook_closure(compare_userdata::<T>, hooks_ptr, &table)?;
            table.raw_set("__eq", eq)?;
        }

        self.set_named_registry_value(T::TYPE_NAME, table.clone())?;

        // pinned so the address can not be handed to another table
        let pinned = unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 1)?;

            self.push_ref(&table.0)?;
            ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX)
        };
        self.extra.pinned_metatables.borrow_mut().push(pinned);
        self.extra
            .custom_types
            .borrow_mut()
            .insert(table.to_pointer(), TypeId::of::<T>());

        debug!(target: "moonbind", type_name = T::TYPE_NAME, "registered custom type");

        Ok(())
    }

    /// Moves `value` into a new userdata block carrying the metatable currently registered for
    /// `T`.
    ///
    /// Fails with [`Error::UnregisteredType`] if [`Lua::create_custom_type`] was not called for
    /// `T` yet.
    pub fn create_userdata<T: UserDataType>(&self, value: T) -> Result<AnyUserData<'_>> {
        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 3)?;

            push_bytes(state, T::TYPE_NAME.as_bytes());
            if ffi::lua_rawget(state, ffi::LUA_REGISTRYINDEX) != ffi::LUA_TTABLE {
                return Err(Error::UnregisteredType(T::TYPE_NAME));
            }

            let metatable = ffi::lua_topointer(state, -1);
            if self.extra.custom_types.borrow().get(&metatable) != Some(&TypeId::of::<T>()) {
                return Err(Error::UserDataTypeMismatch);
            }

            // allocate, initialize, then attach the metatable
            let block = ffi::lua_newuserdatauv(state, mem::size_of::<RefCell<T>>(), 0) as *mut RefCell<T>;
            ptr::write(block, RefCell::new(value));
            ffi::lua_rotate(state, -2, 1);
            ffi::lua_setmetatable(state, -2);

            Ok(AnyUserData(self.pop_ref()))
        }
    }

    /// Returns the registered type table of `T`, if any.
    pub fn custom_type_table<T: UserDataType>(&self) -> Result<Option<Table<'_>>> {
        self.named_registry_value(T::TYPE_NAME)
    }

    /// Hook closures carry the hooks as upvalue 1 and the type table as upvalue 2.
    fn create_hook_closure<'lua>(
        &'lua self,
        hook: ffi::lua_CFunction,
        hooks: *mut c_void,
        metatable: &Table<'lua>,
    ) -> Result<Function<'lua>> {
        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 3)?;

            ffi::lua_pushlightuserdata(state, hooks);
            self.push_ref(&metatable.0)?;
            ffi::lua_pushcclosure(state, hook, 2);
            Ok(Function(self.pop_ref()))
        }
    }
}

/// Locates the host value of `T` in the userdata at `index`, checking the metatable against the
/// registered types. A finalized block has no metatable and is never matched.
unsafe fn userdata_cell<T: 'static>(
    extra: &ExtraData,
    state: *mut ffi::lua_State,
    index: c_int,
) -> Option<*mut RefCell<T>> {
    let index = ffi::lua_absindex(state, index);

    if ffi::lua_type(state, index) != ffi::LUA_TUSERDATA {
        return None;
    }

    if ffi::lua_getmetatable(state, index) == 0 {
        return None;
    }

    let metatable = ffi::lua_topointer(state, -1);
    ffi::lua_pop(state, 1);

    match extra.custom_types.borrow().get(&metatable) {
        Some(type_id) if *type_id == TypeId::of::<T>() => {
            Some(ffi::lua_touserdata(state, index) as *mut RefCell<T>)
        }
        _ => None,
    }
}

/// Whether the value at `index` is a full userdata whose metatable is the type table held in
/// upvalue 2. Works during `lua_close`, when the host side is already unreachable.
unsafe fn is_live_instance(state: *mut ffi::lua_State, index: c_int) -> bool {
    if ffi::lua_type(state, index) != ffi::LUA_TUSERDATA
        || ffi::lua_getmetatable(state, index) == 0
    {
        return false;
    }

    let matches = ffi::lua_rawequal(state, -1, ffi::lua_upvalueindex(2)) != 0;
    ffi::lua_pop(state, 1);
    matches
}

/// Reachable from guest code as `o.__gc`, so the argument is checked before the block is read.
unsafe extern "C-unwind" fn finalize_userdata<T: 'static>(state: *mut ffi::lua_State) -> c_int {
    let hooks = ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const TypeHooks<T>;

    if hooks.is_null() || ffi::lua_checkstack(state, 1) == 0 || !is_live_instance(state, 1) {
        return 0;
    }

    let block = ffi::lua_touserdata(state, 1) as *mut RefCell<T>;

    let finalized = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut value = ptr::read(block).into_inner();

        if let Some(finalize) = &(*hooks).finalize {
            finalize(&mut value);
        }

        drop(value);
    }));

    // never unwrapped again, even if the block is resurrected
    ffi::lua_pushnil(state);
    ffi::lua_setmetatable(state, 1);

    if finalized.is_err() {
        error!(target: "moonbind", "panic while finalizing a custom type instance");
    }

    0
}

unsafe extern "C-unwind" fn compare_userdata<T: 'static>(state: *mut ffi::lua_State) -> c_int {
    let hooks = ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const TypeHooks<T>;

    let lua = match hooks.as_ref().and_then(|hooks| hooks.lua.upgrade()) {
        Some(self_ptr) => self_ptr.get(),
        None => ptr::null(),
    };

    if lua.is_null() {
        ffi::lua_pushboolean(state, ffi::lua_rawequal(state, 1, 2));
        return 1;
    }

    let extra = &(*lua).extra;

    callback_error(state, extra, |_| {
        let equal = match (
            userdata_cell::<T>(extra, state, 1),
            userdata_cell::<T>(extra, state, 2),
        ) {
            (Some(a), Some(b)) if a == b => true,
            (Some(a), Some(b)) => {
                let a = (*a).try_borrow().map_err(|_| Error::UserDataBorrowError)?;
                let b = (*b).try_borrow().map_err(|_| Error::UserDataBorrowError)?;

                match &(*hooks).equals {
                    Some(equals) => equals(&a, &b),
                    None => false,
                }
            }
            _ => false,
        };

        check_stack(state, 1)?;
        ffi::lua_pushboolean(state, equal as c_int);
        Ok(1)
    })
}

/// Handle to a full userdata block.
///
/// Light userdata is a separate [`Value`] variant and never converts to this type.
#[derive(Clone)]
pub struct AnyUserData<'lua>(pub(crate) LuaRef<'lua>);

impl<'lua> AnyUserData<'lua> {
    /// Checks whether the block holds a live value of type `T`.
    pub fn is<T: UserDataType>(&self) -> bool {
        self.cell::<T>().is_ok()
    }

    /// Borrows the host value immutably.
    ///
    /// Fails with [`Error::UserDataTypeMismatch`] if the block does not hold a `T` or was
    /// already finalized, and with [`Error::UserDataBorrowError`] if it is mutably borrowed.
    pub fn borrow<T: UserDataType>(&self) -> Result<Ref<'_, T>> {
        self.cell::<T>()?
            .try_borrow()
            .map_err(|_| Error::UserDataBorrowError)
    }

    /// Borrows the host value mutably.
    ///
    /// Fails with [`Error::UserDataTypeMismatch`] if the block does not hold a `T` or was
    /// already finalized, and with [`Error::UserDataBorrowMutError`] if it is borrowed.
    pub fn borrow_mut<T: UserDataType>(&self) -> Result<RefMut<'_, T>> {
        self.cell::<T>()?
            .try_borrow_mut()
            .map_err(|_| Error::UserDataBorrowMutError)
    }

    /// Returns the `__name` of the block's metatable.
    pub fn type_name(&self) -> Result<Option<StdString>> {
        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 3)?;

            lua.push_ref(&self.0)?;
            if ffi::lua_getmetatable(state, -1) == 0 {
                return Ok(None);
            }

            push_bytes(state, b"__name");
            if ffi::lua_rawget(state, -2) != ffi::LUA_TSTRING {
                return Ok(None);
            }

            Ok(to_bytes(state, -1).map(|name| StdString::from_utf8_lossy(name).into_owned()))
        }
    }

    /// Compares two userdata for equality, invoking `__eq` when the type has an equality hook.
    pub fn equals<T: AsRef<Self>>(&self, other: T) -> Result<bool> {
        let other = other.as_ref();
        if self == other {
            return Ok(true);
        }

        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 4)?;

            lua.push_ref(&self.0)?;
            lua.push_ref(&other.0)?;
            lua.protect_lua(state, 2, 1, safe_equal)?;

            Ok(ffi::lua_toboolean(state, -1) != 0)
        }
    }

    /// Converts the userdata to a generic C pointer.
    ///
    /// There is no way to convert the pointer back to its original value.
    #[inline]
    pub fn to_pointer(&self) -> *const c_void {
        self.0.to_pointer()
    }

    fn cell<T: UserDataType>(&self) -> Result<&RefCell<T>> {
        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 2)?;

            lua.push_ref(&self.0)?;

            // the block stays alive while this handle pins it
            match userdata_cell::<T>(&lua.extra, state, -1) {
                Some(cell) => Ok(&*cell),
                None => Err(Error::UserDataTypeMismatch),
            }
        }
    }
}

impl fmt::Debug for AnyUserData<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "UserData({:?})", self.0)
    }
}

impl PartialEq for AnyUserData<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<'lua> AsRef<AnyUserData<'lua>> for AnyUserData<'lua> {
    #[inline]
    fn as_ref(&self) -> &Self {
        self
    }
}

#[cfg(test)]
mod assertions {
    use super::*;

    static_assertions::assert_not_impl_any!(AnyUserData<'_>: Send);
}
