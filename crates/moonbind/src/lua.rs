use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::ffi::{c_int, c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use downcast::downcast;
use mlua_sys as ffi;
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use tracing::{debug, trace};

use crate::app_data::{AppDataRef, AppDataRefMut};
use crate::chunk::{AsChunk, Chunk, ChunkMode};
use crate::error::{Error, Result};
use crate::function::Function;
use crate::scope::Scope;
use crate::stack::{check_stack, safe_pcall, safe_xpcall, to_bytes, StackGuard};
use crate::stdlib::StdLib;
use crate::string::String;
use crate::table::Table;
use crate::thread::Thread;
use crate::types::{CallbackKey, Integer, Number, StaticCallback};
use crate::value::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, MultiValue, Value};

const MULTIVALUE_POOL_SIZE: usize = 64;

pub(crate) trait AppData: downcast::Any {}

impl<T: 'static> AppData for T {}

downcast!(dyn AppData);

/// Host-side state shared with trampolines and finalizers.
///
/// Boxed so its address stays put while the `Lua` handle moves. It is dropped after
/// `lua_close`, so finalizers running during close can still reach it.
pub(crate) struct ExtraData {
    pub(crate) callbacks: RefCell<SlotMap<CallbackKey, StaticCallback>>,
    /// Metatable pointer to the host type its instances hold.
    pub(crate) custom_types: RefCell<FxHashMap<*const c_void, TypeId>>,
    /// Finalize and equality hooks, addressed by `__gc`/`__eq` upvalues.
    pub(crate) type_hooks: RefCell<Vec<Box<dyn Any>>>,
    /// Registry refs keeping every registered metatable alive, so a pointer in
    /// `custom_types` is never reused by another table.
    pub(crate) pinned_metatables: RefCell<Vec<c_int>>,
    pub(crate) pending_panic: Cell<Option<Box<dyn Any + Send>>>,
    pub(crate) unref_list: Rc<RefCell<Vec<c_int>>>,
    app_data: UnsafeCell<FxHashMap<TypeId, Box<dyn AppData>>>,
    app_data_borrows: Cell<usize>,
    file_prefix: RefCell<Option<PathBuf>>,
    multivalue_pool: RefCell<Vec<Vec<Value<'static>>>>,
}

impl ExtraData {
    fn new() -> Self {
        ExtraData {
            callbacks: RefCell::new(SlotMap::with_key()),
            custom_types: Default::default(),
            type_hooks: Default::default(),
            pinned_metatables: Default::default(),
            pending_panic: Cell::new(None),
            unref_list: Default::default(),
            app_data: Default::default(),
            app_data_borrows: Cell::new(0),
            file_prefix: RefCell::new(None),
            multivalue_pool: Default::default(),
        }
    }

    /// Error object standing in for a host panic while it travels through the guest.
    #[inline]
    pub(crate) fn panic_sentinel(&self) -> *mut c_void {
        &self.pending_panic as *const _ as *mut c_void
    }
}

/// Options for a new [`Lua`] state.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct LuaOptions {
    /// Base directory for relative script paths. See [`Lua::set_file_prefix`].
    pub file_prefix: Option<PathBuf>,
}

impl LuaOptions {
    pub const fn new() -> Self {
        LuaOptions { file_prefix: None }
    }

    #[must_use]
    pub fn file_prefix(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_prefix = Some(dir.into());
        self
    }
}

/// An embedded Lua 5.4 state.
///
/// Every handle borrows the `Lua` it came from, so none of them can outlive it. Dropping the
/// state forces a full collection and then closes it, running every pending finalizer.
pub struct Lua {
    pub(crate) main_state: *mut ffi::lua_State,
    /// The thread currently running host code. Swapped by trampolines called from coroutines.
    state: Cell<*mut ffi::lua_State>,
    /// Refreshed on every entry into the guest, nulled on drop. Trampolines hold it weakly.
    pub(crate) self_ptr: Rc<Cell<*const Lua>>,
    pub(crate) extra: Box<ExtraData>,
    env_ref: Cell<c_int>,
}

impl fmt::Debug for Lua {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Lua({:p})", self.main_state)
    }
}

impl Default for Lua {
    fn default() -> Self {
        Lua::new()
    }
}

impl Drop for Lua {
    fn drop(&mut self) {
        self.self_ptr.set(std::ptr::null());

        unsafe {
            ffi::luaL_unref(self.main_state, ffi::LUA_REGISTRYINDEX, self.env_ref.get());
            ffi::lua_gc(self.main_state, ffi::LUA_GCCOLLECT, 0);
            ffi::lua_close(self.main_state);
        }

        trace!(target: "moonbind", state = ?self.main_state, "closed Lua state");
    }
}

impl Lua {
    /// Creates a new state with the safe subset of the standard libraries.
    ///
    /// # Panics
    ///
    /// Panics if the engine cannot allocate a state.
    pub fn new() -> Self {
        match Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default()) {
            Ok(lua) => lua,
            Err(err) => panic!("cannot create a Lua state: {err}"),
        }
    }

    /// Creates a new state opening only `libs`. [`StdLib::NONE`] leaves even the base library
    /// closed.
    pub fn new_with(libs: StdLib, options: LuaOptions) -> Result<Self> {
        let main_state = unsafe { ffi::luaL_newstate() };

        if main_state.is_null() {
            return Err(Error::MemoryError("cannot allocate a Lua state".to_string()));
        }

        let lua = Lua {
            main_state,
            state: Cell::new(main_state),
            self_ptr: Rc::new(Cell::new(std::ptr::null())),
            extra: Box::new(ExtraData::new()),
            env_ref: Cell::new(ffi::LUA_NOREF),
        };

        lua.load_from_std_lib(libs)?;
        lua.init_environment()?;

        if let Some(prefix) = &options.file_prefix {
            lua.set_file_prefix(prefix)?;
        }

        debug!(target: "moonbind", state = ?main_state, ?libs, "created Lua state");

        Ok(lua)
    }

    /// Returns the active thread, recording where `self` lives for trampolines.
    #[inline]
    pub(crate) fn state(&self) -> *mut ffi::lua_State {
        self.self_ptr.set(self);
        self.state.get()
    }

    /// Makes `state` the active thread, returning the previous one.
    #[inline]
    pub(crate) fn replace_state(&self, state: *mut ffi::lua_State) -> *mut ffi::lua_State {
        self.state.replace(state)
    }

    fn init_environment(&self) -> Result<()> {
        let env = self.create_table()?;
        let meta = self.create_table_with_capacity(0, 1)?;
        meta.raw_set("__index", self.globals()?)?;
        meta.become_metatable_for(&env)?;

        unsafe {
            let state = self.state();
            check_stack(state, 1)?;

            self.push_ref(&env.0)?;
            self.env_ref.set(ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX));
        }

        Ok(())
    }

    pub(crate) fn pop_multivalue_from_pool(&self) -> Option<Vec<Value<'_>>> {
        self.extra.multivalue_pool.borrow_mut().pop()
    }

    pub(crate) fn push_multivalue_to_pool(&self, mut multivalue: Vec<Value>) {
        // dropping the values releases their refs, which must happen outside the borrow
        multivalue.clear();

        let mut multivalue_pool = self.extra.multivalue_pool.borrow_mut();

        if multivalue_pool.len() < MULTIVALUE_POOL_SIZE {
            multivalue_pool.push(unsafe {
                std::mem::transmute::<Vec<Value<'_>>, Vec<Value<'static>>>(multivalue)
            });
        }
    }

    /// Loads the specified subset of the standard libraries into an existing Lua state.
    ///
    /// The base library is opened along with any other library.
    pub fn load_from_std_lib(&self, libs: StdLib) -> Result<()> {
        let libraries: [(StdLib, &CStr, ffi::lua_CFunction); 8] = [
            (StdLib::COROUTINE, c"coroutine", ffi::luaopen_coroutine),
            (StdLib::TABLE, c"table", ffi::luaopen_table),
            (StdLib::IO, c"io", ffi::luaopen_io),
            (StdLib::OS, c"os", ffi::luaopen_os),
            (StdLib::STRING, c"string", ffi::luaopen_string),
            (StdLib::UTF8, c"utf8", ffi::luaopen_utf8),
            (StdLib::MATH, c"math", ffi::luaopen_math),
            (StdLib::PACKAGE, c"package", ffi::luaopen_package),
        ];

        if libs.is_empty() {
            return Ok(());
        }

        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 3)?;

            ffi::luaL_requiref(state, c"_G".as_ptr(), ffi::luaopen_base, 1);
            // host panics must not be caught by guest error handling
            for (name, wrapper) in [
                (c"pcall", safe_pcall as ffi::lua_CFunction),
                (c"xpcall", safe_xpcall),
            ] {
                ffi::lua_pushlightuserdata(state, self.extra.panic_sentinel());
                ffi::lua_pushcclosure(state, wrapper, 1);
                ffi::lua_setfield(state, -2, name.as_ptr());
            }
            ffi::lua_pop(state, 1);

            for (flag, name, open) in libraries {
                if libs.contains(flag) {
                    ffi::luaL_requiref(state, name.as_ptr(), open, 1);
                    ffi::lua_pop(state, 1);
                }
            }

            if libs.contains(StdLib::DEBUG) {
                ffi::luaL_requiref(state, c"debug".as_ptr(), ffi::luaopen_debug, 1);
                ffi::lua_pop(state, 1);
            }
        }

        debug!(target: "moonbind", ?libs, "opened standard libraries");

        Ok(())
    }

    /// Perform a full garbage-collection cycle.
    ///
    /// Finalizers of unreachable userdata run before this returns.
    pub fn gc_collect(&self) -> Result<()> {
        unsafe {
            ffi::lua_gc(self.state(), ffi::LUA_GCCOLLECT, 0);
        }
        Ok(())
    }

    /// Returns the amount of memory (in bytes) currently used inside this Lua state.
    pub fn gc_count(&self) -> usize {
        unsafe {
            let state = self.state();
            let kbytes = ffi::lua_gc(state, ffi::LUA_GCCOUNT, 0) as usize;
            let bytes = ffi::lua_gc(state, ffi::LUA_GCCOUNTB, 0) as usize;
            kbytes * 1024 + bytes
        }
    }

    /// Returns Lua source code as a `Chunk` builder type.
    ///
    /// In order to actually compile or run the resulting code, you must call [`Chunk::exec`] or
    /// similar on the returned builder. Code is not even parsed until one of these methods is
    /// called. Paths are read relative to the file prefix.
    ///
    /// [`Chunk::exec`]: crate::Chunk::exec
    pub fn load<'lua, 'a>(&'lua self, chunk: impl AsChunk<'lua, 'a>) -> Chunk<'lua, 'a> {
        Chunk::new(self, chunk)
    }

    /// Compiles `chunk` and calls it with `args`, returning every result.
    pub fn eval<'lua, 'a>(
        &'lua self,
        chunk: impl AsChunk<'lua, 'a>,
        args: impl IntoLuaMulti<'lua>,
    ) -> Result<MultiValue<'lua>> {
        self.load(chunk).call(args)
    }

    /// Returns the globals table.
    pub fn globals(&self) -> Result<Table<'_>> {
        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 1)?;

            ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS);
            Ok(Table(self.pop_ref()))
        }
    }

    /// Returns the top-level environment table.
    ///
    /// It starts out empty and reads through to the globals, so it can be handed to
    /// [`Chunk::set_environment`](crate::Chunk::set_environment) to keep a script's globals
    /// apart from the shared ones.
    pub fn environment(&self) -> Result<Table<'_>> {
        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 1)?;

            ffi::lua_rawgeti(
                state,
                ffi::LUA_REGISTRYINDEX,
                self.env_ref.get() as ffi::lua_Integer,
            );
            Ok(Table(self.pop_ref()))
        }
    }

    /// Returns the registry table. Custom type metatables live here under their type names.
    pub fn registry(&self) -> Result<Table<'_>> {
        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 1)?;

            ffi::lua_pushvalue(state, ffi::LUA_REGISTRYINDEX);
            Ok(Table(self.pop_ref()))
        }
    }

    #[inline]
    pub fn create_string(&self, s: impl AsRef<[u8]>) -> Result<String<'_>> {
        Ok(String::from_bytes(s.as_ref()))
    }

    /// Creates and returns a new empty table.
    pub fn create_table(&self) -> Result<Table<'_>> {
        self.create_table_with_capacity(0, 0)
    }

    /// Creates and returns a new empty table, with the specified capacity.
    /// `narr` is a hint for how many elements the table will have as a sequence;
    /// `nrec` is a hint for how many other elements the table will have.
    pub fn create_table_with_capacity(&self, narr: usize, nrec: usize) -> Result<Table<'_>> {
        let narr = c_int::try_from(narr).unwrap_or(c_int::MAX);
        let nrec = c_int::try_from(nrec).unwrap_or(c_int::MAX);

        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 1)?;

            ffi::lua_createtable(state, narr, nrec);
            Ok(Table(self.pop_ref()))
        }
    }

    /// Creates a table and fills it with values from an iterator.
    pub fn create_table_from<'lua, K, V, I>(&'lua self, iter: I) -> Result<Table<'lua>>
    where
        K: IntoLua<'lua>,
        V: IntoLua<'lua>,
        I: IntoIterator<Item = (K, V)>,
    {
        let table = self.create_table()?;

        for (k, v) in iter {
            table.raw_set(k, v)?;
        }

        Ok(table)
    }

    /// Creates a table from an iterator of values, using `1..` as the keys.
    pub fn create_sequence_from<'lua, T, I>(&'lua self, iter: I) -> Result<Table<'lua>>
    where
        T: IntoLua<'lua>,
        I: IntoIterator<Item = T>,
    {
        let iter = iter.into_iter();
        let table = self.create_table_with_capacity(iter.size_hint().0, 0)?;

        for (i, v) in iter.enumerate() {
            table.raw_set(i as Integer + 1, v)?;
        }

        Ok(table)
    }

    /// Creates a coroutine that will run `func` when resumed from guest code.
    pub fn create_thread<'lua>(&'lua self, func: Function<'lua>) -> Result<Thread<'lua>> {
        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 2)?;

            let thread_state = ffi::lua_newthread(state);
            self.push_ref(&func.0)?;
            ffi::lua_xmove(state, thread_state, 1);

            Ok(Thread(self.pop_ref()))
        }
    }

    /// Calls the given function with a `Scope` parameter, giving the function the ability to
    /// create callbacks from Rust closures that are not `'static`.
    ///
    /// Every callback created through the scope is invalidated when this call returns. A guest
    /// call to one afterwards fails with [`Error::CallbackDestructed`].
    pub fn scope<'lua, 'scope, R>(
        &'lua self,
        f: impl FnOnce(&Scope<'lua, 'scope>) -> Result<R>,
    ) -> Result<R>
    where
        'lua: 'scope,
    {
        f(&Scope::new(self))
    }

    /// Attempts to coerce a Lua value into a String in a manner consistent with Lua's internal
    /// behavior.
    ///
    /// To succeed, the value must be a string (in which case this is a no-op), an integer, or a
    /// number.
    pub fn coerce_string<'lua>(&'lua self, v: Value<'lua>) -> Result<Option<String<'lua>>> {
        match v {
            Value::String(s) => Ok(Some(s)),
            Value::Integer(_) | Value::Number(_) => unsafe {
                let state = self.state();
                let _sg = StackGuard::new(state);
                check_stack(state, 1)?;

                self.push_value(&v)?;
                Ok(to_bytes(state, -1).map(String::from_bytes))
            },
            _ => Ok(None),
        }
    }

    /// Attempts to coerce a Lua value into an integer in a manner consistent with Lua's internal
    /// behavior.
    ///
    /// To succeed, the value must be an integer, a floating point number that has an exact
    /// representation as an integer, or a string that can be converted to an integer. Refer to the
    /// Lua manual for details.
    pub fn coerce_integer(&self, v: Value) -> Result<Option<Integer>> {
        match v {
            Value::Integer(i) => Ok(Some(i)),
            Value::Number(_) | Value::String(_) => unsafe {
                let state = self.state();
                let _sg = StackGuard::new(state);
                check_stack(state, 1)?;

                self.push_value(&v)?;
                let mut isnum = 0;
                let i = ffi::lua_tointegerx(state, -1, &mut isnum);
                Ok((isnum != 0).then_some(i))
            },
            _ => Ok(None),
        }
    }

    /// Attempts to coerce a Lua value into a Number in a manner consistent with Lua's internal
    /// behavior.
    ///
    /// To succeed, the value must be a number or a string that can be converted to a number. Refer
    /// to the Lua manual for details.
    pub fn coerce_number(&self, v: Value) -> Result<Option<Number>> {
        match v {
            Value::Number(n) => Ok(Some(n)),
            Value::Integer(i) => Ok(Some(i as Number)),
            Value::String(_) => unsafe {
                let state = self.state();
                let _sg = StackGuard::new(state);
                check_stack(state, 1)?;

                self.push_value(&v)?;
                let mut isnum = 0;
                let n = ffi::lua_tonumberx(state, -1, &mut isnum);
                Ok((isnum != 0).then_some(n))
            },
            _ => Ok(None),
        }
    }

    /// Converts a value to a string the way `tostring` does, honoring `__tostring` and `__name`.
    pub(crate) fn tostring_value(&self, value: &Value) -> Result<std::string::String> {
        unsafe {
            let state = self.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 3)?;

            self.push_value(value)?;
            self.protect_lua(state, 1, 1, crate::stack::safe_tostring)?;

            let bytes = to_bytes(state, -1).unwrap_or_default();
            Ok(std::string::String::from_utf8_lossy(bytes).into_owned())
        }
    }

    /// Converts a value that implements `IntoLua` into a `Value` instance.
    pub fn pack<'lua, T: IntoLua<'lua>>(&'lua self, t: T) -> Result<Value<'lua>> {
        t.into_lua(self)
    }

    /// Converts a `Value` instance into a value that implements `FromLua`.
    pub fn unpack<'lua, T: FromLua<'lua>>(&'lua self, value: Value<'lua>) -> Result<T> {
        T::from_lua(value, self)
    }

    /// Converts a value that implements `IntoLuaMulti` into a `MultiValue` instance.
    pub fn pack_multi<'lua, T: IntoLuaMulti<'lua>>(&'lua self, t: T) -> Result<MultiValue<'lua>> {
        t.into_lua_multi(self)
    }

    /// Converts a `MultiValue` instance into a value that implements `FromLuaMulti`.
    pub fn unpack_multi<'lua, T: FromLuaMulti<'lua>>(
        &'lua self,
        value: MultiValue<'lua>,
    ) -> Result<T> {
        T::from_lua_multi(value, self)
    }

    /// Sets the base directory for relative script paths.
    ///
    /// Relative paths given to [`Lua::load`], [`Lua::install_module_file`] and the guest's
    /// `dofile`/`loadfile` are joined onto it; absolute paths and URLs are left alone. The
    /// guest functions are replaced by prefix-aware versions when the base library is open.
    ///
    /// Anything that is not an existing directory is ignored.
    pub fn set_file_prefix(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();

        if !dir.is_dir() {
            debug!(
                target: "moonbind",
                prefix = %dir.display(),
                "ignoring file prefix that is not a directory"
            );
            return Ok(());
        }

        *self.extra.file_prefix.borrow_mut() = Some(dir.to_path_buf());
        self.install_file_loaders()?;

        debug!(target: "moonbind", prefix = %dir.display(), "set file prefix");

        Ok(())
    }

    pub fn file_prefix(&self) -> Option<PathBuf> {
        self.extra.file_prefix.borrow().clone()
    }

    pub(crate) fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.to_string_lossy().contains("://") {
            return path.to_path_buf();
        }

        match &*self.extra.file_prefix.borrow() {
            Some(prefix) => prefix.join(path),
            None => path.to_path_buf(),
        }
    }

    fn install_file_loaders(&self) -> Result<()> {
        let globals = self.globals()?;

        if globals.raw_get::<_, Value>("loadfile")?.is_function() {
            let loadfile = self.create_function(
                |lua, (path, mode, env): (std::string::String, Option<std::string::String>, Value)| {
                    match lua.load_file(Path::new(&path), mode.as_deref(), env) {
                        Ok(function) => Ok((Some(function), None)),
                        Err(err) => Ok((None, Some(err.to_string()))),
                    }
                },
            )?;
            globals.raw_set("loadfile", loadfile)?;
        }

        if globals.raw_get::<_, Value>("dofile")?.is_function() {
            let dofile = self.create_function(|lua, path: Option<std::string::String>| {
                let path = path.ok_or_else(|| Error::runtime("dofile: reading stdin is not supported"))?;
                lua.load_file(Path::new(&path), None, Value::Nil)?
                    .call::<_, MultiValue>(())
            })?;
            globals.raw_set("dofile", dofile)?;
        }

        Ok(())
    }

    /// Loads a script file the way `loadfile` does, detecting binary chunks by their signature.
    fn load_file<'lua>(
        &'lua self,
        path: &Path,
        mode: Option<&str>,
        env: Value<'lua>,
    ) -> Result<Function<'lua>> {
        let source = std::fs::read(self.resolve_path(path))
            .map_err(|err| Error::runtime(format!("cannot open {}: {err}", path.display())))?;

        let (chunk_mode, allowed) = if source.starts_with(ffi::LUA_SIGNATURE) {
            (ChunkMode::Binary, mode.map_or(true, |m| m.contains('b')))
        } else {
            (ChunkMode::Text, mode.map_or(true, |m| m.contains('t')))
        };

        if !allowed {
            return Err(Error::runtime(format!(
                "attempt to load a {} chunk (mode is '{}')",
                if chunk_mode == ChunkMode::Binary { "binary" } else { "text" },
                mode.unwrap_or_default(),
            )));
        }

        let mut chunk = self
            .load(source)
            .set_name(format!("@{}", path.display()))
            .set_mode(chunk_mode);

        if !env.is_nil() {
            chunk = chunk.set_environment(env);
        }

        chunk.into_function()
    }

    /// Sets or replaces an application data object of type `T`.
    ///
    /// Application data could be accessed at any time by using [`Lua::app_data_ref()`] or [`Lua::app_data_mut()`]
    /// methods where `T` is the data type.
    ///
    /// # Panics
    ///
    /// Panics if the app data container is currently borrowed.
    ///
    /// # Examples
    ///
    /// ```
    /// use moonbind::{Lua, Result};
    ///
    /// fn hello(lua: &Lua, _: ()) -> Result<()> {
    ///     let mut s = lua.app_data_mut::<&str>().unwrap();
    ///     assert_eq!(*s, "hello");
    ///     *s = "world";
    ///     Ok(())
    /// }
    ///
    /// fn main() -> Result<()> {
    ///     let lua = Lua::new();
    ///     lua.set_app_data("hello");
    ///     lua.create_function(hello)?.call::<_, ()>(())?;
    ///     let s = lua.app_data_ref::<&str>().unwrap();
    ///     assert_eq!(*s, "world");
    ///     Ok(())
    /// }
    /// ```
    #[track_caller]
    pub fn set_app_data<T: 'static>(&self, data: T) -> Option<T> {
        if self.extra.app_data_borrows.get() > 0 {
            panic!("cannot mutably borrow app data container");
        }

        let app_data = unsafe { &mut *self.extra.app_data.get() };

        app_data
            .insert(TypeId::of::<T>(), Box::new(RefCell::new(data)))
            .and_then(|old| old.downcast::<RefCell<T>>().ok())
            .map(|cell| cell.into_inner())
    }

    /// Tries to set or replace an application data object of type `T`.
    ///
    /// Returns:
    /// - `Ok(Some(old_data))` if the data object of type `T` was successfully replaced.
    /// - `Ok(None)` if the data object of type `T` was successfully inserted.
    /// - `Err(data)` if the data object of type `T` was not inserted because the container is currently borrowed.
    pub fn try_set_app_data<T: 'static>(&self, mut data: T) -> std::result::Result<Option<T>, T> {
        if let Some(cell) = self.app_data_cell::<T>() {
            return match cell.try_borrow_mut() {
                Ok(mut existing) => {
                    std::mem::swap(&mut *existing, &mut data);
                    Ok(Some(data))
                }
                Err(_) => Err(data),
            };
        }

        if self.extra.app_data_borrows.get() > 0 {
            return Err(data);
        }

        Ok(self.set_app_data(data))
    }

    /// Gets a reference to an application data object stored by [`Lua::set_app_data()`] of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if the data object of type `T` is currently mutably borrowed. Multiple immutable reads
    /// can be taken out at the same time.
    #[track_caller]
    pub fn app_data_ref<T: 'static>(&self) -> Option<AppDataRef<'_, T>> {
        self.app_data_cell::<T>()
            .map(|cell| AppDataRef::new(cell.borrow(), &self.extra.app_data_borrows))
    }

    /// Gets a mutable reference to an application data object stored by [`Lua::set_app_data()`] of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if the data object of type `T` is currently borrowed.
    #[track_caller]
    pub fn app_data_mut<T: 'static>(&self) -> Option<AppDataRefMut<'_, T>> {
        self.app_data_cell::<T>()
            .map(|cell| AppDataRefMut::new(cell.borrow_mut(), &self.extra.app_data_borrows))
    }

    /// Removes an application data of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if the app data container is currently borrowed.
    #[track_caller]
    pub fn remove_app_data<T: 'static>(&self) -> Option<T> {
        if self.extra.app_data_borrows.get() > 0 {
            panic!("cannot mutably borrow app data container");
        }

        let app_data = unsafe { &mut *self.extra.app_data.get() };

        app_data
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<RefCell<T>>().ok())
            .map(|cell| cell.into_inner())
    }

    // Entries are boxed and only inserted or removed while no borrow is out, so the cell
    // outlives every `AppDataRef` handed out for it.
    fn app_data_cell<T: 'static>(&self) -> Option<&RefCell<T>> {
        let app_data = unsafe { &*self.extra.app_data.get() };

        app_data
            .get(&TypeId::of::<T>())
            .and_then(|data| data.downcast_ref::<RefCell<T>>().ok())
    }
}

#[cfg(test)]
mod assertions {
    use super::*;

    static_assertions::assert_not_impl_any!(Lua: Send, Sync);
}
