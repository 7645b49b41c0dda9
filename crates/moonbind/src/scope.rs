use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::function::Function;
use crate::lua::Lua;
use crate::types::Callback;
use crate::value::{FromLuaMulti, IntoLuaMulti, MultiValue};

/// Emptied when the owning scope ends.
type CallbackSlot<'lua> = Rc<RefCell<Option<Callback<'lua>>>>;

/// Constructed by the [`Lua::scope`] method, allows temporarily creating Lua callbacks that are
/// not required to be `'static`.
///
/// See [`Lua::scope`] for more details.
///
/// [`Lua::scope`]: crate::Lua::scope
pub struct Scope<'lua, 'scope>
where
    'lua: 'scope,
{
    lua: &'lua Lua,
    callbacks: RefCell<Vec<CallbackSlot<'lua>>>,
    _scope_invariant: PhantomData<Cell<&'scope ()>>,
}

impl<'lua, 'scope> Scope<'lua, 'scope> {
    pub(crate) fn new(lua: &'lua Lua) -> Scope<'lua, 'scope> {
        Scope {
            lua,
            callbacks: Default::default(),
            _scope_invariant: PhantomData,
        }
    }

    /// Wraps a Rust function or closure, creating a callable Lua function handle to it.
    ///
    /// This is a version of [`Lua::create_function`] that creates a callback which expires on
    /// scope drop. See [`Lua::scope`] for more details.
    ///
    /// [`Lua::create_function`]: crate::Lua::create_function
    /// [`Lua::scope`]: crate::Lua::scope
    pub fn create_function<A, R, F>(&self, func: F) -> Result<Function<'lua>>
    where
        A: FromLuaMulti<'lua>,
        R: IntoLuaMulti<'lua>,
        F: Fn(&'lua Lua, A) -> Result<R> + 'scope,
    {
        let func: Rc<dyn Fn(&'lua Lua, MultiValue<'lua>) -> Result<MultiValue<'lua>> + 'scope> =
            Rc::new(move |lua, args| {
                func(lua, A::from_lua_args(args, 1, None, lua)?)?.into_lua_multi(lua)
            });

        // SAFETY: the slot is emptied in `Drop`, before `'scope` ends
        let func: Callback<'lua> = unsafe { mem::transmute(func) };

        let slot: CallbackSlot<'lua> = Rc::new(RefCell::new(Some(func)));
        self.callbacks.borrow_mut().push(slot.clone());

        let trampoline: Callback<'lua> = Rc::new(move |lua: &'lua Lua, args: MultiValue<'lua>| {
            let func = slot.borrow().clone().ok_or(Error::CallbackDestructed)?;
            func(lua, args)
        });

        self.lua.create_callback(trampoline)
    }

    /// A mutable version of [`Scope::create_function`].
    pub fn create_function_mut<A, R, F>(&self, func: F) -> Result<Function<'lua>>
    where
        A: FromLuaMulti<'lua>,
        R: IntoLuaMulti<'lua>,
        F: FnMut(&'lua Lua, A) -> Result<R> + 'scope,
    {
        let func = RefCell::new(func);
        self.create_function(move |lua, args| {
            (*func
                .try_borrow_mut()
                .map_err(|_| Error::RecursiveMutCallback)?)(lua, args)
        })
    }
}

impl Drop for Scope<'_, '_> {
    fn drop(&mut self) {
        // Closures are dropped outside the borrow, their destructors may touch the scope's data.
        let expired = self
            .callbacks
            .get_mut()
            .drain(..)
            .filter_map(|slot| slot.borrow_mut().take())
            .collect::<Vec<_>>();

        drop(expired);
    }
}
