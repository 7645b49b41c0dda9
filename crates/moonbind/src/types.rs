use std::ffi::c_void;
use std::rc::Rc;

use crate::error::Result;
use crate::lua::Lua;
use crate::value::MultiValue;

pub type Number = f64;
pub type Integer = i64;

/// A "light" userdata value: a raw pointer the guest stores but never owns or finalizes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LightUserData(pub *mut c_void);

slotmap::new_key_type! {
    /// Identifies the host closure behind one trampoline.
    pub(crate) struct CallbackKey;
}

/// The type-erased form every host closure takes once it is exposed to the guest.
pub(crate) type Callback<'lua> = Rc<dyn Fn(&'lua Lua, MultiValue<'lua>) -> Result<MultiValue<'lua>> + 'lua>;

/// Stored form; the real lifetime is tied to the owning `Lua`.
pub(crate) type StaticCallback = Callback<'static>;
