//! Embedding layer for the Lua 5.4 interpreter.
//!
//! A [`Lua`] owns one interpreter state. Values cross the boundary as [`Value`]s, host closures
//! become guest functions through [`Lua::create_function`], host types live inside guest memory
//! once registered with [`Lua::create_custom_type`], and [`Lua::install_module`] makes sources
//! available to `require`.
//!
//! ```
//! # use moonbind::{Lua, Result};
//! # fn main() -> Result<()> {
//! let lua = Lua::new();
//!
//! let double = lua.create_function(|_, n: i64| Ok(n * 2))?;
//! lua.globals()?.set("double", double)?;
//!
//! let value: i64 = lua.load("return double(21)").eval()?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

mod app_data;
mod chunk;
mod conversion;
mod error;
mod function;
mod lua;
mod module;
mod multi;
mod reference;
mod scope;
mod stack;
mod stdlib;
mod string;
mod table;
mod thread;
mod types;
mod userdata;
mod value;

pub use crate::app_data::{AppDataRef, AppDataRefMut};
pub use crate::chunk::{AsChunk, Chunk, ChunkMode};
pub use crate::error::{Error, ErrorContext, ExternalError, ExternalResult, Result};
pub use crate::function::Function;
pub use crate::lua::{Lua, LuaOptions};
pub use crate::multi::Variadic;
pub use crate::reference::RegistryKey;
pub use crate::scope::Scope;
pub use crate::stdlib::StdLib;
pub use crate::string::String;
pub use crate::table::{Table, TableExt, TablePairs, TableSequence};
pub use crate::thread::{Thread, ThreadStatus};
pub use crate::types::{Integer, LightUserData, Number};
pub use crate::userdata::{AnyUserData, CustomType, UserDataType};
pub use crate::value::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, MultiValue, Nil, Value};

pub mod prelude {
    pub use crate::chunk::Chunk as LuaChunk;
    pub use crate::error::{
        Error as LuaError, ErrorContext as LuaErrorContext, ExternalError as LuaExternalError,
        ExternalResult as LuaExternalResult, Result as LuaResult,
    };
    pub use crate::function::Function as LuaFunction;
    pub use crate::lua::{Lua, LuaOptions};
    pub use crate::multi::Variadic as LuaVariadic;
    pub use crate::reference::RegistryKey as LuaRegistryKey;
    pub use crate::stdlib::StdLib as LuaStdLib;
    pub use crate::string::String as LuaString;
    pub use crate::table::{
        Table as LuaTable, TableExt as LuaTableExt, TablePairs as LuaTablePairs,
        TableSequence as LuaTableSequence,
    };
    pub use crate::thread::Thread as LuaThread;
    pub use crate::types::{
        Integer as LuaInteger, LightUserData as LuaLightUserData, Number as LuaNumber,
    };
    pub use crate::userdata::{
        AnyUserData as LuaAnyUserData, CustomType as LuaCustomType, UserDataType as LuaUserDataType,
    };
    pub use crate::value::{
        FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, MultiValue as LuaMultiValue, Nil as LuaNil,
        Value as LuaValue,
    };
}

pub(crate) mod private {
    use super::*;

    pub trait Sealed {}

    impl Sealed for Error {}
    impl<T> Sealed for std::result::Result<T, Error> {}
    impl Sealed for Lua {}
    impl Sealed for Table<'_> {}
}
