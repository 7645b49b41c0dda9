use std::borrow::Cow;
use std::ffi::{c_char, CStr, CString};
use std::io::Result as IoResult;
use std::path::{Path, PathBuf};
use std::string::String as StdString;

use mlua_sys as ffi;

use crate::error::{Error, ErrorContext, Result};
use crate::function::Function;
use crate::lua::Lua;
use crate::stack::{check_stack, StackGuard};
use crate::table::Table;
use crate::value::{FromLuaMulti, IntoLua, IntoLuaMulti};

/// Trait for types [loadable by Lua] and convertible to a [`Chunk`]
///
/// [loadable by Lua]: https://www.lua.org/manual/5.4/manual.html#3.3.2
pub trait AsChunk<'lua, 'a> {
    /// Returns optional chunk name
    fn name(&self) -> Option<StdString> {
        None
    }

    /// Returns optional chunk mode (text or binary)
    fn mode(&self) -> Option<ChunkMode> {
        None
    }

    /// Returns chunk data. Relative paths are resolved against the file prefix of `lua`.
    fn source(self, lua: &'lua Lua) -> IoResult<Cow<'a, [u8]>>;
}

impl<'a> AsChunk<'_, 'a> for &'a str {
    fn source(self, _: &Lua) -> IoResult<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(self.as_ref()))
    }
}

impl AsChunk<'_, 'static> for StdString {
    fn source(self, _: &Lua) -> IoResult<Cow<'static, [u8]>> {
        Ok(Cow::Owned(self.into_bytes()))
    }
}

impl<'a> AsChunk<'_, 'a> for &'a StdString {
    fn source(self, _: &Lua) -> IoResult<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(self.as_bytes()))
    }
}

impl<'a> AsChunk<'_, 'a> for &'a [u8] {
    fn source(self, _: &Lua) -> IoResult<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(self))
    }
}

impl AsChunk<'_, 'static> for Vec<u8> {
    fn source(self, _: &Lua) -> IoResult<Cow<'static, [u8]>> {
        Ok(Cow::Owned(self))
    }
}

impl AsChunk<'_, 'static> for &Path {
    fn name(&self) -> Option<StdString> {
        Some(format!("@{}", self.display()))
    }

    fn source(self, lua: &Lua) -> IoResult<Cow<'static, [u8]>> {
        std::fs::read(lua.resolve_path(self)).map(Cow::Owned)
    }
}

impl AsChunk<'_, 'static> for PathBuf {
    fn name(&self) -> Option<StdString> {
        Some(format!("@{}", self.display()))
    }

    fn source(self, lua: &Lua) -> IoResult<Cow<'static, [u8]>> {
        std::fs::read(lua.resolve_path(&self)).map(Cow::Owned)
    }
}

/// Returned from [`Lua::load`] and is used to finalize loading and executing Lua main chunks.
#[must_use = "`Chunk`s do nothing unless one of `exec`, `eval`, `call`, or `into_function` are called on them"]
pub struct Chunk<'lua, 'a> {
    pub(crate) lua: &'lua Lua,
    pub(crate) name: Option<StdString>,
    pub(crate) env: Result<Option<Table<'lua>>>,
    pub(crate) mode: ChunkMode,
    pub(crate) source: IoResult<Cow<'a, [u8]>>,
}

/// Represents chunk mode (text or binary).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkMode {
    #[default]
    Text,
    Binary,
}

impl<'lua, 'a> Chunk<'lua, 'a> {
    pub(crate) fn new(lua: &'lua Lua, chunk: impl AsChunk<'lua, 'a>) -> Self {
        Chunk {
            lua,
            name: chunk.name(),
            env: Ok(None),
            mode: chunk.mode().unwrap_or_default(),
            source: chunk.source(lua),
        }
    }

    /// Sets the name of this chunk, which results in more informative error traces.
    pub fn set_name(mut self, name: impl Into<StdString>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the `_ENV` upvalue of the loaded chunk.
    ///
    /// Global lookups inside the chunk go to this table instead of the globals table, so it may
    /// need a metatable with `__index` pointing at the globals (see [`Lua::environment`]).
    pub fn set_environment<V: IntoLua<'lua>>(mut self, env: V) -> Self {
        self.env = env
            .into_lua(self.lua)
            .and_then(|val| self.lua.unpack(val))
            .context("bad environment value");
        self
    }

    pub fn set_mode(mut self, mode: ChunkMode) -> Self {
        self.mode = mode;
        self
    }

    /// Execute this chunk of code.
    ///
    /// This is equivalent to calling the chunk function with no arguments and no return values.
    pub fn exec(self) -> Result<()> {
        self.call(())
    }

    /// Evaluate the chunk as either an expression or block.
    ///
    /// If the chunk can be parsed as an expression, this loads and executes the chunk and returns
    /// the value that it evaluates to. Otherwise, the chunk is interpreted as a block as normal,
    /// and this is equivalent to calling `exec`.
    pub fn eval<R: FromLuaMulti<'lua>>(self) -> Result<R> {
        if self.mode == ChunkMode::Binary {
            return self.call(());
        }

        // same thing the standalone repl does: try `return <source>` first
        match self.to_expression() {
            Ok(function) => function.call(()),
            Err(err @ Error::MemoryError(_)) => Err(err),
            Err(_) => self.call(()),
        }
    }

    /// Load the chunk function and call it with the given arguments.
    pub fn call<A: IntoLuaMulti<'lua>, R: FromLuaMulti<'lua>>(self, args: A) -> Result<R> {
        self.into_function()?.call(args)
    }

    /// Compiles the chunk into a regular [`Function`] without running it.
    ///
    /// A compilation failure is reported as [`Error::SyntaxError`] and leaves nothing behind.
    pub fn into_function(self) -> Result<Function<'lua>> {
        let source = self.source.map_err(Error::from)?;
        let env = self.env?;
        let name = chunk_name(self.name.as_deref(), &source)?;

        load_buffer(self.lua, &source, &name, self.mode, env.as_ref())
    }

    fn to_expression(&self) -> Result<Function<'lua>> {
        let source = match &self.source {
            Ok(source) => source,
            Err(err) => return Err(Error::runtime(err)),
        };
        let env = self.env.clone()?;
        let name = chunk_name(self.name.as_deref(), source)?;

        let mut buf = Vec::with_capacity(b"return ".len() + source.len());
        buf.extend(b"return ");
        buf.extend(source.iter());

        load_buffer(self.lua, &buf, &name, self.mode, env.as_ref())
    }
}

/// Unnamed text chunks are named after their source, the way `luaL_loadstring` does it.
fn chunk_name(name: Option<&str>, source: &[u8]) -> Result<CString> {
    let name = match name {
        Some(name) => name.as_bytes(),
        None if !source.starts_with(ffi::LUA_SIGNATURE) && !source.contains(&0) => source,
        None => b"=?",
    };

    CString::new(name).map_err(|err| Error::runtime(format!("invalid chunk name: {err}")))
}

fn load_buffer<'lua>(
    lua: &'lua Lua,
    source: &[u8],
    name: &CStr,
    mode: ChunkMode,
    env: Option<&Table<'lua>>,
) -> Result<Function<'lua>> {
    let mode = match mode {
        ChunkMode::Text => c"t",
        ChunkMode::Binary => c"b",
    };

    unsafe {
        let state = lua.state();
        let _sg = StackGuard::new(state);
        check_stack(state, 2)?;

        let code = ffi::luaL_loadbufferx(
            state,
            source.as_ptr() as *const c_char,
            source.len(),
            name.as_ptr(),
            mode.as_ptr(),
        );

        if code != ffi::LUA_OK {
            return Err(lua.pop_error(state, code));
        }

        if let Some(env) = env {
            lua.push_ref(&env.0)?;

            // a stripped binary chunk may not have an `_ENV` upvalue
            if ffi::lua_setupvalue(state, -2, 1).is_null() {
                ffi::lua_pop(state, 1);
            }
        }

        Ok(Function(lua.pop_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unnamed_text_chunks_use_their_source() {
        let name = chunk_name(None, b"return 1").unwrap();
        assert_eq!(name.to_str().unwrap(), "return 1");

        let name = chunk_name(None, b"return '\0'").unwrap();
        assert_eq!(name.to_str().unwrap(), "=?");

        let name = chunk_name(Some("@init.lua"), b"return 1").unwrap();
        assert_eq!(name.to_str().unwrap(), "@init.lua");
    }
}
