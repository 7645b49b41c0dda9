use std::path::Path;
use std::rc::Rc;
use std::string::String as StdString;

use tracing::debug;

use crate::error::{Error, ErrorContext, Result};
use crate::function::Function;
use crate::lua::Lua;
use crate::table::Table;
use crate::value::{MultiValue, Value};

// registry tables shared with the `package` library
const LOADED_TABLE: &str = "_LOADED";
const PRELOAD_TABLE: &str = "_PRELOAD";

// set once the `unknown module` searcher is appended to `package.searchers`
const SEARCHER_INSTALLED: &str = "moonbind.searcher";

impl Lua {
    /// Makes `require(name)` compile and run `source`, returning what the chunk returns.
    ///
    /// The body runs at most once per `Lua`; later `require` calls return the cached value.
    /// A compilation failure surfaces as a guest error at the `require` call site.
    ///
    /// # Examples
    ///
    /// ```
    /// # use moonbind::{Lua, Result};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// lua.install_module("greeting", "return { text = 'hello' }")?;
    ///
    /// let text: String = lua.load("return require('greeting').text").eval()?;
    /// assert_eq!(text, "hello");
    /// # Ok(())
    /// # }
    /// ```
    pub fn install_module(&self, name: &str, source: impl Into<Vec<u8>>) -> Result<()> {
        self.install_module_source(name, source.into(), format!("={name}"))
    }

    /// Like [`Lua::install_module`], reading the source from `path`.
    ///
    /// Relative paths are resolved against the file prefix. The file is read once, when the
    /// module is installed.
    pub fn install_module_file(&self, name: &str, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = std::fs::read(self.resolve_path(path))
            .map_err(Error::from)
            .with_context(|_| format!("cannot read module '{name}' from {}", path.display()))?;

        self.install_module_source(name, source, format!("@{}", path.display()))
    }

    /// Registers `loader` as the loader of module `name` in `package.preload`.
    ///
    /// `require(name)` calls it with the module name and caches its first result.
    pub fn preload_module<'lua>(&'lua self, name: &str, loader: Function<'lua>) -> Result<()> {
        self.registry_table(PRELOAD_TABLE)?.raw_set(name, loader)?;
        self.ensure_require()?;

        debug!(target: "moonbind", module = name, "preloaded module");

        Ok(())
    }

    fn install_module_source(&self, name: &str, source: Vec<u8>, chunk_name: StdString) -> Result<()> {
        let source: Rc<[u8]> = source.into();

        let loader = self.create_function(move |lua, args: MultiValue| {
            lua.load(&source[..])
                .set_name(chunk_name.clone())
                .call::<_, Value>(args)
        })?;

        self.preload_module(name, loader)
    }

    /// Makes sure guest code has a `require` able to reach `_PRELOAD`.
    fn ensure_require(&self) -> Result<()> {
        let globals = self.globals()?;

        if let Value::Function(_) = globals.raw_get::<_, Value>("require")? {
            return self.ensure_unknown_module_searcher(&globals);
        }

        globals.raw_set("require", self.create_function(fallback_require)?)?;
        debug!(target: "moonbind", "installed fallback require");

        Ok(())
    }

    /// Appends a searcher naming unregistered modules to `package.searchers`.
    fn ensure_unknown_module_searcher(&self, globals: &Table) -> Result<()> {
        if self.named_registry_value::<bool>(SEARCHER_INSTALLED).unwrap_or(false) {
            return Ok(());
        }

        let Some(package) = globals.raw_get::<_, Option<Table>>("package")? else {
            return Ok(());
        };
        let Some(searchers) = package.raw_get::<_, Option<Table>>("searchers")? else {
            return Ok(());
        };

        let searcher = self.create_function(|_, name: StdString| Ok(format!("unknown module '{name}'")))?;
        searchers.raw_set(searchers.raw_len() as i64 + 1, searcher)?;
        self.set_named_registry_value(SEARCHER_INSTALLED, true)
    }

    /// Returns the registry table stored under `name`, creating it if needed.
    fn registry_table(&self, name: &str) -> Result<Table<'_>> {
        if let Some(table) = self.named_registry_value::<Option<Table>>(name)? {
            return Ok(table);
        }

        let table = self.create_table()?;
        self.set_named_registry_value(name, table.clone())?;
        Ok(table)
    }
}

/// `require` used when the `package` library is not open.
fn fallback_require(lua: &Lua, name: StdString) -> Result<Value<'_>> {
    let loaded = lua.registry_table(LOADED_TABLE)?;

    let cached = loaded.raw_get::<_, Value>(name.as_str())?;
    if !cached.is_nil() {
        return Ok(cached);
    }

    let preload = lua.registry_table(PRELOAD_TABLE)?;
    let Some(loader) = preload.raw_get::<_, Option<Function>>(name.as_str())? else {
        return Err(Error::runtime(format!("unknown module '{name}'")));
    };

    let value = loader.call::<_, Value>((name.as_str(), ":preload:"))?;

    // a module may store itself in `_LOADED` instead of returning
    let value = match value {
        Value::Nil => match loaded.raw_get::<_, Value>(name.as_str())? {
            Value::Nil => Value::Boolean(true),
            stored => stored,
        },
        value => value,
    };

    loaded.raw_set(name.as_str(), value.clone())?;
    Ok(value)
}
