use moonbind::{Error, Function, Lua, LuaOptions, Result, StdLib, Table};
use pretty_assertions::assert_eq;

const SCRIPTS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/lua");

#[test]
fn require_returns_the_cached_value() -> Result<()> {
    let lua = Lua::new();
    lua.install_module("config", "return { level = 3 }")?;

    let same: bool = lua
        .load("local a = require('config'); local b = require('config'); return a == b")
        .eval()?;
    assert!(same);

    let loaded: Table = lua.load("return package.loaded").eval()?;
    assert_eq!(loaded.get::<_, Table>("config")?.get::<_, i64>("level")?, 3);

    Ok(())
}

#[test]
fn modules_receive_their_name() -> Result<()> {
    let lua = Lua::new();
    lua.install_module("echo.name", "return (...)")?;

    let name: String = lua.load("return require('echo.name')").eval()?;
    assert_eq!(name, "echo.name");

    Ok(())
}

#[test]
fn modules_without_a_result_load_as_true() -> Result<()> {
    let lua = Lua::new();
    lua.install_module("side_effect", "touched = true")?;

    let (value, touched): (bool, bool) = lua
        .load("return require('side_effect'), touched")
        .eval()?;
    assert!(value && touched);

    Ok(())
}

#[test]
fn missing_modules_are_named_in_the_error() {
    let lua = Lua::new();
    lua.install_module("present", "return 1").unwrap();

    let err = lua.load("require('absent')").exec().unwrap_err();
    assert!(err.to_string().contains("unknown module 'absent'"), "{err}");
}

#[test]
fn syntax_errors_surface_at_require() -> Result<()> {
    let lua = Lua::new();
    lua.install_module("broken", "return {")?;

    let err = lua.load("require('broken')").exec().unwrap_err();
    assert!(matches!(err, Error::RuntimeError(_)));
    assert!(err.to_string().contains("broken"), "{err}");

    // a failed module is not cached
    let (ok, _): (bool, String) = lua.load("return pcall(require, 'broken')").eval()?;
    assert!(!ok);

    Ok(())
}

#[test]
fn host_loaders_can_be_preloaded() -> Result<()> {
    let lua = Lua::new();

    let loader: Function = lua.create_function(|lua, name: String| {
        let module = lua.create_table()?;
        module.set("name", name)?;
        module.set("answer", 42)?;
        Ok(module)
    })?;
    lua.preload_module("native", loader)?;

    let (name, answer): (String, i64) = lua
        .load("local m = require('native'); return m.name, m.answer")
        .eval()?;
    assert_eq!((name.as_str(), answer), ("native", 42));

    Ok(())
}

#[test]
fn require_works_without_the_package_library() -> Result<()> {
    let lua = Lua::new_with(StdLib::ALL_SAFE - StdLib::PACKAGE, LuaOptions::default())?;
    assert!(lua.globals()?.get::<_, Option<Table>>("package")?.is_none());

    lua.install_module("m", "loads = (loads or 0) + 1; return { x = 5 }")?;

    let x: i64 = lua.load("require('m'); return require('m').x").eval()?;
    assert_eq!(x, 5);
    assert_eq!(lua.globals()?.get::<_, i64>("loads")?, 1);

    let err = lua.load("require('other')").exec().unwrap_err();
    assert!(err.to_string().contains("unknown module 'other'"), "{err}");

    Ok(())
}

#[test]
fn module_files_are_read_relative_to_the_prefix() -> Result<()> {
    let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::new().file_prefix(SCRIPTS))?;
    lua.install_module_file("vector", "modules/vector.lua")?;

    let (x, y): (i64, i64) = lua
        .load(
            r#"
            local vector = require('vector')
            local v = vector.add({ x = 1, y = 2 }, { x = 10, y = 20 })
            return v.x, v.y
        "#,
        )
        .eval()?;
    assert_eq!((x, y), (11, 22));

    Ok(())
}

#[test]
fn unreadable_module_files_fail_at_install() {
    let lua = Lua::new();

    let err = lua
        .install_module_file("ghost", "definitely/not/here.lua")
        .unwrap_err();
    assert!(err.to_string().starts_with("cannot read module 'ghost'"), "{err}");
}
