use std::path::{Path, PathBuf};

use moonbind::{Error, Function, Lua, LuaOptions, Result, StdLib};
use pretty_assertions::assert_eq;

const SCRIPTS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/lua");

fn scripted_lua() -> Result<Lua> {
    Lua::new_with(StdLib::ALL_SAFE, LuaOptions::new().file_prefix(SCRIPTS))
}

#[test]
fn prefix_is_recorded() -> Result<()> {
    let lua = scripted_lua()?;
    assert_eq!(lua.file_prefix(), Some(PathBuf::from(SCRIPTS)));

    Ok(())
}

#[test]
fn non_directories_are_ignored() -> Result<()> {
    let lua = Lua::new();

    lua.set_file_prefix(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/lua/greet.lua"))?;
    assert_eq!(lua.file_prefix(), None);

    lua.set_file_prefix("/definitely/not/a/directory")?;
    assert_eq!(lua.file_prefix(), None);

    Ok(())
}

#[test]
fn host_loads_resolve_against_the_prefix() -> Result<()> {
    let lua = scripted_lua()?;

    let greeting: String = lua.load(Path::new("greet.lua")).call("moon")?;
    assert_eq!(greeting, "hello, moon");
    assert_eq!(lua.globals()?.get::<_, i64>("greeted")?, 1);

    let absolute = PathBuf::from(SCRIPTS).join("greet.lua");
    let greeting: String = lua.load(absolute).call(())?;
    assert_eq!(greeting, "hello, world");

    Ok(())
}

#[test]
fn guest_dofile_and_loadfile_use_the_prefix() -> Result<()> {
    let lua = scripted_lua()?;

    let greeting: String = lua.load("return dofile('greet.lua')").eval()?;
    assert_eq!(greeting, "hello, world");

    let loaded: Function = lua.load("return loadfile('greet.lua')").eval()?;
    assert_eq!(loaded.call::<_, String>("file")?, "hello, file");

    // scripts loaded from files resolve their own loads the same way
    let nested: String = lua.load("return dofile('nested.lua')").eval()?;
    assert_eq!(nested, "hello, world!");

    Ok(())
}

#[test]
fn loadfile_reports_failures_as_values() -> Result<()> {
    let lua = scripted_lua()?;

    let (function, message): (Option<Function>, String) =
        lua.load("return loadfile('missing.lua')").eval()?;
    assert!(function.is_none());
    assert!(message.contains("missing.lua"), "{message}");

    let (function, message): (Option<Function>, String) =
        lua.load("return loadfile('greet.lua', 'b')").eval()?;
    assert!(function.is_none());
    assert!(message.contains("attempt to load a text chunk"), "{message}");

    Ok(())
}

#[test]
fn loadfile_accepts_an_environment() -> Result<()> {
    let lua = scripted_lua()?;

    let (greeting, global, sandboxed): (String, Option<i64>, i64) = lua
        .load(
            r#"
            local env = { greeted = 10 }
            local greet = loadfile('greet.lua', 't', env)
            return greet('env'), greeted, env.greeted
        "#,
        )
        .eval()?;
    assert_eq!(greeting, "hello, env");
    assert_eq!(global, None);
    assert_eq!(sandboxed, 11);

    Ok(())
}

#[test]
fn broken_files_are_syntax_errors() -> Result<()> {
    let lua = scripted_lua()?;

    let err = lua.load(Path::new("broken.lua")).exec().unwrap_err();
    match err {
        Error::SyntaxError { message, .. } => assert!(message.contains("broken.lua"), "{message}"),
        err => panic!("unexpected error: {err:?}"),
    }

    let err = lua.load("dofile('broken.lua')").exec().unwrap_err();
    assert!(err.to_string().contains("syntax error"), "{err}");

    Ok(())
}

#[test]
fn missing_files_are_io_errors() {
    let lua = Lua::new();

    let err = lua.load(Path::new("nowhere.lua")).exec().unwrap_err();
    assert!(matches!(err, Error::ExternalError(_)), "{err:?}");
}
