use std::cell::Cell;
use std::rc::Rc;

use moonbind::{Error, Lua, Result, UserDataType, Value};
use pretty_assertions::assert_eq;

#[test]
fn arithmetic_stays_integer() -> Result<()> {
    let lua = Lua::new();

    let results = lua.eval("return 1+1", ())?.into_vec();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Value::Integer(2)));

    Ok(())
}

#[test]
fn concatenation_returns_a_string() -> Result<()> {
    let lua = Lua::new();

    let results = lua.eval("return 'a'..'b'", ())?.into_vec();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_str(), Some("ab"));

    Ok(())
}

#[test]
fn installed_module_runs_once() -> Result<()> {
    let lua = Lua::new();

    lua.install_module("m", "loads = (loads or 0) + 1; return {x=5}")?;

    for _ in 0..2 {
        let results = lua.eval("local m = require('m'); return m.x", ())?.into_vec();
        assert_eq!(results, vec![Value::Integer(5)]);
    }

    let loads: i64 = lua.globals()?.get("loads")?;
    assert_eq!(loads, 1);

    Ok(())
}

struct Tracked(Rc<Cell<u32>>);

impl UserDataType for Tracked {
    const TYPE_NAME: &'static str = "Tracked";
}

#[test]
fn finalizer_runs_for_every_instance() -> Result<()> {
    let lua = Lua::new();
    let finalized = Rc::new(Cell::new(0));

    lua.create_custom_type::<Tracked>(|ty| {
        ty.on_finalize(|tracked| tracked.0.set(tracked.0.get() + 1));
        Ok(())
    })?;

    let a = lua.create_userdata(Tracked(finalized.clone()))?;
    let b = lua.create_userdata(Tracked(finalized.clone()))?;
    drop((a, b));

    lua.gc_collect()?;
    assert_eq!(finalized.get(), 2);

    Ok(())
}

#[test]
fn missing_module_names_itself() {
    let lua = Lua::new();

    let err = lua.load("require('missing')").exec().unwrap_err();
    assert!(matches!(err, Error::RuntimeError(_)));
    assert!(err.to_string().contains("missing"), "{err}");
}
