use moonbind::{Error, Lua, Nil, Result, Table, Value};
use pretty_assertions::assert_eq;

#[test]
fn registry_keys_hold_values() -> Result<()> {
    let lua = Lua::new();

    let mut key = lua.create_registry_value("stored")?;
    assert_eq!(lua.registry_value::<String>(&key)?, "stored");

    lua.replace_registry_value(&mut key, 7)?;
    assert_eq!(lua.registry_value::<i64>(&key)?, 7);

    lua.replace_registry_value(&mut key, Nil)?;
    assert_eq!(lua.registry_value::<Value>(&key)?, Nil);

    lua.replace_registry_value(&mut key, true)?;
    assert!(lua.registry_value::<bool>(&key)?);

    lua.remove_registry_value(key)?;

    Ok(())
}

#[test]
fn registry_keys_keep_tables_alive() -> Result<()> {
    let lua = Lua::new();

    let key = {
        let table = lua.create_table()?;
        table.set("x", 1)?;
        lua.create_registry_value(table)?
    };
    lua.gc_collect()?;

    let table: Table = lua.registry_value(&key)?;
    assert_eq!(table.get::<_, i64>("x")?, 1);

    Ok(())
}

#[test]
fn keys_belong_to_one_state() -> Result<()> {
    let first = Lua::new();
    let second = Lua::new();

    let mut key = first.create_registry_value(1)?;
    assert!(first.owns_registry_value(&key));
    assert!(!second.owns_registry_value(&key));

    assert!(matches!(second.registry_value::<i64>(&key), Err(Error::MismatchedRegistryKey)));
    assert!(matches!(
        second.replace_registry_value(&mut key, 2),
        Err(Error::MismatchedRegistryKey)
    ));
    assert!(matches!(second.remove_registry_value(key), Err(Error::MismatchedRegistryKey)));

    Ok(())
}

#[test]
fn dropped_keys_expire() -> Result<()> {
    let lua = Lua::new();

    let key = lua.create_registry_value("temporary")?;
    drop(key);
    lua.expire_registry_values();

    // the slot is reused by the next reference
    let key = lua.create_registry_value("next")?;
    assert_eq!(lua.registry_value::<String>(&key)?, "next");

    Ok(())
}

#[test]
fn named_values() -> Result<()> {
    let lua = Lua::new();

    lua.set_named_registry_value("app.answer", 42)?;
    assert_eq!(lua.named_registry_value::<i64>("app.answer")?, 42);

    let registry = lua.registry()?;
    assert_eq!(registry.raw_get::<_, i64>("app.answer")?, 42);

    lua.unset_named_registry_value("app.answer")?;
    assert_eq!(lua.named_registry_value::<Option<i64>>("app.answer")?, None);

    Ok(())
}

#[test]
fn environment_reads_through_to_globals() -> Result<()> {
    let lua = Lua::new();
    lua.globals()?.set("shared", 1)?;

    let env = lua.environment()?;
    assert_eq!(env.get::<_, i64>("shared")?, 1);
    assert_eq!(env.raw_get::<_, Value>("shared")?, Nil);

    lua.load("private = shared + 1")
        .set_environment(env.clone())
        .exec()?;

    assert_eq!(env.raw_get::<_, i64>("private")?, 2);
    assert_eq!(lua.globals()?.get::<_, Value>("private")?, Nil);

    Ok(())
}

#[test]
fn app_data_is_typed() -> Result<()> {
    let lua = Lua::new();

    assert!(lua.app_data_ref::<u32>().is_none());
    assert_eq!(lua.set_app_data(1u32), None);
    assert_eq!(lua.set_app_data(2u32), Some(1));

    lua.set_app_data(String::from("name"));

    let bump = lua.create_function(|lua, ()| {
        if let Some(mut n) = lua.app_data_mut::<u32>() {
            *n += 1;
        }
        Ok(())
    })?;
    bump.call::<_, ()>(())?;

    assert_eq!(*lua.app_data_ref::<u32>().unwrap(), 3);
    assert_eq!(lua.app_data_ref::<String>().unwrap().as_str(), "name");

    {
        let _held = lua.app_data_ref::<u32>().unwrap();
        assert!(lua.try_set_app_data(4u32).is_err());
    }
    assert_eq!(lua.try_set_app_data(4u32), Ok(Some(3)));

    assert_eq!(lua.remove_app_data::<u32>(), Some(4));
    assert!(lua.app_data_ref::<u32>().is_none());

    Ok(())
}
