use moonbind::{Error, Lua, Nil, Result, Table, TableExt, Value};
use pretty_assertions::assert_eq;

#[test]
fn set_and_get() -> Result<()> {
    let lua = Lua::new();
    let table = lua.create_table()?;

    table.set("name", "moon")?;
    table.set(1, 10)?;
    table.set(2.5, true)?;

    assert_eq!(table.get::<_, String>("name")?, "moon");
    assert_eq!(table.get::<_, i64>(1)?, 10);
    assert!(table.get::<_, bool>(2.5)?);
    assert_eq!(table.get::<_, Value>("absent")?, Nil);
    assert!(table.contains_key("name")?);
    assert!(!table.contains_key("absent")?);

    table.set("name", Nil)?;
    assert!(!table.contains_key("name")?);

    Ok(())
}

#[test]
fn nil_and_nan_keys_are_rejected() -> Result<()> {
    let lua = Lua::new();
    let table = lua.create_table()?;

    assert!(matches!(table.set(Nil, 1), Err(Error::RuntimeError(_))));
    assert!(matches!(table.raw_set(f64::NAN, 1), Err(Error::RuntimeError(_))));
    assert!(table.is_empty());

    Ok(())
}

#[test]
fn index_falls_back_through_the_metatable_chain() -> Result<()> {
    let lua = Lua::new();

    let base = lua.create_table()?;
    base.set("greeting", "hi")?;

    let middle = lua.create_table()?;
    let middle_meta = lua.create_table()?;
    middle_meta.set("__index", base)?;
    middle_meta.become_metatable_for(&middle)?;

    let table = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set("__index", middle)?;
    meta.become_metatable_for(&table)?;

    assert_eq!(table.get::<_, String>("greeting")?, "hi");
    assert_eq!(table.get::<_, Value>("missing")?, Nil);

    // raw access ignores the chain
    assert_eq!(table.raw_get::<_, Value>("greeting")?, Nil);

    Ok(())
}

#[test]
fn metatable_accessors() -> Result<()> {
    let lua = Lua::new();
    let table = lua.create_table()?;
    assert!(table.get_metatable().is_none());

    let meta = lua.create_table()?;
    table.set_metatable(Some(meta.clone()))?;
    assert_eq!(table.get_metatable(), Some(meta));

    table.set_metatable(None)?;
    assert!(table.get_metatable().is_none());

    Ok(())
}

#[test]
fn newindex_is_honored_by_set_only() -> Result<()> {
    let lua = Lua::new();

    let table: Table = lua
        .load(
            r#"
            local log = {}
            return setmetatable({ log = log }, {
                __newindex = function(_, k, v) log[#log + 1] = k end,
            })
        "#,
        )
        .eval()?;

    table.set("a", 1)?;
    table.raw_set("b", 2)?;

    let log: Vec<String> = table.get("log")?;
    assert_eq!(log, vec!["a".to_string()]);
    assert_eq!(table.raw_get::<_, i64>("b")?, 2);

    Ok(())
}

#[test]
fn sequence_values_stop_at_the_first_gap() -> Result<()> {
    let lua = Lua::new();
    let table: Table = lua.load("return { 1, 2, 3, nil, 5, key = 'x' }").eval()?;

    let values = table.sequence_values::<i64>().collect::<Result<Vec<_>>>()?;
    assert_eq!(values, vec![1, 2, 3]);

    Ok(())
}

#[test]
fn sequence_values_report_conversion_errors() -> Result<()> {
    let lua = Lua::new();
    let table: Table = lua.load("return { 1, 'two', 3 }").eval()?;

    let mut values = table.sequence_values::<i64>();
    assert_eq!(values.next().transpose()?, Some(1));
    assert!(values.next().unwrap().is_err());

    Ok(())
}

#[test]
fn length_honors_len_metamethod() -> Result<()> {
    let lua = Lua::new();
    let table: Table = lua
        .load("return setmetatable({ 1, 2 }, { __len = function() return 10 end })")
        .eval()?;

    assert_eq!(table.len()?, 10);
    assert_eq!(table.raw_len(), 2);

    Ok(())
}

#[test]
fn push_pop_and_remove() -> Result<()> {
    let lua = Lua::new();
    let table = lua.create_sequence_from([1, 2, 3, 4])?;

    table.push(5)?;
    assert_eq!(table, [1, 2, 3, 4, 5]);

    assert_eq!(table.pop::<i64>()?, 5);
    assert_eq!(table, [1, 2, 3, 4]);

    table.raw_remove(2)?;
    assert_eq!(table, [1, 3, 4]);

    assert!(table.raw_remove(10).is_err());

    table.raw_set("key", "value")?;
    table.raw_remove("key")?;
    assert_eq!(table.raw_get::<_, Value>("key")?, Nil);

    Ok(())
}

#[test]
fn clear_empties_both_parts() -> Result<()> {
    let lua = Lua::new();
    let table: Table = lua.load("return { 1, 2, 3, a = 1, b = 2 }").eval()?;
    assert!(!table.is_empty());

    table.clear()?;
    assert!(table.is_empty());
    assert_eq!(table.raw_len(), 0);

    Ok(())
}

#[test]
fn pairs_visits_every_entry() -> Result<()> {
    let lua = Lua::new();
    let table: Table = lua.load("return { 10, 20, x = 1, y = 2 }").eval()?;

    let mut keys = table
        .pairs::<Value, Value>()
        .map(|pair| pair.and_then(|(k, _)| k.to_string()))
        .collect::<Result<Vec<_>>>()?;
    keys.sort();

    assert_eq!(keys, vec!["1", "2", "x", "y"]);

    Ok(())
}

#[test]
fn equality_uses_eq_metamethod() -> Result<()> {
    let lua = Lua::new();

    let a = lua.create_table()?;
    let b = lua.create_table()?;
    assert!(!a.equals(&b)?);
    assert!(a.equals(&a.clone())?);

    let meta: Table = lua.load("return { __eq = function() return true end }").eval()?;
    a.set_metatable(Some(meta))?;
    assert!(a.equals(&b)?);
    assert_ne!(a, b);

    Ok(())
}

#[test]
fn methods_and_functions() -> Result<()> {
    let lua = Lua::new();
    let object: Table = lua
        .load(
            r#"
            return {
                count = 2,
                times = function(self, n) return self.count * n end,
                add = function(a, b) return a + b end,
            }
        "#,
        )
        .eval()?;

    assert_eq!(object.call_method::<_, i64>("times", 3)?, 6);
    assert_eq!(object.call_function::<_, i64>("add", (1, 2))?, 3);

    let callable: Table = lua
        .load("return setmetatable({}, { __call = function(_, x) return x + 1 end })")
        .eval()?;
    assert_eq!(callable.call::<_, i64>(41)?, 42);

    Ok(())
}

#[test]
fn pretty_debug_output() -> Result<()> {
    let lua = Lua::new();
    let table: Table = lua.load("return { 1, b = { true }, a = 'x' }").eval()?;

    let expected = r#"{
  [1] = 1,
  ["a"] = "x",
  ["b"] = {
    [1] = true,
  },
}"#;
    assert_eq!(format!("{table:#?}"), expected);

    Ok(())
}
