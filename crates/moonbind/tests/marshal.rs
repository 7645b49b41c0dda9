use std::collections::{BTreeMap, HashMap};

use moonbind::{Function, LightUserData, Lua, MultiValue, Result, Table, UserDataType, Value, Variadic};
use pretty_assertions::assert_eq;

struct Marker;

impl UserDataType for Marker {
    const TYPE_NAME: &'static str = "Marker";
}

fn echo(lua: &Lua) -> Result<Function<'_>> {
    lua.create_function(|_, value: Value| Ok(value))
}

#[test]
fn primitives_round_trip() -> Result<()> {
    let lua = Lua::new();
    let echo = echo(&lua)?;

    let values = [
        Value::Nil,
        Value::Boolean(true),
        Value::Boolean(false),
        Value::Integer(-7),
        Value::Integer(i64::MAX),
        Value::Number(0.5),
        Value::NULL,
    ];

    for value in values {
        let back: Value = echo.call(value.clone())?;
        assert_eq!(back, value);
        assert_eq!(back.type_name(), value.type_name());
    }

    Ok(())
}

#[test]
fn integers_and_floats_stay_apart() -> Result<()> {
    let lua = Lua::new();
    let echo = echo(&lua)?;

    let int: Value = echo.call(1)?;
    let float: Value = echo.call(1.0)?;

    assert!(matches!(int, Value::Integer(1)));
    assert!(matches!(float, Value::Number(n) if n == 1.0));

    let kinds: (String, String) = lua
        .load("return math.type(...), math.type(select(2, ...))")
        .call((1, 1.0))?;
    assert_eq!(kinds, ("integer".to_string(), "float".to_string()));

    Ok(())
}

#[test]
fn strings_are_copied_byte_for_byte() -> Result<()> {
    let lua = Lua::new();
    let echo = echo(&lua)?;

    let raw = lua.create_string(b"a\0b\xff")?;
    let back: moonbind::String = echo.call(raw)?;
    assert_eq!(back.as_bytes(), b"a\0b\xff");
    assert!(back.to_str().is_err());

    let len: i64 = lua.load("return #...").call(back)?;
    assert_eq!(len, 4);

    Ok(())
}

#[test]
fn handles_keep_their_identity() -> Result<()> {
    let lua = Lua::new();
    lua.create_custom_type::<Marker>(|_| Ok(()))?;
    let echo = echo(&lua)?;

    let table = lua.create_table()?;
    let back: Table = echo.call(table.clone())?;
    assert_eq!(back, table);
    assert_eq!(back.to_pointer(), table.to_pointer());

    let back: Function = echo.call(echo.clone())?;
    assert_eq!(back, echo);

    let ud = lua.create_userdata(Marker)?;
    let back: Value = echo.call(ud.clone())?;
    assert_eq!(back.as_userdata(), Some(&ud));

    let thread = lua.create_thread(echo.clone())?;
    let back: Value = echo.call(thread.clone())?;
    assert_eq!(back.as_thread(), Some(&thread));

    Ok(())
}

#[test]
fn light_userdata_is_not_a_full_userdata() -> Result<()> {
    let lua = Lua::new();
    let echo = echo(&lua)?;

    let mut slot = 0u8;
    let light = LightUserData(&mut slot as *mut u8 as *mut _);
    let back: Value = echo.call(light)?;

    assert_eq!(back, Value::LightUserData(light));
    assert_eq!(back.type_name(), "lightuserdata");
    assert!(back.as_userdata().is_none());

    let kind: String = lua.load("return type(...)").call(light)?;
    assert_eq!(kind, "userdata");

    Ok(())
}

#[test]
fn arguments_arrive_in_order() -> Result<()> {
    let lua = Lua::new();

    let collect = lua.create_function(|_, args: Variadic<i64>| {
        let args = args.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        Ok(args.join(","))
    })?;
    lua.globals()?.set("collect", collect)?;

    let joined: String = lua.load("return collect(1, 2, 3, 4)").eval()?;
    assert_eq!(joined, "1,2,3,4");

    let swap = lua.create_function(|_, (a, b): (Value, Value)| Ok((b, a)))?;
    let (x, y): (String, i64) = swap.call((7, "seven"))?;
    assert_eq!((x.as_str(), y), ("seven", 7));

    Ok(())
}

#[test]
fn multi_values_adjust_like_lua() -> Result<()> {
    let lua = Lua::new();

    let three = lua.load("return 1, 2, 3").into_function()?;

    let (a, b): (i64, i64) = three.call(())?;
    assert_eq!((a, b), (1, 2));

    let (a, b, c, d): (i64, i64, i64, Option<i64>) = three.call(())?;
    assert_eq!((a, b, c, d), (1, 2, 3, None));

    let all: MultiValue = three.call(())?;
    assert_eq!(all.len(), 3);
    assert_eq!(all[2], Value::Integer(3));

    Ok(())
}

#[test]
fn collections_convert_through_tables() -> Result<()> {
    let lua = Lua::new();

    let list: Vec<i64> = lua.load("return {1, 2, 3}").eval()?;
    assert_eq!(list, vec![1, 2, 3]);

    let map: HashMap<String, i64> = lua.load("return {a = 1, b = 2}").eval()?;
    assert_eq!(map.get("b"), Some(&2));

    let mut tree = BTreeMap::new();
    tree.insert("x".to_string(), 10);
    let sum: i64 = lua.load("local t = ...; return t.x * 2").call(tree)?;
    assert_eq!(sum, 20);

    Ok(())
}

#[test]
fn conversion_failures_are_reported() {
    let lua = Lua::new();

    let err = lua.load("return {}").eval::<i64>().unwrap_err();
    assert_eq!(err.to_string(), "i64 expected, got table");

    let err = lua.load("return 2.5").eval::<i64>().unwrap_err();
    assert!(err.to_string().contains("no integer representation"), "{err}");
}
