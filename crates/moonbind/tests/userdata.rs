use std::cell::Cell;
use std::rc::Rc;

use moonbind::{AnyUserData, Error, Function, LightUserData, Lua, Nil, Result, UserDataType};
use pretty_assertions::assert_eq;

#[derive(Debug)]
struct Counter(i64);

impl UserDataType for Counter {
    const TYPE_NAME: &'static str = "Counter";
}

struct Point {
    x: i64,
    y: i64,
}

impl UserDataType for Point {
    const TYPE_NAME: &'static str = "Point";
}

fn register_counter(lua: &Lua) -> Result<()> {
    lua.create_custom_type::<Counter>(|ty| {
        ty.set_field("kind", "counter")?;
        ty.add_function("new", |lua, start: i64| lua.create_userdata(Counter(start)))?;
        ty.add_method("get", |_, this, ()| Ok(this.0))?;
        ty.add_method_mut("add", |_, this, by: i64| {
            this.0 += by;
            Ok(this.0)
        })?;
        ty.add_method_mut("visit", |_, _this, f: Function| f.call::<_, ()>(()))
    })
}

#[test]
fn methods_fields_and_functions() -> Result<()> {
    let lua = Lua::new();
    register_counter(&lua)?;

    let counter = lua.create_userdata(Counter(1))?;
    lua.globals()?.set("c", counter.clone())?;

    let (value, kind): (i64, String) = lua.load("c:add(4); return c:get(), c.kind").eval()?;
    assert_eq!((value, kind), (5, "counter".to_string()));
    assert_eq!(counter.borrow::<Counter>()?.0, 5);

    let fresh: i64 = lua.load("return c.new(10):add(1)").eval()?;
    assert_eq!(fresh, 11);

    Ok(())
}

#[test]
fn host_mutations_are_visible_to_the_guest() -> Result<()> {
    let lua = Lua::new();
    register_counter(&lua)?;

    let counter = lua.create_userdata(Counter(0))?;
    counter.borrow_mut::<Counter>()?.0 = 42;

    let value: i64 = lua.load("return (...):get()").call(counter)?;
    assert_eq!(value, 42);

    Ok(())
}

#[test]
fn type_table_is_reachable() -> Result<()> {
    let lua = Lua::new();
    assert!(lua.custom_type_table::<Counter>()?.is_none());

    register_counter(&lua)?;
    let table = lua.custom_type_table::<Counter>()?.unwrap();
    assert_eq!(table.raw_get::<_, String>("__name")?, "Counter");

    let counter = lua.create_userdata(Counter(0))?;
    assert_eq!(counter.type_name()?.as_deref(), Some("Counter"));

    let kind: String = lua.load("return getmetatable(...).__name").call(counter)?;
    assert_eq!(kind, "Counter");

    Ok(())
}

#[test]
fn unregistered_types_are_rejected() {
    let lua = Lua::new();

    let err = lua.create_userdata(Counter(0)).unwrap_err();
    assert!(matches!(err, Error::UnregisteredType("Counter")));
    assert_eq!(err.to_string(), "custom type 'Counter' has not been registered");
}

#[test]
fn borrowing_as_the_wrong_type_fails() -> Result<()> {
    let lua = Lua::new();
    register_counter(&lua)?;
    lua.create_custom_type::<Point>(|_| Ok(()))?;

    let point = lua.create_userdata(Point { x: 1, y: 2 })?;
    assert!(point.is::<Point>());
    assert!(!point.is::<Counter>());
    assert!(matches!(point.borrow::<Counter>(), Err(Error::UserDataTypeMismatch)));

    let p = point.borrow::<Point>()?;
    assert_eq!((p.x, p.y), (1, 2));

    // a Point is not a valid receiver for Counter methods
    let err = lua
        .load("local counter, point = ...; return counter.get(point)")
        .call::<_, i64>((lua.create_userdata(Counter(0))?, point.clone()))
        .unwrap_err();
    assert!(err.to_string().contains("userdata is not expected type"), "{err}");

    Ok(())
}

#[test]
fn light_userdata_is_not_a_receiver() -> Result<()> {
    let lua = Lua::new();
    register_counter(&lua)?;

    let counter = lua.create_userdata(Counter(0))?;
    let mut slot = 0u8;
    let light = LightUserData(&mut slot as *mut u8 as *mut _);

    let err = lua
        .load("local counter, light = ...; return counter.get(light)")
        .call::<_, i64>((counter, light))
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("self"), "{message}");
    assert!(message.contains("Counter expected, got lightuserdata"), "{message}");

    Ok(())
}

#[test]
fn nested_mutable_borrows_fail() -> Result<()> {
    let lua = Lua::new();
    register_counter(&lua)?;

    lua.globals()?.set("c", lua.create_userdata(Counter(0))?)?;

    let err = lua.load("c:visit(function() c:get() end)").exec().unwrap_err();
    assert!(err.to_string().contains("userdata already mutably borrowed"), "{err}");

    // the borrow is released once the method returns
    assert_eq!(lua.load("return c:add(1)").eval::<i64>()?, 1);

    let counter: AnyUserData = lua.globals()?.get("c")?;
    let _held = counter.borrow::<Counter>()?;
    assert!(matches!(counter.borrow_mut::<Counter>(), Err(Error::UserDataBorrowMutError)));

    Ok(())
}

struct Tracked(Rc<Cell<u32>>);

impl UserDataType for Tracked {
    const TYPE_NAME: &'static str = "Tracked";
}

#[test]
fn finalizer_sees_the_value_once() -> Result<()> {
    let lua = Lua::new();
    let finalized = Rc::new(Cell::new(0));

    lua.create_custom_type::<Tracked>(|ty| {
        ty.on_finalize(|tracked| tracked.0.set(tracked.0.get() + 1));
        Ok(())
    })?;

    for _ in 0..3 {
        lua.create_userdata(Tracked(finalized.clone()))?;
    }
    let kept = lua.create_userdata(Tracked(finalized.clone()))?;

    lua.gc_collect()?;
    lua.gc_collect()?;
    assert_eq!(finalized.get(), 3);

    drop(kept);
    lua.gc_collect()?;
    assert_eq!(finalized.get(), 4);
    assert_eq!(Rc::strong_count(&finalized), 1);

    Ok(())
}

struct Guarded(Rc<Cell<u32>>);

impl Drop for Guarded {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

impl UserDataType for Guarded {
    const TYPE_NAME: &'static str = "Guarded";
}

#[test]
fn guest_calls_to_the_finalizer_drop_once() -> Result<()> {
    let lua = Lua::new();
    let drops = Rc::new(Cell::new(0));

    register_counter(&lua)?;
    lua.create_custom_type::<Guarded>(|_| Ok(()))?;

    let globals = lua.globals()?;
    globals.set("guarded", lua.create_userdata(Guarded(drops.clone()))?)?;
    globals.set("counter", lua.create_userdata(Counter(3))?)?;
    globals.set("light", LightUserData(std::ptr::null_mut()))?;

    lua.load(
        r#"
        local gc = guarded.__gc
        gc(counter)
        gc(light)
        gc(42)
        gc(guarded)
        gc(guarded)
        getmetatable(counter).__gc(guarded)
    "#,
    )
    .exec()?;
    assert_eq!(drops.get(), 1);

    // instances of other types are left alone
    assert_eq!(lua.load("return counter:get()").eval::<i64>()?, 3);

    let guarded: AnyUserData = globals.get("guarded")?;
    assert!(matches!(guarded.borrow::<Guarded>(), Err(Error::UserDataTypeMismatch)));

    globals.set("guarded", Nil)?;
    drop((guarded, globals));
    lua.gc_collect()?;
    drop(lua);
    assert_eq!(drops.get(), 1);
    assert_eq!(Rc::strong_count(&drops), 1);

    Ok(())
}

#[repr(align(64))]
struct Wide;

impl UserDataType for Wide {
    const TYPE_NAME: &'static str = "Wide";
}

#[test]
fn overaligned_types_are_rejected() {
    let lua = Lua::new();

    let err = lua.create_custom_type::<Wide>(|_| Ok(())).unwrap_err();
    assert!(matches!(err, Error::UnsupportedAlignment { align: 64, .. }), "{err:?}");
    assert!(matches!(lua.create_userdata(Wide), Err(Error::UnregisteredType("Wide"))));
}

#[test]
fn closing_the_state_drops_live_values() -> Result<()> {
    let lua = Lua::new();
    let finalized = Rc::new(Cell::new(0));

    lua.create_custom_type::<Tracked>(|ty| {
        ty.on_finalize(|tracked| tracked.0.set(tracked.0.get() + 1));
        Ok(())
    })?;
    lua.globals()?.set("keep", lua.create_userdata(Tracked(finalized.clone()))?)?;

    drop(lua);
    assert_eq!(finalized.get(), 1);
    assert_eq!(Rc::strong_count(&finalized), 1);

    Ok(())
}

#[test]
fn reregistration_keeps_earlier_instances() -> Result<()> {
    let lua = Lua::new();
    register_counter(&lua)?;
    let old = lua.create_userdata(Counter(1))?;

    lua.create_custom_type::<Counter>(|ty| ty.add_method("get", |_, this, ()| Ok(this.0 * 10)))?;
    let new = lua.create_userdata(Counter(1))?;

    let (a, b): (i64, i64) = lua
        .load("local old, new = ...; return old:get(), new:get()")
        .call((old.clone(), new.clone()))?;
    assert_eq!((a, b), (1, 10));

    assert!(old.is::<Counter>());
    assert!(new.is::<Counter>());

    Ok(())
}

#[test]
fn equality_hook_backs_the_eq_operator() -> Result<()> {
    let lua = Lua::new();
    lua.create_custom_type::<Point>(|ty| {
        ty.on_equals(|a, b| a.x == b.x && a.y == b.y);
        Ok(())
    })?;
    register_counter(&lua)?;

    let a = lua.create_userdata(Point { x: 1, y: 2 })?;
    let b = lua.create_userdata(Point { x: 1, y: 2 })?;
    let c = lua.create_userdata(Point { x: 3, y: 4 })?;

    assert!(a.equals(&b)?);
    assert!(!a.equals(&c)?);
    assert_ne!(a, b);

    let same: bool = lua.load("local a, b = ...; return a == b").call((a.clone(), b))?;
    assert!(same);

    // no hook: identity only
    let x = lua.create_userdata(Counter(1))?;
    let y = lua.create_userdata(Counter(1))?;
    assert!(!x.equals(&y)?);
    assert!(x.equals(&x.clone())?);

    Ok(())
}

#[test]
fn metamethods_through_fields() -> Result<()> {
    let lua = Lua::new();
    lua.create_custom_type::<Point>(|ty| {
        ty.add_function("__tostring", |_, ud: AnyUserData| {
            let p = ud.borrow::<Point>()?;
            Ok(format!("({}, {})", p.x, p.y))
        })?;
        ty.set_field("dimensions", 2)
    })?;

    let point = lua.create_userdata(Point { x: 3, y: -1 })?;
    let (text, dimensions): (String, i64) = lua
        .load("local p = ...; return tostring(p), p.dimensions")
        .call(point)?;
    assert_eq!(text, "(3, -1)");
    assert_eq!(dimensions, 2);

    Ok(())
}
