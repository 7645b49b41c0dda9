use std::collections::HashSet;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;

use mlua_sys as ffi;

#[cfg(feature = "serialize")]
use {
    crate::value::SerializableValue,
    rustc_hash::FxHashSet,
    serde::ser::{self, Serialize, SerializeMap, SerializeSeq, Serializer},
    std::{cell::RefCell, rc::Rc, result::Result as StdResult},
};

use crate::error::{Error, Result};
use crate::function::Function;
use crate::private::Sealed;
use crate::reference::LuaRef;
use crate::stack::{check_stack, safe_equal, safe_gettable, safe_len, safe_next, safe_rawset, safe_settable, StackGuard};
use crate::types::Integer;
use crate::value::{FromLua, FromLuaMulti, IntoLua, IntoLuaMulti, Nil, Value};

/// Handle to a guest table.
#[derive(Clone)]
pub struct Table<'lua>(pub(crate) LuaRef<'lua>);

impl<'lua> Table<'lua> {
    /// Sets a key-value pair in the table.
    ///
    /// If the value is `nil`, this will effectively remove the pair.
    ///
    /// This might invoke the `__newindex` metamethod. Use the [`raw_set`] method if that is not
    /// desired.
    ///
    /// # Examples
    ///
    /// Export a value as a global to make it usable from Lua:
    ///
    /// ```
    /// # use moonbind::{Lua, Result};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let globals = lua.globals()?;
    ///
    /// globals.set("assertions", cfg!(debug_assertions))?;
    ///
    /// lua.load(r#"
    ///     if assertions == true then
    ///         -- ...
    ///     elseif assertions == false then
    ///         -- ...
    ///     else
    ///         error("assertions neither on nor off?")
    ///     end
    /// "#).exec()?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// [`raw_set`]: #method.raw_set
    pub fn set<K: IntoLua<'lua>, V: IntoLua<'lua>>(&self, key: K, value: V) -> Result<()> {
        let lua = self.0.lua;
        let key = key.into_lua(lua)?;
        let value = value.into_lua(lua)?;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 5)?;

            lua.push_ref(&self.0)?;
            lua.push_value(&key)?;
            lua.push_value(&value)?;
            lua.protect_lua(state, 3, 0, safe_settable)
        }
    }

    /// Gets the value associated to `key` from the table.
    ///
    /// If no value is associated to `key`, returns the `nil` value. A miss follows the `__index`
    /// chain of the metatable the way guest code does.
    ///
    /// # Examples
    ///
    /// Query the version of the Lua interpreter:
    ///
    /// ```
    /// # use moonbind::{Lua, Result};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let globals = lua.globals()?;
    ///
    /// let version: String = globals.get("_VERSION")?;
    /// println!("Lua version: {}", version);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// [`raw_get`]: #method.raw_get
    pub fn get<K: IntoLua<'lua>, V: FromLua<'lua>>(&self, key: K) -> Result<V> {
        let lua = self.0.lua;
        let key = key.into_lua(lua)?;

        let value = unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 4)?;

            lua.push_ref(&self.0)?;
            lua.push_value(&key)?;
            lua.protect_lua(state, 2, 1, safe_gettable)?;

            lua.pop_value(-1).unwrap_or(Nil)
        };

        V::from_lua(value, lua)
    }

    /// Checks whether the table contains a non-nil value for `key`.
    ///
    /// This might invoke the `__index` metamethod.
    pub fn contains_key<K: IntoLua<'lua>>(&self, key: K) -> Result<bool> {
        Ok(self.get::<_, Value<'_>>(key)? != Nil)
    }

    /// Appends a value to the back of the table.
    ///
    /// This might invoke the `__len` and `__newindex` metamethods.
    pub fn push<V: IntoLua<'lua>>(&self, value: V) -> Result<()> {
        let len = self.len()?;
        self.set(len + 1, value)
    }

    /// Removes the last element from the table and returns it.
    ///
    /// This might invoke the `__len` and `__newindex` metamethods.
    pub fn pop<V: FromLua<'lua>>(&self) -> Result<V> {
        let len = self.len()?;

        if len == 0 {
            return V::from_lua(Nil, self.0.lua);
        }

        let value = self.get::<_, Value>(len)?;
        self.set(len, Nil)?;

        V::from_lua(value, self.0.lua)
    }

    /// Compares two tables for equality.
    ///
    /// Tables are compared by reference first, then through the `__eq` metamethod of either
    /// table.
    ///
    /// # Examples
    ///
    /// Compare two tables using `__eq` metamethod:
    ///
    /// ```
    /// # use moonbind::{Lua, Result, Table};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let table1 = lua.create_table()?;
    /// table1.set(1, "value")?;
    ///
    /// let table2 = lua.create_table()?;
    /// table2.set(2, "value")?;
    ///
    /// let always_equals_mt = lua.create_table()?;
    /// always_equals_mt.set("__eq", lua.create_function(|_, (_t1, _t2): (Table, Table)| Ok(true))?)?;
    /// table2.set_metatable(Some(always_equals_mt))?;
    ///
    /// assert!(table1.equals(&table1.clone())?);
    /// assert!(table1.equals(&table2)?);
    /// # Ok(())
    /// # }
    /// ```
    pub fn equals<T: AsRef<Self>>(&self, other: T) -> Result<bool> {
        let other = other.as_ref();
        if self == other {
            return Ok(true);
        }

        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 4)?;

            lua.push_ref(&self.0)?;
            lua.push_ref(&other.0)?;
            lua.protect_lua(state, 2, 1, safe_equal)?;

            Ok(ffi::lua_toboolean(state, -1) != 0)
        }
    }

    /// Sets a key-value pair without invoking metamethods.
    pub fn raw_set<K: IntoLua<'lua>, V: IntoLua<'lua>>(&self, key: K, value: V) -> Result<()> {
        let lua = self.0.lua;
        let key = key.into_lua(lua)?;
        let value = value.into_lua(lua)?;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 5)?;

            lua.push_ref(&self.0)?;
            lua.push_value(&key)?;
            lua.push_value(&value)?;
            // a nil or NaN key still raises
            lua.protect_lua(state, 3, 0, safe_rawset)
        }
    }

    /// Gets the value associated to `key` without invoking metamethods.
    pub fn raw_get<K: IntoLua<'lua>, V: FromLua<'lua>>(&self, key: K) -> Result<V> {
        let lua = self.0.lua;
        let key = key.into_lua(lua)?;

        let value = unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 3)?;

            lua.push_ref(&self.0)?;
            lua.push_value(&key)?;
            ffi::lua_rawget(state, -2);

            lua.pop_value(-1).unwrap_or(Nil)
        };

        V::from_lua(value, lua)
    }

    /// Removes a key from the table.
    ///
    /// If `key` is an integer inside the sequence, the elements above it are shifted down the
    /// way `table.remove` does. For other keys this is equivalent to setting `table[key] = nil`.
    /// No metamethods are invoked.
    pub fn raw_remove<K: IntoLua<'lua>>(&self, key: K) -> Result<()> {
        let lua = self.0.lua;
        let key = key.into_lua(lua)?;

        match key {
            Value::Integer(idx) => {
                let size = self.raw_len() as Integer;
                if idx < 1 || idx > size {
                    return Err(Error::runtime("index out of bounds"));
                }

                unsafe {
                    let state = lua.state();
                    let _sg = StackGuard::new(state);
                    check_stack(state, 2)?;

                    lua.push_ref(&self.0)?;
                    for i in idx..size {
                        ffi::lua_rawgeti(state, -1, i + 1);
                        ffi::lua_rawseti(state, -2, i);
                    }
                    ffi::lua_pushnil(state);
                    ffi::lua_rawseti(state, -2, size);
                }

                Ok(())
            }
            _ => self.raw_set(key, Nil),
        }
    }

    /// Clears the table, removing all keys and values from array and hash parts,
    /// without invoking metamethods.
    pub fn clear(&self) -> Result<()> {
        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 5)?;

            lua.push_ref(&self.0)?;
            ffi::lua_pushnil(state);

            // assigning nil to an existing field is allowed during traversal
            while ffi::lua_next(state, -2) != 0 {
                ffi::lua_pop(state, 1);
                ffi::lua_pushvalue(state, -1);
                ffi::lua_pushnil(state);
                ffi::lua_rawset(state, -4);
            }
        }

        Ok(())
    }

    /// Returns the result of the Lua `#` operator.
    ///
    /// This might invoke the `__len` metamethod. Use the [`raw_len`] method if that is not desired.
    ///
    /// [`raw_len`]: #method.raw_len
    pub fn len(&self) -> Result<Integer> {
        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 3)?;

            lua.push_ref(&self.0)?;
            lua.protect_lua(state, 1, 1, safe_len)?;

            Ok(ffi::lua_tointeger(state, -1))
        }
    }

    /// Returns the result of the Lua `#` operator, without invoking the `__len` metamethod.
    pub fn raw_len(&self) -> usize {
        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);

            if check_stack(state, 1).is_err() {
                return 0;
            }

            lua.push_ref_unchecked(&self.0);
            ffi::lua_rawlen(state, -1)
        }
    }

    /// Returns `true` if the table is empty, without invoking metamethods.
    ///
    /// It checks both the array part and the hash part.
    pub fn is_empty(&self) -> bool {
        if self.raw_len() != 0 {
            return false;
        }

        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);

            if check_stack(state, 3).is_err() {
                return false;
            }

            lua.push_ref_unchecked(&self.0);
            ffi::lua_pushnil(state);
            ffi::lua_next(state, -2) == 0
        }
    }

    /// Returns a reference to the metatable of this table, or `None` if no metatable is set.
    ///
    /// Unlike the `getmetatable` Lua function, this method ignores the `__metatable` field.
    pub fn get_metatable(&self) -> Option<Table<'lua>> {
        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);

            if check_stack(state, 2).is_err() {
                return None;
            }

            lua.push_ref_unchecked(&self.0);
            if ffi::lua_getmetatable(state, -1) == 0 {
                return None;
            }

            Some(Table(lua.pop_ref()))
        }
    }

    /// Sets or removes the metatable of this table.
    ///
    /// If `metatable` is `None`, the metatable is removed (if no metatable is set, this does
    /// nothing).
    pub fn set_metatable(&self, metatable: Option<Table<'lua>>) -> Result<()> {
        let lua = self.0.lua;

        unsafe {
            let state = lua.state();
            let _sg = StackGuard::new(state);
            check_stack(state, 2)?;

            lua.push_ref(&self.0)?;
            match &metatable {
                Some(metatable) => lua.push_ref(&metatable.0)?,
                None => ffi::lua_pushnil(state),
            }
            ffi::lua_setmetatable(state, -2);
        }

        Ok(())
    }

    /// Installs this table as the metatable of `table`.
    pub fn become_metatable_for(&self, table: &Table<'lua>) -> Result<()> {
        table.set_metatable(Some(self.clone()))
    }

    /// Returns true if the table has metatable attached.
    #[doc(hidden)]
    #[inline]
    pub fn has_metatable(&self) -> bool {
        self.get_metatable().is_some()
    }

    /// Converts the table to a generic C pointer.
    ///
    /// There is no way to convert the pointer back to its original value.
    ///
    /// Typically this function is used only for hashing and debug information.
    #[inline]
    pub fn to_pointer(&self) -> *const c_void {
        self.0.to_pointer()
    }

    /// Consume this table and return an iterator over the pairs of the table.
    ///
    /// This works like the Lua `pairs` function, but does not invoke the `__pairs` metamethod.
    ///
    /// The pairs are wrapped in a [`Result`], since they are lazily converted to `K` and `V` types.
    ///
    /// # Note
    ///
    /// While this method consumes the `Table` object, it can not prevent code from mutating the
    /// table while the iteration is in progress. Refer to the [Lua manual] for information about
    /// the consequences of such mutation.
    ///
    /// # Examples
    ///
    /// Iterate over all globals:
    ///
    /// ```
    /// # use moonbind::{Lua, Result, Value};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let globals = lua.globals()?;
    ///
    /// for pair in globals.pairs::<Value, Value>() {
    ///     let (key, value) = pair?;
    /// #   let _ = (key, value);   // used
    ///     // ...
    /// }
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// [`Result`]: crate::Result
    /// [Lua manual]: http://www.lua.org/manual/5.4/manual.html#pdf-next
    pub fn pairs<K: FromLua<'lua>, V: FromLua<'lua>>(self) -> TablePairs<'lua, K, V> {
        TablePairs {
            table: self,
            key: Some(Nil),
            _phantom: PhantomData,
        }
    }

    /// Consume this table and return an iterator over all values in the sequence part of the table.
    ///
    /// The iterator will yield all values `t[1]`, `t[2]` and so on, until a `nil` value is
    /// encountered. This mirrors the behavior of Lua's `ipairs` function but does not invoke
    /// any metamethods.
    ///
    /// # Examples
    ///
    /// ```
    /// # use moonbind::{Lua, Result, Table};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let my_table: Table = lua.load(r#"
    ///     {
    ///         [1] = 4,
    ///         [2] = 5,
    ///         [4] = 7,
    ///         key = 2
    ///     }
    /// "#).eval()?;
    ///
    /// let expected = [4, 5];
    /// for (&expected, got) in expected.iter().zip(my_table.sequence_values::<u32>()) {
    ///     assert_eq!(expected, got?);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn sequence_values<V: FromLua<'lua>>(self) -> TableSequence<'lua, V> {
        TableSequence {
            table: self,
            index: 1,
            _phantom: PhantomData,
        }
    }

    pub(crate) fn fmt_pretty(
        &self,
        fmt: &mut fmt::Formatter,
        ident: usize,
        visited: &mut HashSet<*const c_void>,
    ) -> fmt::Result {
        visited.insert(self.to_pointer());

        let t = self.clone();
        // Collect key/value pairs into a vector so we can sort them
        let mut pairs = t
            .pairs::<Value<'_>, Value<'_>>()
            .flatten()
            .collect::<Vec<_>>();
        // Sort keys
        pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
        if pairs.is_empty() {
            return write!(fmt, "{{}}");
        }
        writeln!(fmt, "{{")?;
        for (key, value) in pairs {
            write!(fmt, "{}[", " ".repeat(ident + 2))?;
            key.fmt_pretty(fmt, false, ident + 2, visited)?;
            write!(fmt, "] = ")?;
            value.fmt_pretty(fmt, true, ident + 2, visited)?;
            writeln!(fmt, ",")?;
        }
        write!(fmt, "{}}}", " ".repeat(ident))
    }
}

impl fmt::Debug for Table<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if fmt.alternate() {
            return self.fmt_pretty(fmt, 0, &mut HashSet::new());
        }
        write!(fmt, "Table({:?})", self.0)
    }
}

impl PartialEq for Table<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<'lua> AsRef<Table<'lua>> for Table<'lua> {
    #[inline]
    fn as_ref(&self) -> &Self {
        self
    }
}

impl<'lua, T> PartialEq<[T]> for Table<'lua>
where
    T: IntoLua<'lua> + Clone,
{
    fn eq(&self, other: &[T]) -> bool {
        if self.raw_len() != other.len() {
            return false;
        }

        for (i, expected) in other.iter().enumerate() {
            let Ok(value) = self.raw_get::<_, Value>(i as Integer + 1) else {
                return false;
            };
            let Ok(expected) = expected.clone().into_lua(self.0.lua) else {
                return false;
            };

            if value != expected {
                return false;
            }
        }

        true
    }
}

impl<'lua, T> PartialEq<&[T]> for Table<'lua>
where
    T: IntoLua<'lua> + Clone,
{
    #[inline]
    fn eq(&self, other: &&[T]) -> bool {
        self == *other
    }
}

impl<'lua, T, const N: usize> PartialEq<[T; N]> for Table<'lua>
where
    T: IntoLua<'lua> + Clone,
{
    #[inline]
    fn eq(&self, other: &[T; N]) -> bool {
        self == &other[..]
    }
}

/// An extension trait for `Table`s that provides a variety of convenient functionality.
pub trait TableExt<'lua>: Sealed {
    /// Calls the table as function assuming it has `__call` metamethod.
    ///
    /// The metamethod is called with the table as its first argument, followed by the passed arguments.
    fn call<A, R>(&self, args: A) -> Result<R>
    where
        A: IntoLuaMulti<'lua>,
        R: FromLuaMulti<'lua>;

    /// Gets the function associated to `key` from the table and executes it,
    /// passing the table itself along with `args` as function arguments.
    ///
    /// This is a shortcut for
    /// `table.get::<_, Function>(key)?.call((table.clone(), arg1, ..., argN))`
    ///
    /// This might invoke the `__index` metamethod.
    fn call_method<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: IntoLuaMulti<'lua>,
        R: FromLuaMulti<'lua>;

    /// Gets the function associated to `key` from the table and executes it,
    /// passing `args` as function arguments.
    ///
    /// This is a shortcut for
    /// `table.get::<_, Function>(key)?.call(args)`
    ///
    /// This might invoke the `__index` metamethod.
    fn call_function<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: IntoLuaMulti<'lua>,
        R: FromLuaMulti<'lua>;
}

impl<'lua> TableExt<'lua> for Table<'lua> {
    fn call<A, R>(&self, args: A) -> Result<R>
    where
        A: IntoLuaMulti<'lua>,
        R: FromLuaMulti<'lua>,
    {
        // `lua_pcall` dispatches through `__call` for any callable value
        Function(self.0.clone()).call(args)
    }

    fn call_method<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: IntoLuaMulti<'lua>,
        R: FromLuaMulti<'lua>,
    {
        let lua = self.0.lua;
        let mut args = args.into_lua_multi(lua)?;
        args.push_front(Value::Table(self.clone()));
        self.get::<_, Function<'_>>(name)?.call(args)
    }

    fn call_function<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: IntoLuaMulti<'lua>,
        R: FromLuaMulti<'lua>,
    {
        self.get::<_, Function<'_>>(name)?.call(args)
    }
}

/// A [`Table`] being serialized, sharing the set of tables on the current path.
#[cfg(feature = "serialize")]
pub(crate) struct SerializableTable<'a, 'lua> {
    table: &'a Table<'lua>,
    visited: Rc<RefCell<FxHashSet<*const c_void>>>,
}

#[cfg(feature = "serialize")]
impl Serialize for Table<'_> {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        SerializableTable::new(self, Default::default()).serialize(serializer)
    }
}

#[cfg(feature = "serialize")]
impl<'a, 'lua> SerializableTable<'a, 'lua> {
    #[inline]
    pub(crate) fn new(
        table: &'a Table<'lua>,
        visited: Rc<RefCell<FxHashSet<*const c_void>>>,
    ) -> Self {
        Self { table, visited }
    }
}

#[cfg(feature = "serialize")]
impl Serialize for SerializableTable<'_, '_> {
    fn serialize<S>(&self, serializer: S) -> StdResult<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ptr = self.table.to_pointer();
        if !self.visited.borrow_mut().insert(ptr) {
            return Err(ser::Error::custom("recursive table detected"));
        }

        let result = (|| {
            // Array
            let len = self.table.raw_len();
            if len > 0 {
                let mut seq = serializer.serialize_seq(Some(len))?;
                for value in self.table.clone().sequence_values::<Value<'_>>() {
                    let value = value.map_err(ser::Error::custom)?;
                    seq.serialize_element(&SerializableValue::new(&value, self.visited.clone()))?;
                }
                return seq.end();
            }

            // Map, sorted so the output is stable
            let mut pairs = self
                .table
                .clone()
                .pairs::<Value<'_>, Value<'_>>()
                .collect::<Result<Vec<_>>>()
                .map_err(ser::Error::custom)?;
            pairs.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut map = serializer.serialize_map(Some(pairs.len()))?;
            for (key, value) in &pairs {
                map.serialize_entry(
                    &SerializableValue::new(key, self.visited.clone()),
                    &SerializableValue::new(value, self.visited.clone()),
                )?;
            }
            map.end()
        })();

        self.visited.borrow_mut().remove(&ptr);
        result
    }
}

/// An iterator over the pairs of a Lua table.
///
/// This struct is created by the [`Table::pairs`] method.
///
/// [`Table::pairs`]: crate::Table::pairs
pub struct TablePairs<'lua, K, V> {
    table: Table<'lua>,
    key: Option<Value<'lua>>,
    _phantom: PhantomData<(K, V)>,
}

impl<'lua, K, V> Iterator for TablePairs<'lua, K, V>
where
    K: FromLua<'lua>,
    V: FromLua<'lua>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let prev_key = self.key.take()?;
        let lua = self.table.0.lua;

        let res = (|| -> Result<Option<(K, V)>> {
            let (key, value) = unsafe {
                let state = lua.state();
                let _sg = StackGuard::new(state);
                check_stack(state, 4)?;

                lua.push_ref(&self.table.0)?;
                lua.push_value(&prev_key)?;
                lua.protect_lua(state, 2, 2, safe_next)?;

                let value = lua.pop_value(-1).unwrap_or(Nil);
                let key = lua.pop_value(-1).unwrap_or(Nil);
                (key, value)
            };

            if key.is_nil() {
                return Ok(None);
            }

            self.key = Some(key.clone());

            let key = K::from_lua(key, lua)?;
            let value = V::from_lua(value, lua)?;

            Ok(Some((key, value)))
        })();

        res.transpose()
    }
}

/// An iterator over the sequence part of a Lua table.
///
/// This struct is created by the [`Table::sequence_values`] method.
///
/// [`Table::sequence_values`]: crate::Table::sequence_values
pub struct TableSequence<'lua, V> {
    table: Table<'lua>,
    index: Integer,
    _phantom: PhantomData<V>,
}

impl<'lua, V> Iterator for TableSequence<'lua, V>
where
    V: FromLua<'lua>,
{
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let value = match self.table.raw_get::<_, Value>(self.index) {
            Ok(Value::Nil) => return None,
            Ok(value) => value,
            Err(err) => return Some(Err(err)),
        };

        self.index += 1;
        Some(V::from_lua(value, self.table.0.lua))
    }
}
