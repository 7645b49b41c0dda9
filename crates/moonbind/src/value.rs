use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::iter::{self, FromIterator};
use std::ops::Index;
use std::os::raw::c_void;
use std::string::String as StdString;
use std::{fmt, mem, ptr, slice, vec};

use num_traits::FromPrimitive;

#[cfg(feature = "serialize")]
use {
    crate::table::SerializableTable,
    rustc_hash::FxHashSet,
    serde::ser::{self, Serialize, Serializer},
    std::{cell::RefCell, rc::Rc, result::Result as StdResult},
};

use crate::error::{Error, Result};
use crate::function::Function;
use crate::lua::Lua;
use crate::reference::LuaRef;
use crate::string::String;
use crate::table::Table;
use crate::thread::Thread;
use crate::types::{Integer, LightUserData, Number};
use crate::userdata::AnyUserData;

/// A dynamically typed Lua value.
///
/// The `Table`, `Function`, `UserData` and `Thread` variants hold registry handles into the
/// owning Lua state, so they stay valid after the stack slot they were read from is gone.
/// Strings are copied out of the guest on read. Mixing handles between separate `Lua`
/// instances is reported as [`Error::MismatchedLua`].
#[derive(Clone)]
pub enum Value<'lua> {
    /// The Lua value `nil`.
    Nil,
    /// The Lua value `true` or `false`.
    Boolean(bool),
    /// A "light userdata" object, equivalent to a raw pointer.
    LightUserData(LightUserData),
    /// An integer number. Lua keeps integers and floats apart, and so does this enum.
    Integer(Integer),
    /// A floating point number.
    Number(Number),
    /// A copied Lua string. Unlike Rust strings, Lua strings may not be valid UTF-8.
    String(String<'lua>),
    /// Reference to a Lua table.
    Table(Table<'lua>),
    /// Reference to a Lua function (or closure).
    Function(Function<'lua>),
    /// Reference to a full userdata block, usually holding a custom type instance.
    UserData(AnyUserData<'lua>),
    /// Reference to a Lua thread (or coroutine).
    Thread(Thread<'lua>),
}

pub use Value::Nil;

impl<'lua> Value<'lua> {
    /// A special value (lightuserdata) to represent null value.
    ///
    /// It can be used in Lua tables without downsides of `nil`.
    pub const NULL: Value<'static> = Value::LightUserData(LightUserData(ptr::null_mut()));

    /// Returns type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match *self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::LightUserData(_) => "lightuserdata",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::UserData(_) => "userdata",
            Value::Thread(_) => "thread",
        }
    }

    /// Compares two values for equality, invoking `__eq` on tables and userdata.
    pub fn equals<T: AsRef<Self>>(&self, other: T) -> Result<bool> {
        match (self, other.as_ref()) {
            (Value::Table(a), Value::Table(b)) => a.equals(b),
            (Value::UserData(a), Value::UserData(b)) => a.equals(b),
            (a, b) => Ok(a == b),
        }
    }

    /// Converts the value to a generic C pointer.
    ///
    /// Only handle values have one; everything else returns NULL. Used for hashing and debug
    /// output, there is no way back to the value.
    #[inline]
    pub fn to_pointer(&self) -> *const c_void {
        match self {
            Value::LightUserData(ud) => ud.0,
            _ => match self.lua_ref() {
                Some(lref) => lref.to_pointer(),
                None => ptr::null(),
            },
        }
    }

    /// Converts the value to a string, calling `__tostring` where the value has one.
    pub fn to_string(&self) -> Result<StdString> {
        match self {
            Value::Nil => Ok("nil".to_string()),
            Value::Boolean(b) => Ok(b.to_string()),
            Value::LightUserData(ud) if ud.0.is_null() => Ok("null".to_string()),
            Value::LightUserData(ud) => Ok(format!("lightuserdata: {:p}", ud.0)),
            Value::Integer(i) => Ok(i.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) => Ok(s.to_str()?.to_string()),
            _ => match self.lua_ref() {
                Some(lref) => lref.lua.tostring_value(self),
                None => Ok(StdString::new()),
            },
        }
    }

    pub(crate) fn lua_ref(&self) -> Option<&LuaRef<'lua>> {
        match self {
            Value::Table(t) => Some(&t.0),
            Value::Function(f) => Some(&f.0),
            Value::UserData(ud) => Some(&ud.0),
            Value::Thread(t) => Some(&t.0),
            _ => None,
        }
    }

    /// Returns `true` if the value is a [`Nil`].
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns `true` if the value is a [`NULL`](Value::NULL).
    #[inline]
    pub fn is_null(&self) -> bool {
        self == &Self::NULL
    }

    #[inline]
    pub fn is_boolean(&self) -> bool {
        self.as_boolean().is_some()
    }

    #[inline]
    pub fn as_boolean(&self) -> Option<bool> {
        match *self {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn is_light_userdata(&self) -> bool {
        self.as_light_userdata().is_some()
    }

    #[inline]
    pub fn as_light_userdata(&self) -> Option<LightUserData> {
        match *self {
            Value::LightUserData(l) => Some(l),
            _ => None,
        }
    }

    #[inline]
    pub fn is_integer(&self) -> bool {
        self.as_integer().is_some()
    }

    /// Cast the value to [`Integer`].
    ///
    /// Floats are not converted, even when they hold an integral value.
    #[inline]
    pub fn as_integer(&self) -> Option<Integer> {
        match *self {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i32(&self) -> Option<i32> {
        self.as_integer().and_then(|i| i32::try_from(i).ok())
    }

    #[inline]
    pub fn as_u32(&self) -> Option<u32> {
        self.as_integer().and_then(|i| u32::try_from(i).ok())
    }

    #[inline]
    pub fn as_usize(&self) -> Option<usize> {
        self.as_integer().and_then(|i| usize::try_from(i).ok())
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        self.as_number().is_some()
    }

    #[inline]
    pub fn as_number(&self) -> Option<Number> {
        match *self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Cast the value to `f32`, if it is a [`Number`] representable as one.
    #[inline]
    pub fn as_f32(&self) -> Option<f32> {
        self.as_number().and_then(f32::from_f64)
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.as_string().is_some()
    }

    #[inline]
    pub fn as_string(&self) -> Option<&String<'lua>> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Cast the value to [`str`], if it is a string holding valid UTF-8.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        self.as_string().and_then(|s| s.to_str().ok())
    }

    #[inline]
    pub fn as_string_lossy(&self) -> Option<Cow<'_, str>> {
        self.as_string().map(|s| s.to_string_lossy())
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        self.as_table().is_some()
    }

    #[inline]
    pub fn as_table(&self) -> Option<&Table<'lua>> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        self.as_function().is_some()
    }

    #[inline]
    pub fn as_function(&self) -> Option<&Function<'lua>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn is_userdata(&self) -> bool {
        self.as_userdata().is_some()
    }

    #[inline]
    pub fn as_userdata(&self) -> Option<&AnyUserData<'lua>> {
        match self {
            Value::UserData(ud) => Some(ud),
            _ => None,
        }
    }

    #[inline]
    pub fn is_thread(&self) -> bool {
        self.as_thread().is_some()
    }

    #[inline]
    pub fn as_thread(&self) -> Option<&Thread<'lua>> {
        match self {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    // Used to sort keys for Debug printing.
    pub(crate) fn cmp(&self, other: &Self) -> Ordering {
        fn cmp_num(a: Number, b: Number) -> Ordering {
            match (a, b) {
                _ if a < b => Ordering::Less,
                _ if a > b => Ordering::Greater,
                _ => Ordering::Equal,
            }
        }

        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Nil, _) => Ordering::Less,
            (_, Value::Nil) => Ordering::Greater,
            // null sorts right after nil
            (Value::LightUserData(ud1), Value::LightUserData(ud2)) if ud1 == ud2 => Ordering::Equal,
            (Value::LightUserData(ud1), _) if ud1.0.is_null() => Ordering::Less,
            (_, Value::LightUserData(ud2)) if ud2.0.is_null() => Ordering::Greater,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Boolean(_), _) => Ordering::Less,
            (_, Value::Boolean(_)) => Ordering::Greater,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (&Value::Integer(a), &Value::Number(b)) => cmp_num(a as Number, b),
            (&Value::Number(a), &Value::Integer(b)) => cmp_num(a, b as Number),
            (&Value::Number(a), &Value::Number(b)) => cmp_num(a, b),
            (Value::Integer(_) | Value::Number(_), _) => Ordering::Less,
            (_, Value::Integer(_) | Value::Number(_)) => Ordering::Greater,
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::String(_), _) => Ordering::Less,
            (_, Value::String(_)) => Ordering::Greater,
            (a, b) => a.to_pointer().cmp(&b.to_pointer()),
        }
    }

    pub(crate) fn fmt_pretty(
        &self,
        fmt: &mut fmt::Formatter,
        recursive: bool,
        ident: usize,
        visited: &mut HashSet<*const c_void>,
    ) -> fmt::Result {
        match self {
            Value::Nil => write!(fmt, "nil"),
            Value::Boolean(b) => write!(fmt, "{b}"),
            Value::LightUserData(ud) if ud.0.is_null() => write!(fmt, "null"),
            Value::LightUserData(ud) => write!(fmt, "lightuserdata: {:?}", ud.0),
            Value::Integer(i) => write!(fmt, "{i}"),
            Value::Number(n) => write!(fmt, "{n}"),
            Value::String(s) => write!(fmt, "{s:?}"),
            Value::Table(t) if recursive && !visited.contains(&t.to_pointer()) => {
                t.fmt_pretty(fmt, ident, visited)
            }
            Value::Table(t) => write!(fmt, "table: {:?}", t.to_pointer()),
            Value::Function(f) => write!(fmt, "function: {:?}", f.to_pointer()),
            Value::UserData(ud) => write!(fmt, "userdata: {:?}", ud.to_pointer()),
            Value::Thread(t) => write!(fmt, "thread: {:?}", t.to_pointer()),
        }
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if fmt.alternate() {
            return self.fmt_pretty(fmt, true, 0, &mut HashSet::new());
        }
        match self {
            Value::Nil => write!(fmt, "Nil"),
            Value::Boolean(b) => write!(fmt, "Boolean({b})"),
            Value::LightUserData(ud) => write!(fmt, "{ud:?}"),
            Value::Integer(i) => write!(fmt, "Integer({i})"),
            Value::Number(n) => write!(fmt, "Number({n})"),
            Value::String(s) => write!(fmt, "String({s:?})"),
            Value::Table(t) => write!(fmt, "{t:?}"),
            Value::Function(f) => write!(fmt, "{f:?}"),
            Value::UserData(ud) => write!(fmt, "{ud:?}"),
            Value::Thread(t) => write!(fmt, "{t:?}"),
        }
    }
}

/// Raw equality: numbers compare across the integer/float split, handles by identity.
impl PartialEq for Value<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => *a == *b,
            (Value::Integer(a), Value::Number(b)) => *a as Number == *b,
            (Value::Number(a), Value::Integer(b)) => *a == *b as Number,
            (Value::Number(a), Value::Number(b)) => *a == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::UserData(a), Value::UserData(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl<'lua> AsRef<Value<'lua>> for Value<'lua> {
    #[inline]
    fn as_ref(&self) -> &Self {
        self
    }
}

/// A [`Value`] being serialized, carrying the set of tables already on the path so a table
/// that contains itself is reported instead of recursing forever.
#[cfg(feature = "serialize")]
pub(crate) struct SerializableValue<'a, 'lua> {
    value: &'a Value<'lua>,
    visited: Rc<RefCell<FxHashSet<*const c_void>>>,
}

#[cfg(feature = "serialize")]
impl Serialize for Value<'_> {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        SerializableValue::new(self, Default::default()).serialize(serializer)
    }
}

#[cfg(feature = "serialize")]
impl<'a, 'lua> SerializableValue<'a, 'lua> {
    #[inline]
    pub(crate) fn new(
        value: &'a Value<'lua>,
        visited: Rc<RefCell<FxHashSet<*const c_void>>>,
    ) -> Self {
        Self { value, visited }
    }
}

#[cfg(feature = "serialize")]
impl Serialize for SerializableValue<'_, '_> {
    fn serialize<S>(&self, serializer: S) -> StdResult<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.value {
            Value::Nil => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::String(s) => s.serialize(serializer),
            Value::Table(t) => {
                SerializableTable::new(t, self.visited.clone()).serialize(serializer)
            }
            Value::LightUserData(ud) if ud.0.is_null() => serializer.serialize_none(),
            Value::Function(_) | Value::Thread(_) | Value::UserData(_) | Value::LightUserData(_) => {
                let msg = format!("cannot serialize <{}>", self.value.type_name());
                Err(ser::Error::custom(msg))
            }
        }
    }
}

/// Trait for types convertible to `Value`.
pub trait IntoLua<'lua>: Sized {
    /// Performs the conversion.
    fn into_lua(self, lua: &'lua Lua) -> Result<Value<'lua>>;
}

/// Trait for types convertible from `Value`.
pub trait FromLua<'lua>: Sized {
    /// Performs the conversion.
    fn from_lua(value: Value<'lua>, lua: &'lua Lua) -> Result<Self>;

    /// Performs the conversion for a callback argument.
    ///
    /// `i` is the argument position, `to` the name of the function that received it.
    #[doc(hidden)]
    #[inline]
    fn from_lua_arg(arg: Value<'lua>, i: usize, to: Option<&str>, lua: &'lua Lua) -> Result<Self> {
        Self::from_lua(arg, lua).map_err(|err| Error::bad_argument(to, i, None, err))
    }
}

/// Multiple Lua values used for both argument passing and also for multiple return values.
///
/// Values are stored back to front so popping the next argument is cheap.
#[derive(Debug, Clone)]
pub struct MultiValue<'lua> {
    vec: Vec<Value<'lua>>,
    lua: Option<&'lua Lua>,
}

impl Drop for MultiValue<'_> {
    fn drop(&mut self) {
        if let Some(lua) = self.lua {
            let vec = mem::take(&mut self.vec);
            lua.push_multivalue_to_pool(vec);
        }
    }
}

impl<'lua> MultiValue<'lua> {
    /// Creates an empty `MultiValue` containing no values.
    pub const fn new() -> MultiValue<'lua> {
        MultiValue {
            vec: Vec::new(),
            lua: None,
        }
    }

    /// Similar to `new` but can reuse previously used container with allocated capacity.
    #[inline]
    pub(crate) fn with_lua_and_capacity(lua: &'lua Lua, capacity: usize) -> MultiValue<'lua> {
        let vec = lua
            .pop_multivalue_from_pool()
            .map(|mut vec| {
                vec.reserve(capacity);
                vec
            })
            .unwrap_or_else(|| Vec::with_capacity(capacity));
        MultiValue {
            vec,
            lua: Some(lua),
        }
    }

    #[inline]
    pub fn from_vec(mut vec: Vec<Value<'lua>>) -> MultiValue<'lua> {
        vec.reverse();
        MultiValue { vec, lua: None }
    }

    #[inline]
    pub fn into_vec(mut self) -> Vec<Value<'lua>> {
        let mut vec = mem::take(&mut self.vec);
        mem::forget(self);
        vec.reverse();
        vec
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value<'lua>> {
        if index < self.vec.len() {
            return self.vec.get(self.vec.len() - index - 1);
        }
        None
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Value<'lua>> {
        self.vec.pop()
    }

    #[inline]
    pub fn push_front(&mut self, value: Value<'lua>) {
        self.vec.push(value);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.vec.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vec.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> iter::Rev<slice::Iter<'_, Value<'lua>>> {
        self.vec.iter().rev()
    }
}

impl<'lua> Default for MultiValue<'lua> {
    #[inline]
    fn default() -> MultiValue<'lua> {
        MultiValue::new()
    }
}

impl<'lua> FromIterator<Value<'lua>> for MultiValue<'lua> {
    #[inline]
    fn from_iter<I: IntoIterator<Item = Value<'lua>>>(iter: I) -> Self {
        MultiValue::from_vec(Vec::from_iter(iter))
    }
}

impl<'lua> IntoIterator for MultiValue<'lua> {
    type Item = Value<'lua>;
    type IntoIter = iter::Rev<vec::IntoIter<Value<'lua>>>;

    #[inline]
    fn into_iter(mut self) -> Self::IntoIter {
        let vec = mem::take(&mut self.vec);
        mem::forget(self);
        vec.into_iter().rev()
    }
}

impl<'a, 'lua> IntoIterator for &'a MultiValue<'lua> {
    type Item = &'a Value<'lua>;
    type IntoIter = iter::Rev<slice::Iter<'a, Value<'lua>>>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.vec.iter().rev()
    }
}

impl<'lua> Index<usize> for MultiValue<'lua> {
    type Output = Value<'lua>;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        if let Some(result) = self.get(index) {
            result
        } else {
            panic!(
                "index out of bounds: the len is {} but the index is {}",
                self.len(),
                index
            )
        }
    }
}

/// Trait for types convertible to any number of Lua values.
///
/// This is a generalization of `IntoLua`, allowing any number of resulting Lua values instead of just
/// one. Any type that implements `IntoLua` will automatically implement this trait.
pub trait IntoLuaMulti<'lua>: Sized {
    /// Performs the conversion.
    fn into_lua_multi(self, lua: &'lua Lua) -> Result<MultiValue<'lua>>;
}

/// Trait for types that can be created from an arbitrary number of Lua values.
///
/// Excess values are ignored and missing values are treated as nil, the same way Lua itself
/// adjusts argument lists.
pub trait FromLuaMulti<'lua>: Sized {
    /// Performs the conversion.
    fn from_lua_multi(values: MultiValue<'lua>, lua: &'lua Lua) -> Result<Self>;

    /// Performs the conversion for a callback argument list, starting at position `i`.
    #[doc(hidden)]
    #[inline]
    fn from_lua_args(
        args: MultiValue<'lua>,
        i: usize,
        to: Option<&str>,
        lua: &'lua Lua,
    ) -> Result<Self> {
        let _ = (i, to);
        Self::from_lua_multi(args, lua)
    }
}

#[cfg(test)]
mod assertions {
    use super::*;

    static_assertions::assert_not_impl_any!(Value<'_>: Send);
    static_assertions::assert_not_impl_any!(MultiValue<'_>: Send);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn f32_accessor_only_reads_floats() {
        assert_eq!(Value::Number(0.5).as_f32(), Some(0.5));
        assert_eq!(Value::Integer(1).as_f32(), None);
        assert_eq!(Value::Nil.as_f32(), None);
    }
}
