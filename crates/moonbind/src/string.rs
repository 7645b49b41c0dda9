use std::borrow::{Borrow, Cow};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::lua::Lua;

#[cfg(feature = "serialize")]
use {
    ::serde::ser::{Serialize, Serializer},
    std::result::Result as StdResult,
};

/// A Lua string, copied out of the guest when it was read.
///
/// Guest string buffers only live as long as the stack slot they came from, so the bytes are
/// owned here. Clones share the same buffer.
#[derive(Clone)]
pub struct String<'lua> {
    bytes: Rc<[u8]>,
    _lua: PhantomData<&'lua Lua>,
}

impl<'lua> String<'lua> {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        String {
            bytes: Rc::from(bytes),
            _lua: PhantomData,
        }
    }

    /// Get a `&str` slice if the Lua string is valid UTF-8.
    ///
    /// # Examples
    ///
    /// ```
    /// # use moonbind::{Lua, Result, String};
    /// # fn main() -> Result<()> {
    /// # let lua = Lua::new();
    /// let globals = lua.globals()?;
    ///
    /// let version: String = globals.get("_VERSION")?;
    /// assert!(version.to_str()?.contains("Lua"));
    ///
    /// let non_utf8: String = lua.load(r#"  "test\255"  "#).eval()?;
    /// assert!(non_utf8.to_str().is_err());
    /// # Ok(())
    /// # }
    /// ```
    #[inline]
    pub fn to_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.bytes)
            .map_err(|e| Error::from_lua_conversion("string", "&str", e.to_string()))
    }

    /// Converts this string to a [`Cow<str>`], replacing invalid sequences with `U+FFFD`.
    #[inline]
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        std::string::String::from_utf8_lossy(&self.bytes)
    }

    /// The raw bytes, including any embedded nul bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for String<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.as_bytes();

        if let Ok(s) = std::str::from_utf8(bytes) {
            return s.fmt(f);
        }

        write!(f, "b\"")?;
        for &b in bytes {
            match b {
                b'\n' => write!(f, "\\n")?,
                b'\r' => write!(f, "\\r")?,
                b'\t' => write!(f, "\\t")?,
                b'\\' | b'"' => write!(f, "\\{}", b as char)?,
                b'\0' => write!(f, "\\0")?,
                0x20..=0x7e => write!(f, "{}", b as char)?,
                _ => write!(f, "\\x{b:02x}")?,
            }
        }
        write!(f, "\"")
    }
}

impl AsRef<[u8]> for String<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Borrow<[u8]> for String<'_> {
    fn borrow(&self) -> &[u8] {
        self.as_bytes()
    }
}

// comparable with `Vec<u8>`, `[u8]`, `&str`, `std::string::String` and other Lua strings
impl<T> PartialEq<T> for String<'_>
where
    T: AsRef<[u8]> + ?Sized,
{
    fn eq(&self, other: &T) -> bool {
        self.as_bytes() == other.as_ref()
    }
}

impl Eq for String<'_> {}

impl Hash for String<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

#[cfg(feature = "serialize")]
impl Serialize for String<'_> {
    fn serialize<S>(&self, serializer: S) -> StdResult<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.to_str() {
            Ok(s) => serializer.serialize_str(s),
            Err(_) => serializer.serialize_bytes(self.as_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn debug_escapes_invalid_utf8() {
        let s = String::from_bytes(b"a\0\"\xff");
        assert_eq!(format!("{s:?}"), r#"b"a\0\"\xff""#);
        assert!(s.to_str().is_err());
        assert_eq!(s.to_string_lossy(), "a\0\"\u{fffd}");
    }

    #[test]
    fn compares_with_byte_like_values() {
        let s = String::from_bytes(b"moon");
        assert!(s == "moon");
        assert!(s == b"moon".to_vec());
        assert!(s == String::from_bytes(b"moon"));
        assert_eq!(s.len(), 4);
    }
}
