use std::error::Error as StdError;
use std::fmt;
use std::string::String as StdString;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A chunk failed to compile.
    SyntaxError {
        message: StdString,
        /// Set when the source ended before the statement it was parsing did.
        incomplete_input: bool,
    },
    /// Raised by guest code, or by a host callback and forwarded through the guest.
    RuntimeError(StdString),
    MemoryError(StdString),
    /// The engine could not grow its operand stack.
    StackError,
    ToLuaConversionError {
        from: &'static str,
        to: &'static str,
        message: Option<StdString>,
    },
    FromLuaConversionError {
        from: &'static str,
        to: &'static str,
        message: Option<StdString>,
    },
    /// A callback argument failed to convert.
    BadArgument {
        to: Option<StdString>,
        pos: usize,
        name: Option<StdString>,
        cause: Arc<Error>,
    },
    /// A scoped callback was called after its scope ended.
    CallbackDestructed,
    /// A `create_function_mut` callback was re-entered while already running.
    RecursiveMutCallback,
    MismatchedRegistryKey,
    /// A handle created by one [`Lua`](crate::Lua) was passed to another.
    MismatchedLua,
    /// [`create_userdata`](crate::Lua::create_userdata) was called before the type was registered.
    UnregisteredType(&'static str),
    /// The host type needs a stricter alignment than guest memory provides.
    UnsupportedAlignment {
        type_name: &'static str,
        align: usize,
    },
    /// The value is not userdata of the requested type, or was already finalized.
    UserDataTypeMismatch,
    UserDataBorrowError,
    UserDataBorrowMutError,
    ExternalError(Arc<dyn StdError + Send + Sync>),
    WithContext {
        context: StdString,
        cause: Arc<Error>,
    },
}

impl Error {
    pub fn runtime<T: fmt::Display>(message: T) -> Self {
        Error::RuntimeError(message.to_string())
    }

    pub fn external<T: Into<Box<dyn StdError + Send + Sync>>>(err: T) -> Self {
        Error::ExternalError(err.into().into())
    }

    pub(crate) fn from_lua_conversion(
        from: &'static str,
        to: &'static str,
        message: impl Into<Option<StdString>>,
    ) -> Self {
        Error::FromLuaConversionError {
            from,
            to,
            message: message.into(),
        }
    }

    pub(crate) fn to_lua_conversion(
        from: &'static str,
        to: &'static str,
        message: impl Into<Option<StdString>>,
    ) -> Self {
        Error::ToLuaConversionError {
            from,
            to,
            message: message.into(),
        }
    }

    pub(crate) fn bad_argument(
        to: Option<&str>,
        pos: usize,
        name: Option<&str>,
        cause: Error,
    ) -> Self {
        // nested callbacks keep the innermost position
        if let Error::BadArgument { .. } = cause {
            return cause;
        }

        Error::BadArgument {
            to: to.map(StdString::from),
            pos,
            name: name.map(StdString::from),
            cause: Arc::new(cause),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SyntaxError { message, .. } => write!(f, "syntax error: {message}"),
            Error::RuntimeError(message) => write!(f, "{message}"),
            Error::MemoryError(message) => write!(f, "memory error: {message}"),
            Error::StackError => write!(f, "stack overflow (out of Lua stack space)"),
            Error::ToLuaConversionError { from, to, message } => {
                write!(f, "error converting {from} to Lua {to}")?;

                match message {
                    Some(message) => write!(f, " ({message})"),
                    None => Ok(()),
                }
            }
            Error::FromLuaConversionError { from, to, message } => {
                write!(f, "{to} expected, got {from}")?;

                match message {
                    Some(message) => write!(f, ": {message}"),
                    None => Ok(()),
                }
            }
            Error::BadArgument {
                to,
                pos,
                name,
                cause,
            } => {
                write!(f, "bad argument #{pos}")?;

                if let Some(name) = name {
                    write!(f, " `{name}`")?;
                }

                if let Some(to) = to {
                    write!(f, " to '{to}'")?;
                }

                write!(f, " ({cause})")
            }
            Error::CallbackDestructed => {
                write!(f, "a destructed callback or destructed userdata method was called")
            }
            Error::RecursiveMutCallback => write!(f, "mutable callback called recursively"),
            Error::MismatchedRegistryKey => {
                write!(f, "RegistryKey used from different Lua state")
            }
            Error::MismatchedLua => {
                write!(f, "value created by a different Lua state")
            }
            Error::UnregisteredType(name) => {
                write!(f, "custom type '{name}' has not been registered")
            }
            Error::UnsupportedAlignment { type_name, align } => write!(
                f,
                "custom type '{type_name}' needs {align}-byte alignment, more than userdata provides"
            ),
            Error::UserDataTypeMismatch => write!(f, "userdata is not expected type"),
            Error::UserDataBorrowError => write!(f, "userdata already mutably borrowed"),
            Error::UserDataBorrowMutError => write!(f, "userdata already borrowed"),
            Error::ExternalError(err) => write!(f, "{err}"),
            Error::WithContext { context, cause } => write!(f, "{context}\n{cause}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::BadArgument { cause, .. } => Some(cause.as_ref()),
            Error::WithContext { cause, .. } => Some(cause.as_ref()),
            Error::ExternalError(err) => err.source(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::external(err)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::external(err)
    }
}

pub trait ExternalError {
    fn into_lua_err(self) -> Error;
}

impl<E: Into<Box<dyn StdError + Send + Sync>>> ExternalError for E {
    fn into_lua_err(self) -> Error {
        Error::external(self)
    }
}

pub trait ExternalResult<T> {
    fn into_lua_err(self) -> Result<T>;
}

impl<T, E> ExternalResult<T> for std::result::Result<T, E>
where
    E: ExternalError,
{
    fn into_lua_err(self) -> Result<T> {
        self.map_err(|e| e.into_lua_err())
    }
}

/// Attaches a human readable context to an error.
pub trait ErrorContext: Sized {
    fn context<C: fmt::Display>(self, context: C) -> Self;

    fn with_context<C: fmt::Display>(self, f: impl FnOnce(&Error) -> C) -> Self;
}

impl ErrorContext for Error {
    fn context<C: fmt::Display>(self, context: C) -> Self {
        Error::WithContext {
            context: context.to_string(),
            cause: Arc::new(self),
        }
    }

    fn with_context<C: fmt::Display>(self, f: impl FnOnce(&Error) -> C) -> Self {
        let context = f(&self).to_string();
        self.context(context)
    }
}

impl<T> ErrorContext for Result<T> {
    fn context<C: fmt::Display>(self, context: C) -> Self {
        self.map_err(|err| err.context(context))
    }

    fn with_context<C: fmt::Display>(self, f: impl FnOnce(&Error) -> C) -> Self {
        self.map_err(|err| err.with_context(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bad_argument_display() {
        let err = Error::bad_argument(
            Some("split"),
            1,
            None,
            Error::from_lua_conversion("table", "string", None),
        );

        assert_eq!(
            err.to_string(),
            "bad argument #1 to 'split' (string expected, got table)"
        );
    }

    #[test]
    fn nested_bad_argument_keeps_inner_position() {
        let inner = Error::bad_argument(
            Some("inner"),
            2,
            None,
            Error::from_lua_conversion("nil", "integer", None),
        );
        let outer = Error::bad_argument(Some("outer"), 1, None, inner);

        assert_eq!(
            outer.to_string(),
            "bad argument #2 to 'inner' (integer expected, got nil)"
        );
    }

    #[test]
    fn context_chain() {
        let err: Result<()> = Err(Error::runtime("boom"));
        let err = err.context("while loading config").unwrap_err();

        assert_eq!(err.to_string(), "while loading config\nboom");
    }
}
