use std::cell::{Cell, Ref, RefMut};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Counts one outstanding borrow of the app data container for as long as it lives.
///
/// While any guard is alive, entries can not be inserted or removed.
struct ContainerBorrow<'a>(&'a Cell<usize>);

impl<'a> ContainerBorrow<'a> {
    fn new(count: &'a Cell<usize>) -> Self {
        count.set(count.get() + 1);
        ContainerBorrow(count)
    }
}

impl Drop for ContainerBorrow<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// Shared access to a value stored with [`Lua::set_app_data`](crate::Lua::set_app_data).
pub struct AppDataRef<'a, T: ?Sized + 'a> {
    data: Ref<'a, T>,
    _borrow: ContainerBorrow<'a>,
}

impl<'a, T: ?Sized> AppDataRef<'a, T> {
    pub(crate) fn new(data: Ref<'a, T>, count: &'a Cell<usize>) -> Self {
        AppDataRef {
            data,
            _borrow: ContainerBorrow::new(count),
        }
    }
}

impl<T: ?Sized> Deref for AppDataRef<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for AppDataRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for AppDataRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

/// Exclusive access to a value stored with [`Lua::set_app_data`](crate::Lua::set_app_data).
pub struct AppDataRefMut<'a, T: ?Sized + 'a> {
    data: RefMut<'a, T>,
    _borrow: ContainerBorrow<'a>,
}

impl<'a, T: ?Sized> AppDataRefMut<'a, T> {
    pub(crate) fn new(data: RefMut<'a, T>, count: &'a Cell<usize>) -> Self {
        AppDataRefMut {
            data,
            _borrow: ContainerBorrow::new(count),
        }
    }
}

impl<T: ?Sized> Deref for AppDataRefMut<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: ?Sized> DerefMut for AppDataRefMut<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for AppDataRefMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}
