use bitflags::bitflags;

bitflags! {
    /// Flags describing the set of Lua standard libraries to open.
    ///
    /// The base library (`_G`, `print`, `pcall`, ...) is opened whenever any flag is set.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct StdLib: u32 {
        /// [`coroutine`](https://www.lua.org/manual/5.4/manual.html#6.2) library
        const COROUTINE = 1;
        /// [`table`](https://www.lua.org/manual/5.4/manual.html#6.6) library
        const TABLE = 1 << 1;
        /// [`io`](https://www.lua.org/manual/5.4/manual.html#6.8) library
        const IO = 1 << 2;
        /// [`os`](https://www.lua.org/manual/5.4/manual.html#6.9) library
        const OS = 1 << 3;
        /// [`string`](https://www.lua.org/manual/5.4/manual.html#6.4) library
        const STRING = 1 << 4;
        /// [`utf8`](https://www.lua.org/manual/5.4/manual.html#6.5) library
        const UTF8 = 1 << 5;
        /// [`math`](https://www.lua.org/manual/5.4/manual.html#6.7) library
        const MATH = 1 << 7;
        /// [`package`](https://www.lua.org/manual/5.4/manual.html#6.3) library
        const PACKAGE = 1 << 8;
        /// [`debug`](https://www.lua.org/manual/5.4/manual.html#6.10) library
        ///
        /// Can break the custom type invariants, so it is left out of [`StdLib::ALL_SAFE`].
        const DEBUG = 1 << 31;

        /// All safe standard libraries
        const ALL_SAFE = Self::COROUTINE.bits()
            | Self::TABLE.bits()
            | Self::IO.bits()
            | Self::OS.bits()
            | Self::STRING.bits()
            | Self::UTF8.bits()
            | Self::MATH.bits()
            | Self::PACKAGE.bits();
        /// Every standard library
        const ALL = Self::ALL_SAFE.bits() | Self::DEBUG.bits();
    }
}

impl StdLib {
    /// No libraries
    pub const NONE: StdLib = StdLib::empty();
}

impl Default for StdLib {
    fn default() -> Self {
        StdLib::ALL_SAFE
    }
}
