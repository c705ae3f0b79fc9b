// src/common/address.rs

use core::convert::TryFrom;
use core::fmt;

use super::error::Sdi12Error;

/// An SDI-12 sensor address.
///
/// Valid addresses are `0`-`9` (standard), `a`-`z` and `A`-`Z` (extended).
/// The wildcard `?` is accepted as well: it is the target of the address
/// query command and never a real device address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Sdi12Addr(char);

impl Sdi12Addr {
    /// The `?` address-query wildcard.
    pub const QUERY: Sdi12Addr = Sdi12Addr('?');

    /// Validates `c` and wraps it as an address.
    pub fn new(c: char) -> Result<Self, Sdi12Error> {
        if Self::is_valid(c) {
            Ok(Sdi12Addr(c))
        } else {
            Err(Sdi12Error::InvalidAddress(c))
        }
    }

    /// Like [`new`](Self::new), but rejects the `?` wildcard. Used where a
    /// concrete device address is required (e.g. the change-address target).
    pub fn new_device(c: char) -> Result<Self, Sdi12Error> {
        match Self::new(c)? {
            a if a.is_query() => Err(Sdi12Error::InvalidAddress(c)),
            a => Ok(a),
        }
    }

    #[inline]
    pub const fn as_char(&self) -> char {
        self.0
    }

    #[inline]
    pub const fn is_query(&self) -> bool {
        self.0 == '?'
    }

    #[inline]
    pub const fn is_valid(c: char) -> bool {
        matches!(c, '0'..='9' | 'a'..='z' | 'A'..='Z' | '?')
    }
}

impl TryFrom<char> for Sdi12Addr {
    type Error = Sdi12Error;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Sdi12Addr> for char {
    fn from(value: Sdi12Addr) -> Self {
        value.0
    }
}

impl fmt::Display for Sdi12Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
