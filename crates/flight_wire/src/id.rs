//! # Reference Ids
//!
//! Ids are minted in first-use order by the encoder and written as lowercase
//! hexadecimal. Id 0 is always the root.

use std::fmt;

/// Identifier of one value within a Request/Response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RefId(pub u32);

impl RefId {
    /// The root value of every request.
    pub const ROOT: Self = Self(0);

    /// Returns the raw integer.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the id that follows this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Parses a lowercase or uppercase hexadecimal id.
    #[must_use]
    pub fn from_hex(text: &str) -> Option<Self> {
        if text.is_empty() || text.len() > 8 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u32::from_str_radix(text, 16).ok().map(Self)
    }

    /// Appends one hexadecimal digit to a partially parsed id.
    ///
    /// Returns `None` when `digit` is not hexadecimal or the id overflows.
    #[inline]
    #[must_use]
    pub fn push_hex_digit(partial: u32, digit: u8) -> Option<u32> {
        let value = hex_value(digit)?;
        partial.checked_mul(16)?.checked_add(u32::from(value))
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Value of one ASCII hexadecimal digit.
#[inline]
pub(crate) const fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_lowercase_hex() {
        assert_eq!(RefId(0).to_string(), "0");
        assert_eq!(RefId(255).to_string(), "ff");
        assert_eq!(RefId(4096).to_string(), "1000");
    }

    #[test]
    fn test_from_hex() {
        assert_eq!(RefId::from_hex("1f"), Some(RefId(31)));
        assert_eq!(RefId::from_hex("1F"), Some(RefId(31)));
        assert_eq!(RefId::from_hex(""), None);
        assert_eq!(RefId::from_hex("xyz"), None);
        assert_eq!(RefId::from_hex("123456789"), None);
    }

    #[test]
    fn test_push_hex_digit_overflow() {
        assert_eq!(RefId::push_hex_digit(0x0fff_ffff, b'f'), Some(0xffff_ffff));
        assert_eq!(RefId::push_hex_digit(0xffff_ffff, b'0'), None);
        assert_eq!(RefId::push_hex_digit(1, b':'), None);
    }
}
