//! Spreadsheet A1 addressing.
//!
//! Column letters use the bijective base-26 encoding spreadsheets use: digits
//! `A..=Z` stand for 1..=26 and there is no zero digit, so index 0 is `A`,
//! 25 is `Z`, 26 is `AA` and 702 is `AAA`.

use std::borrow::Cow;
use std::fmt;

/// Number of letter codes strictly shorter than `len` characters.
fn codes_shorter_than(len: u32) -> u128 {
    (26u128.pow(len) - 26) / 25
}

/// Converts a zero-based column index into its letter code.
pub fn column_letters(index: u64) -> String {
    let index = u128::from(index);
    let mut len = 1;
    while index >= codes_shorter_than(len + 1) {
        len += 1;
    }

    let mut rem = index - codes_shorter_than(len);
    let mut digits = vec![b'A'; len as usize];
    for digit in digits.iter_mut().rev() {
        *digit = b'A' + (rem % 26) as u8;
        rem /= 26;
    }
    digits.into_iter().map(char::from).collect()
}

/// Inverse of [`column_letters`]. Letters are case-insensitive; anything else
/// (or an index past `u64::MAX`) yields `None`.
pub fn column_index(letters: &str) -> Option<u64> {
    if letters.is_empty() {
        return None;
    }
    let mut acc: u128 = 0;
    for ch in letters.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        let digit = u128::from(ch.to_ascii_uppercase() as u8 - b'A' + 1);
        acc = acc.checked_mul(26)?.checked_add(digit)?;
    }
    u64::try_from(acc - 1).ok()
}

/// Column part of an A1 reference, given either as an index or as letters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Index(u64),
    Letters(String),
}

impl ColumnRef {
    pub fn letters(&self) -> Cow<'_, str> {
        match self {
            ColumnRef::Index(index) => Cow::Owned(column_letters(*index)),
            ColumnRef::Letters(letters) => Cow::Borrowed(letters),
        }
    }
}

impl From<u64> for ColumnRef {
    fn from(index: u64) -> Self {
        ColumnRef::Index(index)
    }
}

impl From<usize> for ColumnRef {
    fn from(index: usize) -> Self {
        ColumnRef::Index(index as u64)
    }
}

impl From<&str> for ColumnRef {
    fn from(letters: &str) -> Self {
        ColumnRef::Letters(letters.to_string())
    }
}

impl From<String> for ColumnRef {
    fn from(letters: String) -> Self {
        ColumnRef::Letters(letters)
    }
}

/// Composes a cell reference; a missing column or row renders as nothing, so
/// `(Some(A), None)` gives `A` and `(None, Some(5))` gives `5`.
pub fn to_a1(column: Option<ColumnRef>, row: Option<u64>) -> String {
    let column = column.map(|c| c.letters().into_owned()).unwrap_or_default();
    let row = row.map(|r| r.to_string()).unwrap_or_default();
    format!("{column}{row}")
}

/// `sheet!start:end` range reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRange {
    pub sheet: String,
    pub start: String,
    pub end: String,
}

impl SheetRange {
    /// Whole row, e.g. `database!1:1`.
    pub fn row(sheet: &str, row: u64) -> Self {
        Self {
            sheet: sheet.to_string(),
            start: to_a1(None, Some(row)),
            end: to_a1(None, Some(row)),
        }
    }

    /// Open-ended column slice from `first_row` down, e.g. `database!C2:C`.
    pub fn column_from(sheet: &str, column: ColumnRef, first_row: u64) -> Self {
        Self {
            sheet: sheet.to_string(),
            start: to_a1(Some(column.clone()), Some(first_row)),
            end: to_a1(Some(column), None),
        }
    }
}

impl fmt::Display for SheetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bare = !self.sheet.is_empty()
            && self
                .sheet
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if bare {
            write!(f, "{}!{}:{}", self.sheet, self.start, self.end)
        } else {
            write!(
                f,
                "'{}'!{}:{}",
                self.sheet.replace('\'', "''"),
                self.start,
                self.end
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_at_length_boundaries() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(51), "AZ");
        assert_eq!(column_letters(52), "BA");
        assert_eq!(column_letters(701), "ZZ");
        assert_eq!(column_letters(702), "AAA");
        assert_eq!(column_letters(18_277), "ZZZ");
        assert_eq!(column_letters(18_278), "AAAA");
    }

    #[test]
    fn letters_decode_back() {
        assert_eq!(column_index("A"), Some(0));
        assert_eq!(column_index("z"), Some(25));
        assert_eq!(column_index("AA"), Some(26));
        assert_eq!(column_index("AAA"), Some(702));
        assert_eq!(column_index(""), None);
        assert_eq!(column_index("A1"), None);
        assert_eq!(column_index(&column_letters(u64::MAX)), Some(u64::MAX));
        assert_eq!(column_index("ZZZZZZZZZZZZZZZ"), None);
    }

    #[test]
    fn a1_composition() {
        assert_eq!(to_a1(Some(0u64.into()), Some(5)), "A5");
        assert_eq!(to_a1(Some("AB".into()), None), "AB");
        assert_eq!(to_a1(None, Some(1)), "1");
        assert_eq!(to_a1(None, None), "");
        assert_eq!(to_a1(Some(27u64.into()), Some(2)), "AB2");
    }

    #[test]
    fn sheet_ranges_render() {
        assert_eq!(SheetRange::row("database", 1).to_string(), "database!1:1");
        assert_eq!(
            SheetRange::column_from("database", 2u64.into(), 2).to_string(),
            "database!C2:C"
        );
        assert_eq!(
            SheetRange::column_from("Mask data", "AA".into(), 2).to_string(),
            "'Mask data'!AA2:AA"
        );
        assert_eq!(
            SheetRange::row("it's", 1).to_string(),
            "'it''s'!1:1"
        );
    }
}
