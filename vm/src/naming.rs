//! Name helpers for generated and deduplicated identifiers.

use alloc::format;
use alloc::string::String;

/// Split a trailing decimal number off `name`.
///
/// `"Test 234 name123"` yields `("Test 234 name", Some(123))`; a name
/// without trailing digits (or with one that overflows `u32`) is returned
/// whole with `None`.
pub fn parse_name(name: &str) -> (&str, Option<u32>) {
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if base.len() == name.len() {
        return (name, None);
    }
    match name[base.len()..].parse::<u32>() {
        Ok(number) => (base, Some(number)),
        Err(_) => (name, None),
    }
}

/// `name` if `is_taken` rejects it, otherwise the name with the first free
/// number suffix: `"Script"` becomes `"Script2"`, `"Script2"` becomes
/// `"Script3"`. `None` once the suffixes up to `u32::MAX` are all taken.
pub fn unique_name(name: &str, is_taken: impl Fn(&str) -> bool) -> Option<String> {
    if !is_taken(name) {
        return Some(String::from(name));
    }
    let (base, number) = parse_name(name);
    let mut number = match number {
        Some(number) => number.checked_add(1)?,
        None => 2,
    };
    loop {
        let candidate = format!("{}{}", base, number);
        if !is_taken(&candidate) {
            return Some(candidate);
        }
        number = number.checked_add(1)?;
    }
}
