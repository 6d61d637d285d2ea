//! Human-readable sizes and partition offsets
//!
//! Sizes use decimal multipliers: `1GB` is 10^9 bytes, `64MB` is 64 * 10^6.
//! The accepted form is `<number>[ ][kKmMgGtTpP][iI][bB]`, each suffix part
//! optional.

use crate::error::{ActionError, Result};

/// A partition boundary as written in a recipe
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Offset {
    /// Percentage of the whole disk, 0 to 100
    Percent(f64),
    /// Absolute position in bytes
    Bytes(u64),
    /// Absolute position in sectors (`2048s`)
    Sectors(u64),
}

impl Offset {
    /// Whether `self` lies strictly before `other`
    ///
    /// Offsets in different units are not compared and count as ordered;
    /// parted resolves them against the real disk geometry.
    pub fn is_before(&self, other: &Offset) -> bool {
        match (self, other) {
            (Offset::Percent(a), Offset::Percent(b)) => a < b,
            (Offset::Bytes(a), Offset::Bytes(b)) => a < b,
            (Offset::Sectors(a), Offset::Sectors(b)) => a < b,
            _ => true,
        }
    }
}

/// Parse a decimal human-readable size into bytes
pub fn parse_human_size(input: &str) -> Result<u64> {
    let invalid = || ActionError::InvalidSize(input.to_string());

    let number_end = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, suffix) = input.split_at(number_end);

    if !number.starts_with(|c: char| c.is_ascii_digit()) || number.ends_with('.') {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let suffix = suffix.strip_prefix(' ').unwrap_or(suffix);
    let mut chars = suffix.chars().peekable();

    let multiplier = match chars.peek().map(|c| c.to_ascii_lowercase()) {
        Some('k') => 1e3,
        Some('m') => 1e6,
        Some('g') => 1e9,
        Some('t') => 1e12,
        Some('p') => 1e15,
        _ => 1.0,
    };
    if multiplier > 1.0 {
        chars.next();
    }
    if matches!(chars.peek(), Some('i' | 'I')) {
        chars.next();
    }
    if matches!(chars.peek(), Some('b' | 'B')) {
        chars.next();
    }
    if chars.next().is_some() {
        return Err(invalid());
    }

    // Image files are sized through a signed 64-bit offset
    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes > i64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

/// Parse a partition start/end boundary
pub fn parse_offset(input: &str) -> Result<Offset> {
    if let Some(percent) = input.strip_suffix('%') {
        let value: f64 = percent
            .parse()
            .map_err(|_| ActionError::InvalidSize(input.to_string()))?;
        if !(0.0..=100.0).contains(&value) {
            return Err(ActionError::InvalidSize(input.to_string()));
        }
        return Ok(Offset::Percent(value));
    }

    if let Some(sectors) = input.strip_suffix('s') {
        if !sectors.is_empty() && sectors.bytes().all(|b| b.is_ascii_digit()) {
            return sectors
                .parse()
                .map(Offset::Sectors)
                .map_err(|_| ActionError::InvalidSize(input.to_string()));
        }
    }

    parse_human_size(input).map(Offset::Bytes)
}
