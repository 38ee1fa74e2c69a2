//! Field normalizers shared by both transformers.
//!
//! Handles:
//! - Phone cleanup (digits only, leading 8 → 7 for 11-digit numbers)
//! - Digits-only document numbers
//! - Birthdate parsing (`DD.MM.YYYY`, `YYYYMMDD`, ISO)

use chrono::NaiveDate;

/// Keep only ASCII digits; `None` when nothing is left.
pub fn digits_only(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Strip formatting from a phone number and rewrite the Russian trunk prefix.
pub fn normalize_phone(value: &str) -> Option<String> {
    let digits = digits_only(value)?;
    if digits.len() == 11 && digits.starts_with('8') {
        Some(format!("7{}", &digits[1..]))
    } else {
        Some(digits)
    }
}

/// Parse the compact `YYYYMMDD` form, range-checking month and day.
pub fn parse_compact_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.len() != 8 || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = value[0..4].parse().ok()?;
    let month: u32 = value[4..6].parse().ok()?;
    let day: u32 = value[6..8].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse `DD.MM.YYYY`, falling back to ISO `YYYY-MM-DD` (with an optional time part).
pub fn parse_dotted_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%d.%m.%Y") {
        return Some(date);
    }
    let date_part = value.split([' ', 'T']).next().unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Trim and drop empty strings.
pub fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
