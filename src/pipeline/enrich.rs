//! Stage-3 milestone extraction.
//!
//! The bulk-info call returns a loosely-formatted milestone timeline per
//! import container. Extraction is a pure function from (timeline, milestone
//! name) to a normalized `MM/DD/YYYY` date, or `N/A` when the milestone is
//! absent or its date unreadable.

use chrono::NaiveDate;

use crate::table::{COL_DEPARTED_TERMINAL, COL_EMPTY_RECEIVED, COL_MANIFESTED, NA};
use crate::upstream::TimelineEntry;

/// Milestone names paired with the sheet column they populate.
pub const MILESTONE_COLUMNS: [(&str, &str); 3] = [
    ("Manifested", COL_MANIFESTED),
    ("Departed Terminal", COL_DEPARTED_TERMINAL),
    ("Empty Received", COL_EMPTY_RECEIVED),
];

/// Extract a milestone's date from a timeline, normalized to `MM/DD/YYYY`.
///
/// Milestone names match case-insensitively. A missing milestone, a missing
/// date, or an unparsable date all yield the literal `N/A`.
pub fn milestone_date(timeline: &[TimelineEntry], milestone: &str) -> String {
    timeline
        .iter()
        .find(|entry| entry.milestone.trim().eq_ignore_ascii_case(milestone))
        .and_then(|entry| entry.date.as_deref())
        .and_then(normalize_date)
        .unwrap_or_else(|| NA.to_owned())
}

/// Normalize a raw date string to `MM/DD/YYYY`, stripping any time-of-day.
pub fn normalize_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Dates arrive with or without a time suffix; the date prefix is enough.
    let date_part = trimmed
        .split(['T', ' '])
        .next()
        .unwrap_or(trimmed);

    const FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
        .map(|date| date.format("%m/%d/%Y").to_string())
}
