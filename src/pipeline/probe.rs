//! Stage-4 probe derivation: terminal mapping, move type, slot parsing.

use chrono::NaiveDateTime;

use crate::table::{Table, COL_CURRENT_LOC, COL_DESTINATION, COL_ORIGIN, NA};
use crate::upstream::{MoveType, TradeKind};

/// Trucking company presented on every appointment form.
pub const TRUCKING_COMPANY: &str = "K & R TRANSPORTATION LLC";

/// Truck plate presented on every appointment form.
pub const TRUCK_PLATE: &str = "NONE";

/// Whether the trucker brings their own chassis.
pub const OWN_CHASSIS: bool = false;

/// Known terminal codes and their full names on the appointment form.
/// Codes outside this list pass through literally.
const TERMINALS: [(&str, &str); 20] = [
    ("TTI", "Total Terminals International"),
    ("ITS", "International Transportation Service"),
    ("TRP1", "TraPac Los Angeles"),
    ("ETSLAX", "Everport Terminal Services Los Angeles"),
    ("PCT", "Pacific Container Terminal"),
    ("HUSKY", "Husky Terminal"),
    ("T18", "Terminal 18"),
    ("SSA", "SSA Marine Terminal"),
    ("SSAT5", "SSA Terminal 5"),
    ("SSAT30", "SSA Terminal 30"),
    ("WUT", "Washington United Terminals"),
    ("OICT", "Oakland International Container Terminal"),
    ("PACKR", "Packer Avenue Marine Terminal"),
    ("PET", "Pierce County Terminal"),
    ("FIT", "Florida International Terminal"),
    ("TRPOAK", "TraPac Oakland"),
    ("ETSOAK", "Everport Terminal Services Oakland"),
    ("ETSTAC", "Everport Terminal Services Tacoma"),
    ("BNLPC", "BNSF Logistics Park Chicago"),
    ("LPCHI", "Logistics Park Chicago"),
];

/// Map a raw terminal code to its full name; unknown codes pass through.
pub fn map_terminal(code: &str) -> String {
    let trimmed = code.trim();
    TERMINALS
        .iter()
        .find(|(known, _)| trimmed.eq_ignore_ascii_case(known))
        .map(|(_, name)| (*name).to_owned())
        .unwrap_or_else(|| trimmed.to_owned())
}

/// Resolve the terminal for a row: `CurrentLoc` preferred, falling back to
/// `Origin` for imports and `Destination` for exports.
pub fn terminal_for_row(table: &Table, row: usize, kind: TradeKind) -> String {
    let current = table.value(row, COL_CURRENT_LOC).unwrap_or("");
    if has_value(current) {
        return map_terminal(current);
    }
    let fallback_column = match kind {
        TradeKind::Import => COL_ORIGIN,
        TradeKind::Export => COL_DESTINATION,
    };
    map_terminal(table.value(row, fallback_column).unwrap_or(""))
}

fn has_value(cell: &str) -> bool {
    let trimmed = cell.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(NA)
}

/// Derive the move type: imports return empties once pregate passed,
/// otherwise pick up full; exports always drop full.
pub fn move_type_for(kind: TradeKind, pregate_passed: bool) -> MoveType {
    match kind {
        TradeKind::Import if pregate_passed => MoveType::DropEmpty,
        TradeKind::Import => MoveType::PickFull,
        TradeKind::Export => MoveType::DropFull,
    }
}

/// Parse the trade-type cell; anything that is not export counts as import.
pub fn trade_kind_for(cell: &str) -> TradeKind {
    if cell.trim().eq_ignore_ascii_case("EXPORT") {
        TradeKind::Export
    } else {
        TradeKind::Import
    }
}

/// Find the earliest date among available slot strings, as `MM/DD/YYYY`.
///
/// Slots read `"MM/DD/YYYY HH:MM AM - HH:MM PM"`; the list is not sorted.
/// Unparsable entries are skipped; an empty or fully-unparsable list yields
/// `None`.
pub fn earliest_slot_date(available_times: &[String]) -> Option<String> {
    available_times
        .iter()
        .filter_map(|slot| parse_slot_start(slot))
        .min()
        .map(|start| start.format("%m/%d/%Y").to_string())
}

/// Parse the start timestamp of one slot string.
fn parse_slot_start(slot: &str) -> Option<NaiveDateTime> {
    let start = slot.split(" - ").next()?.trim();
    NaiveDateTime::parse_from_str(start, "%m/%d/%Y %I:%M %p").ok()
}
