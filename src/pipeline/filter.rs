//! Stage-2 row filtering.
//!
//! A container is worth probing when it has no holds and its pregate ticket
//! still reads N/A on the target site. The sheet keeps "N/A" as a literal
//! string; it must never be coerced into an empty cell.

use crate::table::{Table, APPENDED_COLUMNS, COL_HOLDS, COL_PREGATE_TICKET, NA};

/// Filter predicate for one row.
pub fn should_keep(holds: &str, pregate_ticket: &str) -> bool {
    holds.trim().eq_ignore_ascii_case("NO")
        && pregate_ticket.to_ascii_lowercase().contains("n/a")
}

/// Apply the stage-2 transform: drop non-candidate rows, then append the
/// five output columns initialized to `N/A`.
pub fn apply(table: &mut Table) {
    table.retain_rows(|t, row| {
        should_keep(
            t.value(row, COL_HOLDS).unwrap_or(""),
            t.value(row, COL_PREGATE_TICKET).unwrap_or(""),
        )
    });
    for column in APPENDED_COLUMNS {
        table.append_column(column, NA);
    }
}
