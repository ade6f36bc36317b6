//! Wire types for the upstream browser-automation API.
//!
//! Unknown JSON keys are ignored everywhere; missing required fields surface
//! as deserialization failures and classify as permanent errors.

use serde::{Deserialize, Serialize};

/// A session acquired from (or reused by) the upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquiredSession {
    /// Opaque session token.
    pub session_id: String,
    /// Whether the upstream handed back an already-live session.
    #[serde(default)]
    pub reused: bool,
}

/// Response of the container / appointment listing operations.
///
/// The upstream drives the target site, exports a spreadsheet, and returns
/// a URL that must be downloaded with the same session context.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingResponse {
    /// Authenticated download URL for the exported spreadsheet.
    pub file_url: String,
}

/// One milestone row of an import container's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Milestone name as the target site displays it (e.g. "Manifested").
    pub milestone: String,
    /// Milestone date, ISO-ish, possibly with a time-of-day suffix.
    #[serde(default)]
    pub date: Option<String>,
}

/// Bulk-info record for an import container.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkImportInfo {
    /// Container id.
    pub item_id: String,
    /// Whether the container already passed pregate.
    #[serde(default)]
    pub pregate_passed: bool,
    /// Milestone timeline, unordered.
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
}

/// Bulk-info record for an export container.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkExportInfo {
    /// Container id.
    pub item_id: String,
    /// Booking number used as the identifier for appointment probes.
    #[serde(default)]
    pub booking_number: Option<String>,
}

/// Response of the one-shot bulk enrichment call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkInfoResponse {
    /// Records for the requested import ids.
    #[serde(default)]
    pub imports: Vec<BulkImportInfo>,
    /// Records for the requested export ids.
    #[serde(default)]
    pub exports: Vec<BulkExportInfo>,
}

/// Direction of trade for a container row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeKind {
    /// Inbound container (picked up full or dropped empty).
    Import,
    /// Outbound container (dropped full against a booking).
    Export,
}

impl TradeKind {
    /// Wire/spreadsheet representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "IMPORT",
            Self::Export => "EXPORT",
        }
    }
}

/// Appointment move type requested from the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveType {
    /// Pick up a full import container.
    PickFull,
    /// Return an empty import container.
    DropEmpty,
    /// Drop a full export container.
    DropFull,
}

impl MoveType {
    /// Wire representation as the upstream expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PickFull => "PICK FULL",
            Self::DropEmpty => "DROP EMPTY",
            Self::DropFull => "DROP FULL",
        }
    }
}

impl std::fmt::Display for MoveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a per-container appointment probe.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// Import or export flow.
    pub kind: TradeKind,
    /// Full terminal name after code mapping.
    pub terminal: String,
    /// Move type derived from trade kind and pregate state.
    pub move_type: MoveType,
    /// Trucking company name.
    pub trucking_company: String,
    /// Container id for imports, booking number for exports.
    pub identifier: String,
    /// Container id carried for annotation on export probes.
    pub item_id: String,
    /// Truck plate to present to the terminal form.
    pub plate: String,
    /// Whether the trucker brings their own chassis.
    pub own_chassis: bool,
}

/// Result of an appointment probe.
///
/// Serialized verbatim into the job's probe-response artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    /// Available appointment slots, human-formatted, unsorted. Import only.
    #[serde(default)]
    pub available_times: Vec<String>,
    /// Whether a booking calendar was found. Export only.
    #[serde(default)]
    pub calendar_found: Option<bool>,
    /// Screenshot of the final form state, downloadable via [`super::UpstreamApi::download`].
    #[serde(default)]
    pub screenshot_url: Option<String>,
}

/// Raw bytes downloaded from an upstream URL.
#[derive(Debug, Clone)]
pub struct Download {
    /// Body bytes.
    pub bytes: Vec<u8>,
    /// Content type reported by the upstream, when present.
    pub content_type: Option<String>,
}
