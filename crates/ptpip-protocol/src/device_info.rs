//! Device Info Parsing
//!
//! Vendor `GetDeviceInfo` payloads do not reliably follow the standard field
//! layout, so identity strings are recovered by scanning the blob for anything
//! that looks like a PTP string (u8 length prefix followed by UTF-16LE units).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

/// Value used for any field the parser cannot recover
pub const UNKNOWN: &str = "Unknown";

/// Longest candidate string kept by the scanner
const MAX_CANDIDATE_CHARS: usize = 50;

/// Largest length prefix treated as a string
const MAX_LENGTH_PREFIX: u8 = 100;

/// Known camera vendors and their canonical names
const VENDORS: [&str; 7] = [
    "Nikon",
    "Canon",
    "Sony",
    "Fujifilm",
    "Olympus",
    "Panasonic",
    "Leica",
];

static MODEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{1,3} ?[0-9]{1,4}[A-Za-z0-9_]{0,4}$").expect("model pattern is valid")
});

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^V[0-9]+(\.[0-9]+)+$").expect("version pattern is valid"));

/// Camera identity recovered from a device-info blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub manufacturer: String,
    pub model: String,
    pub version: String,
    pub serial_number: String,
}

impl CameraInfo {
    /// Record with every field set to "Unknown"
    pub fn unknown() -> Self {
        Self {
            manufacturer: UNKNOWN.to_string(),
            model: UNKNOWN.to_string(),
            version: UNKNOWN.to_string(),
            serial_number: UNKNOWN.to_string(),
        }
    }

    /// Check if the manufacturer is Nikon
    pub fn is_nikon(&self) -> bool {
        self.manufacturer == "Nikon"
    }

    fn known_fields(&self) -> usize {
        [
            &self.manufacturer,
            &self.model,
            &self.version,
            &self.serial_number,
        ]
        .iter()
        .filter(|field| field.as_str() != UNKNOWN)
        .count()
    }
}

impl Default for CameraInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Result of parsing a device-info blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// All four fields were recovered
    Complete(CameraInfo),
    /// Some fields were recovered, the rest are "Unknown"
    Partial(CameraInfo),
    /// Nothing usable was found
    Fallback { info: CameraInfo, reason: String },
}

impl ParseOutcome {
    pub fn info(&self) -> &CameraInfo {
        match self {
            ParseOutcome::Complete(info) | ParseOutcome::Partial(info) => info,
            ParseOutcome::Fallback { info, .. } => info,
        }
    }

    pub fn into_info(self) -> CameraInfo {
        match self {
            ParseOutcome::Complete(info) | ParseOutcome::Partial(info) => info,
            ParseOutcome::Fallback { info, .. } => info,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ParseOutcome::Fallback { .. })
    }
}

/// Parse a raw `GetDeviceInfo` blob
///
/// Never panics; input with no recognisable strings yields [`ParseOutcome::Fallback`].
pub fn parse_device_info(blob: &[u8]) -> ParseOutcome {
    if blob.is_empty() {
        return ParseOutcome::Fallback {
            info: CameraInfo::unknown(),
            reason: "empty device info".to_string(),
        };
    }

    let candidates = scan_strings(blob);
    debug!("Device info scan found {} candidate strings", candidates.len());

    if candidates.is_empty() {
        return ParseOutcome::Fallback {
            info: CameraInfo::unknown(),
            reason: "no printable strings".to_string(),
        };
    }

    let manufacturer = find_manufacturer(&candidates);
    let info = CameraInfo {
        model: find_model(&candidates, manufacturer),
        version: find_version(&candidates),
        serial_number: find_serial(&candidates),
        manufacturer: manufacturer.unwrap_or(UNKNOWN).to_string(),
    };

    match info.known_fields() {
        4 => ParseOutcome::Complete(info),
        0 => ParseOutcome::Fallback {
            info,
            reason: "no identity fields matched".to_string(),
        },
        _ => ParseOutcome::Partial(info),
    }
}

/// Collect every plausible PTP string in first-seen order, duplicates kept
pub fn scan_strings(blob: &[u8]) -> Vec<String> {
    let mut found = Vec::new();

    for (offset, &prefix) in blob.iter().enumerate() {
        if prefix == 0 || prefix > MAX_LENGTH_PREFIX {
            continue;
        }
        if let Some(text) = decode_candidate(blob, offset + 1, prefix as usize) {
            found.push(text);
        }
    }

    found
}

/// Decode `units` UTF-16LE code units at `start`, stopping at a NUL terminator
fn decode_candidate(blob: &[u8], start: usize, units: usize) -> Option<String> {
    let bytes = blob.get(start..start.checked_add(units * 2)?)?;

    let mut text = String::with_capacity(units);
    for pair in bytes.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        if !(32..=126).contains(&unit) {
            return None;
        }
        text.push(unit as u8 as char);
    }

    if text.is_empty() || text.len() > MAX_CANDIDATE_CHARS {
        return None;
    }
    Some(text)
}

fn find_manufacturer(candidates: &[String]) -> Option<&'static str> {
    candidates.iter().find_map(|candidate| {
        let lower = candidate.to_lowercase();
        VENDORS
            .iter()
            .find(|vendor| lower.contains(&vendor.to_lowercase()))
            .copied()
    })
}

fn find_model(candidates: &[String], manufacturer: Option<&str>) -> String {
    if let Some(model) = candidates.iter().find(|c| MODEL_PATTERN.is_match(c)) {
        return model.clone();
    }

    // "Nikon Z 6" style strings: keep what remains after removing the vendor suffix
    if let Some(vendor) = manufacturer {
        let vendor_lower = vendor.to_lowercase();
        for candidate in candidates {
            if !candidate.to_lowercase().contains(&vendor_lower) {
                continue;
            }
            let stripped = candidate.replace("Corporation", "").trim().to_string();
            if !stripped.is_empty() && !stripped.eq_ignore_ascii_case(vendor) {
                return stripped;
            }
        }
    }

    UNKNOWN.to_string()
}

fn find_version(candidates: &[String]) -> String {
    candidates
        .iter()
        .find(|c| VERSION_PATTERN.is_match(c))
        .cloned()
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn find_serial(candidates: &[String]) -> String {
    candidates
        .iter()
        .find(|c| c.len() >= 10 && c.bytes().all(|b| b.is_ascii_digit()) && !is_zero_padded(c))
        .cloned()
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Serials that are mostly leading zeros are padding artefacts, not real serials
fn is_zero_padded(digits: &str) -> bool {
    let significant = digits.trim_start_matches('0').len();
    significant * 2 < digits.len()
}
