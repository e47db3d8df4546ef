use crate::defs::{
    ACTISENSE_BEM, ACTISENSE_RNG, AIS_TIMEOUT_SEC, MAX_PGN, MIN_PGN, PGN_PRODUCT_INFO,
    PGN_SONICHUB, SENSOR_TIMEOUT_SEC, SONICHUB_TIMEOUT_SEC,
};

/// Characters that may occur between a key name and its value.
const SKIP_CHARACTERS: &[char] = &['"', ':', ' '];

/// Field names whose value, together with `src`, distinguishes multiple
/// concurrent instances of the same PGN (for example multiple AIS targets
/// or several tanks of one sender).
///
/// The patterns are matched in declaration order and the first hit wins.
/// `Instance` deliberately has no opening quote so that field names such as
/// `"Tank Instance"` match too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecondaryKey {
    /// Any field ending in `Instance`.
    Instance,
    /// The `Reference` field.
    Reference,
    /// The `Message ID` field.
    MessageId,
    /// The `User ID` field (AIS MMSI).
    UserId,
    /// The `Proprietary ID` field.
    ProprietaryId,
}

/// Search patterns in precedence order.
const SECONDARY_KEY_PATTERNS: [(&str, SecondaryKey); 5] = [
    ("Instance\"", SecondaryKey::Instance),
    ("\"Reference\"", SecondaryKey::Reference),
    ("\"Message ID\"", SecondaryKey::MessageId),
    ("\"User ID\"", SecondaryKey::UserId),
    ("\"Proprietary ID\"", SecondaryKey::ProprietaryId),
];

impl SecondaryKey {
    /// Seconds a message keyed by this field stays live.
    fn window_secs(self) -> u64 {
        match self {
            SecondaryKey::Instance | SecondaryKey::Reference | SecondaryKey::ProprietaryId => {
                SENSOR_TIMEOUT_SEC
            }
            SecondaryKey::MessageId | SecondaryKey::UserId => AIS_TIMEOUT_SEC,
        }
    }
}

/// Whether a PGN falls in the standard range or the Actisense BEM range.
pub fn prn_in_range(prn: u32) -> bool {
    (MIN_PGN..=MAX_PGN).contains(&prn)
        || (ACTISENSE_BEM..ACTISENSE_BEM + ACTISENSE_RNG).contains(&prn)
}

/// Seconds added to the arrival time to compute a message's expiry.
pub fn validity_window(prn: u32, key: Option<SecondaryKey>) -> u64 {
    if prn == PGN_PRODUCT_INFO {
        AIS_TIMEOUT_SEC
    } else if prn == PGN_SONICHUB {
        SONICHUB_TIMEOUT_SEC
    } else {
        key.map(SecondaryKey::window_secs).unwrap_or(SENSOR_TIMEOUT_SEC)
    }
}

/// Identifying fields extracted from one accepted record.
#[derive(Debug)]
pub struct RecordKeys {
    /// The Parameter Group Number, validated against [`prn_in_range`].
    pub prn: u32,
    /// Sender address, 1–255.
    pub src: u8,
    /// Value of the first matching secondary-key field, if any.
    pub key2: Option<String>,
    /// Seconds the stored message stays live.
    pub valid_for: u64,
    /// Human-readable PGN label; empty when the record carries none.
    pub description: String,
}

/// Validates one newline-stripped candidate line and extracts its keys.
///
/// Returns `None` for anything that is not a well-formed analyzer record;
/// rejected candidates are debug-logged and otherwise ignored.
pub fn parse_line(line: &str) -> Option<RecordKeys> {
    if !line.contains("\"fields\":") {
        log::debug!("Ignore record without fields: '{}'", line);
        return None;
    }
    if !line.starts_with("{\"timestamp") {
        log::debug!("Ignore '{}'", line);
        return None;
    }
    if !line.ends_with("}}") {
        log::debug!("Ignore '{}' (end)", line);
        return None;
    }

    let (src, prn) = extract_addresses(line)?;
    if src == 0 || prn == 0 {
        log::debug!("Ignore record without src/pgn: '{}'", line);
        return None;
    }
    let src = match u8::try_from(src) {
        Ok(s) => s,
        Err(_) => {
            log::debug!("Ignore record with src {} out of range", src);
            return None;
        }
    };
    if !prn_in_range(prn) {
        log::debug!("Ignore record with PGN {} out of range", prn);
        return None;
    }

    let key = extract_secondary_key(line);
    let valid_for = validity_window(prn, key.as_ref().map(|(kind, _)| *kind));

    Some(RecordKeys {
        prn,
        src,
        key2: key.map(|(_, value)| value),
        valid_for,
        description: extract_description(line).unwrap_or_default(),
    })
}

/// Parses the `"src":"<u>","dst":"<u>","pgn":"<u>"` literal sequence.
fn extract_addresses(line: &str) -> Option<(u32, u32)> {
    let rest = &line[line.find("\"src\":\"")? + "\"src\":\"".len()..];
    let (src, rest) = take_number(rest)?;
    let rest = rest.strip_prefix("\",\"dst\":\"")?;
    let (_dst, rest) = take_number(rest)?;
    let rest = rest.strip_prefix("\",\"pgn\":\"")?;
    let (prn, _) = take_number(rest)?;
    Some((src, prn))
}

/// Splits a leading run of ASCII digits off `s`.
fn take_number(s: &str) -> Option<(u32, &str)> {
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let n = s[..end].parse().ok()?;
    Some((n, &s[end..]))
}

/// Scans for the first secondary-key pattern and captures its value.
fn extract_secondary_key(line: &str) -> Option<(SecondaryKey, String)> {
    for (pattern, kind) in SECONDARY_KEY_PATTERNS {
        if let Some(pos) = line.find(pattern) {
            let after = line[pos + pattern.len()..].trim_start_matches(SKIP_CHARACTERS);
            let end = after.find([' ', '"']).unwrap_or(after.len());
            return Some((kind, after[..end].to_string()));
        }
    }
    None
}

/// Captures the value of the `"description":` field.
///
/// One character past the colon is skipped unconditionally (the opening
/// quote); the value runs to the next `:` or `"`, whichever comes first.
fn extract_description(line: &str) -> Option<String> {
    let pos = line.find("\"description\":")?;
    let after = line.get(pos + "\"description\":".len() + 1..)?;
    let end = after.find([':', '"'])?;
    Some(after[..end].to_string())
}
