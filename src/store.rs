use crate::errors::StoreError;
use crate::record::{prn_in_range, RecordKeys};

use std::collections::HashMap;
use std::fmt::Write;

/// A single observed record for one `(PGN, src, key2)` combination.
///
/// The primary key is `src` plus `key2`; `text` is the raw analyzer line,
/// newline stripped, stored verbatim so snapshots can embed it without
/// re-serialization.
#[derive(Debug)]
pub struct Message {
    /// Sender address, 1–255.
    pub src: u8,
    /// Secondary key value, when the PGN carries one.
    pub key2: Option<String>,
    /// Wall-clock second past which the entry is stale.
    pub expires_at: u64,
    /// The raw JSON line as received.
    pub text: String,
}

/// Everything known about one PGN: its label and the latest message per
/// primary key.
///
/// The message list only ever grows; slots whose `expires_at` lies in the
/// past are reused for new keys instead of being freed.
#[derive(Debug)]
pub struct PgnEntry {
    /// The Parameter Group Number.
    pub prn: u32,
    /// Human-readable label taken from the first record seen for this PGN.
    pub description: String,
    /// Latest message per live `(src, key2)`.
    pub messages: Vec<Message>,
}

/// In-memory table of the latest bus state, keyed by PGN.
///
/// Entries are kept in first-sighting order so snapshots iterate
/// deterministically. An entry is never removed for the process lifetime.
#[derive(Debug, Default)]
pub struct PgnStore {
    entries: Vec<PgnEntry>,
    index: HashMap<u32, usize>,
}

impl PgnStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct PGNs ever observed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no PGN has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in first-sighting order.
    pub fn entries(&self) -> &[PgnEntry] {
        &self.entries
    }

    /// Applies one accepted record to the store.
    ///
    /// Looks up or creates the [`PgnEntry`], then within it:
    /// 1. a message with the same `(src, key2)` is overwritten in place and
    ///    its expiry bumped;
    /// 2. otherwise an expired slot is reused, dropping its old key;
    /// 3. otherwise the message list grows by one.
    ///
    /// The parser has already range-checked the PGN, so an out-of-range PGN
    /// here is an invariant violation and comes back as an error.
    pub fn update(&mut self, keys: RecordKeys, text: &str, now: u64) -> Result<(), StoreError> {
        if !prn_in_range(keys.prn) {
            return Err(StoreError::PrnOutOfRange(keys.prn));
        }
        let expires_at = now + keys.valid_for;

        let idx = match self.index.get(&keys.prn) {
            Some(&idx) => idx,
            None => {
                log::debug!("New PGN {} '{}'", keys.prn, keys.description);
                self.entries.push(PgnEntry {
                    prn: keys.prn,
                    description: keys.description,
                    messages: Vec::new(),
                });
                let idx = self.entries.len() - 1;
                self.index.insert(keys.prn, idx);
                idx
            }
        };
        let entry = &mut self.entries[idx];

        // Existing primary key?
        if let Some(m) = entry
            .messages
            .iter_mut()
            .find(|m| m.src == keys.src && m.key2 == keys.key2)
        {
            m.text.clear();
            m.text.push_str(text);
            m.expires_at = expires_at;
            return Ok(());
        }

        // Reuse an expired slot?
        if let Some(m) = entry.messages.iter_mut().find(|m| m.expires_at < now) {
            m.src = keys.src;
            m.key2 = keys.key2;
            m.text.clear();
            m.text.push_str(text);
            m.expires_at = expires_at;
            return Ok(());
        }

        entry.messages.push(Message {
            src: keys.src,
            key2: keys.key2,
            expires_at,
            text: text.to_string(),
        });
        Ok(())
    }

    /// Serializes every non-expired message into a single JSON object.
    ///
    /// One property per PGN (decimal string) holding the description and
    /// one `"<src>"` or `"<src>_<key2>"` property per live message whose
    /// value is the stored raw line. PGNs with no live message are omitted,
    /// so the result is `{}` on a quiet bus. Liveness is inclusive:
    /// a message expiring exactly now is still included.
    pub fn full_state_json(&self, now: u64) -> String {
        let mut state = String::with_capacity(8192);
        let mut separator = '{';

        for entry in &self.entries {
            if !entry.messages.iter().any(|m| m.expires_at >= now) {
                continue;
            }
            let _ = write!(
                state,
                "{}\"{}\":\n  {{\"description\":\"{}\"\n",
                separator, entry.prn, entry.description
            );
            for m in entry.messages.iter().filter(|m| m.expires_at >= now) {
                match &m.key2 {
                    Some(key2) => {
                        let _ = write!(state, "  ,\"{}_{}\":{}\n", m.src, key2, m.text);
                    }
                    None => {
                        let _ = write!(state, "  ,\"{}\":{}\n", m.src, m.text);
                    }
                }
            }
            state.push_str("  }\n");
            separator = ',';
        }

        if separator == ',' {
            state.push_str("}\n");
        } else {
            state.push_str("{}\n");
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_line;

    fn record(src: u32, pgn: u32, fields: &str) -> String {
        format!(
            "{{\"timestamp\":\"2011-11-24-22:42:04.388\",\"prio\":\"2\",\"src\":\"{}\",\"dst\":\"255\",\"pgn\":\"{}\",\"description\":\"Water Depth\",\"fields\":{{{}}}}}",
            src, pgn, fields
        )
    }

    fn ingest(store: &mut PgnStore, line: &str, now: u64) {
        let keys = parse_line(line).expect("test record must parse");
        store.update(keys, line, now).unwrap();
    }

    #[test]
    fn test_snapshot_contains_record_under_src() {
        let mut store = PgnStore::new();
        let line = record(35, 128267, "\"Depth\":\"3.1\"");
        ingest(&mut store, &line, 1000);

        let state = store.full_state_json(1000);
        let parsed: serde_json::Value = serde_json::from_str(&state).unwrap();
        assert_eq!(parsed["128267"]["description"], "Water Depth");
        assert_eq!(
            parsed["128267"]["35"],
            serde_json::from_str::<serde_json::Value>(&line).unwrap()
        );
    }

    #[test]
    fn test_two_sources_both_present() {
        let mut store = PgnStore::new();
        ingest(&mut store, &record(35, 128267, "\"Depth\":\"3.1\""), 1000);
        ingest(&mut store, &record(36, 128267, "\"Depth\":\"3.1\""), 1000);

        let parsed: serde_json::Value =
            serde_json::from_str(&store.full_state_json(1000)).unwrap();
        assert!(parsed["128267"].get("35").is_some());
        assert!(parsed["128267"].get("36").is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(store.entries()[0].messages.len(), 2);
    }

    #[test]
    fn test_same_key_overwrites_in_place() {
        let mut store = PgnStore::new();
        ingest(&mut store, &record(35, 128267, "\"Depth\":\"3.1\""), 1000);
        let updated = record(35, 128267, "\"Depth\":\"4.2\"");
        ingest(&mut store, &updated, 1050);

        let entry = &store.entries()[0];
        assert_eq!(entry.messages.len(), 1);
        assert_eq!(entry.messages[0].text, updated);
        assert_eq!(entry.messages[0].expires_at, 1050 + 120);
    }

    #[test]
    fn test_distinct_secondary_keys_coexist() {
        let mut store = PgnStore::new();
        ingest(
            &mut store,
            &record(1, 129038, "\"User ID\":\"366123\",\"Lat\":\"52.1\""),
            1000,
        );
        ingest(
            &mut store,
            &record(1, 129038, "\"User ID\":\"366999\",\"Lat\":\"52.2\""),
            1000,
        );

        let entry = &store.entries()[0];
        assert_eq!(entry.messages.len(), 2);

        let parsed: serde_json::Value =
            serde_json::from_str(&store.full_state_json(1000)).unwrap();
        assert!(parsed["129038"].get("1_366123").is_some());
        assert!(parsed["129038"].get("1_366999").is_some());
    }

    #[test]
    fn test_expired_message_excluded_from_snapshot() {
        let mut store = PgnStore::new();
        ingest(&mut store, &record(2, 129025, "\"Lat\":\"52.1\""), 1000);

        // Inclusive liveness at the boundary, excluded one second later.
        let at_expiry: serde_json::Value =
            serde_json::from_str(&store.full_state_json(1120)).unwrap();
        assert!(at_expiry.get("129025").is_some());

        let past_expiry: serde_json::Value =
            serde_json::from_str(&store.full_state_json(1121)).unwrap();
        assert!(past_expiry.get("129025").is_none());
    }

    #[test]
    fn test_expired_slot_reused_and_key_replaced() {
        let mut store = PgnStore::new();
        ingest(
            &mut store,
            &record(1, 127505, "\"Tank Instance\":\"2\",\"Level\":\"83\""),
            1000,
        );
        // 121 seconds later the slot is expired and taken over by a new key.
        ingest(
            &mut store,
            &record(1, 127505, "\"Tank Instance\":\"3\",\"Level\":\"50\""),
            1121,
        );

        let entry = &store.entries()[0];
        assert_eq!(entry.messages.len(), 1);
        assert_eq!(entry.messages[0].key2.as_deref(), Some("3"));
    }

    #[test]
    fn test_empty_snapshot_is_parseable() {
        let store = PgnStore::new();
        let parsed: serde_json::Value =
            serde_json::from_str(&store.full_state_json(1000)).unwrap();
        assert_eq!(parsed, serde_json::json!({}));
    }

    #[test]
    fn test_snapshot_iterates_in_insertion_order() {
        let mut store = PgnStore::new();
        ingest(&mut store, &record(1, 130306, "\"Speed\":\"4.0\""), 1000);
        ingest(&mut store, &record(1, 128267, "\"Depth\":\"3.1\""), 1000);

        let state = store.full_state_json(1000);
        assert!(state.find("130306").unwrap() < state.find("128267").unwrap());
    }

    #[test]
    fn test_out_of_range_prn_is_an_error() {
        let mut store = PgnStore::new();
        let mut keys = parse_line(&record(1, 128267, "\"Depth\":\"3.1\"")).unwrap();
        keys.prn = 42;
        assert!(matches!(
            store.update(keys, "{}", 1000),
            Err(StoreError::PrnOutOfRange(42))
        ));
    }

    #[test]
    fn test_description_set_once() {
        let mut store = PgnStore::new();
        ingest(&mut store, &record(1, 128267, "\"Depth\":\"3.1\""), 1000);
        let other = "{\"timestamp\":\"x\",\"src\":\"2\",\"dst\":\"255\",\"pgn\":\"128267\",\"description\":\"Renamed\",\"fields\":{\"Depth\":\"3.2\"}}";
        ingest(&mut store, other, 1000);

        assert_eq!(store.entries()[0].description, "Water Depth");
    }
}
