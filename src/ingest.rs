use crate::defs::LINE_BUFFER_SIZE;
use crate::errors::StoreError;
use crate::record;
use crate::store::PgnStore;

/// Reassembles the analyzer byte stream into newline-terminated candidate
/// records and runs each one through validation, the store update, and the
/// pending-broadcast buffer.
///
/// There is exactly one ingester per server; `Copy`-mode client input is
/// fed through the same instance, so injected records share the reassembly
/// buffer with the analyzer stream.
#[derive(Debug, Default)]
pub struct Ingester {
    line: Vec<u8>,
}

impl Ingester {
    /// Creates an ingester with an empty reassembly buffer.
    pub fn new() -> Self {
        Self {
            line: Vec::with_capacity(LINE_BUFFER_SIZE),
        }
    }

    /// Consumes a chunk of input bytes.
    ///
    /// Bytes accumulate until a newline completes a candidate record.
    /// Overflowing [`LINE_BUFFER_SIZE`] silently truncates the line.
    /// Accepted records land in `store` and are appended, newline
    /// terminated, to `pending` for this iteration's broadcast.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        store: &mut PgnStore,
        pending: &mut Vec<u8>,
        now: u64,
    ) -> Result<(), StoreError> {
        for &c in bytes {
            if c != b'\n' {
                if self.line.len() < LINE_BUFFER_SIZE {
                    self.line.push(c);
                }
                continue;
            }
            self.handle_line(store, pending, now)?;
            self.line.clear();
        }
        Ok(())
    }

    fn handle_line(
        &mut self,
        store: &mut PgnStore,
        pending: &mut Vec<u8>,
        now: u64,
    ) -> Result<(), StoreError> {
        let text = match std::str::from_utf8(&self.line) {
            Ok(text) => text,
            Err(_) => {
                log::debug!("Ignore non-UTF-8 line of {} bytes", self.line.len());
                return Ok(());
            }
        };
        let keys = match record::parse_line(text) {
            Some(keys) => keys,
            None => return Ok(()),
        };

        store.update(keys, text, now)?;
        pending.extend_from_slice(text.as_bytes());
        pending.push(b'\n');
        Ok(())
    }
}
