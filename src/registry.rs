use crate::defs::LINE_BUFFER_SIZE;

use mio::net::TcpStream;
use std::net::SocketAddr;

/// What an accepted TCP socket is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientKind {
    /// Receives one full-state snapshot after a short delay, then is closed.
    JsonOneshot,
    /// Receives every ingested record, live, until disconnect.
    JsonStream,
    /// Owned by the NMEA 0183 translator; accepted and kept live here.
    Nmea0183Stream,
}

/// How stdout handles data, both forwarded client lines and the mirrored
/// ingest stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Pass client lines through verbatim and mirror ingested records.
    Stream,
    /// Tee client lines into the ingester instead (synthetic record
    /// injection); ingested records are still mirrored.
    Copy,
    /// Discard everything.
    Sink,
}

/// One accepted client connection.
#[derive(Debug)]
pub struct ClientSlot {
    /// The nonblocking socket, registered with the readiness poll.
    pub stream: TcpStream,
    /// Current role; a `JsonOneshot` may upgrade to `JsonStream`.
    pub kind: ClientKind,
    /// Peer address, for logging.
    pub peer: SocketAddr,
    /// Bytes read but not yet terminated by a newline.
    pub read_buf: Vec<u8>,
    /// Deadline in epoch milliseconds for the one-shot snapshot.
    pub snapshot_due: u64,
}

impl ClientSlot {
    /// Wraps a freshly accepted socket.
    pub fn new(stream: TcpStream, kind: ClientKind, peer: SocketAddr, snapshot_due: u64) -> Self {
        Self {
            stream,
            kind,
            peer,
            read_buf: Vec::with_capacity(LINE_BUFFER_SIZE),
            snapshot_due,
        }
    }
}

/// Bounded table of accepted clients, indexed by small integers that double
/// as poll tokens.
///
/// Freed indices are reused lowest-first, and the table shrinks
/// conservatively from the top so iteration stays proportional to the
/// highest live index.
#[derive(Debug)]
pub struct ClientTable {
    slots: Vec<Option<ClientSlot>>,
    capacity: usize,
}

impl ClientTable {
    /// Creates a table admitting at most `capacity` concurrent clients.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
        }
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether no client is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores a client in the lowest free slot and returns its index, or
    /// `None` when the table is full (the caller drops the newcomer).
    pub fn insert(&mut self, slot: ClientSlot) -> Option<usize> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(slot);
            return Some(idx);
        }
        if self.slots.len() >= self.capacity {
            return None;
        }
        self.slots.push(Some(slot));
        Some(self.slots.len() - 1)
    }

    /// Removes and returns the client at `idx`, shrinking trailing free
    /// slots off the top of the table.
    pub fn remove(&mut self, idx: usize) -> Option<ClientSlot> {
        let slot = self.slots.get_mut(idx)?.take();
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        slot
    }

    /// The client at `idx`, if live.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ClientSlot> {
        self.slots.get_mut(idx)?.as_mut()
    }

    /// Live clients with their indices, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ClientSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.as_ref().map(|slot| (idx, slot)))
    }

    /// Indices of all live clients, lowest first.
    pub fn indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.as_ref().map(|_| idx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};

    fn test_slot(listener: &StdListener, kind: ClientKind) -> ClientSlot {
        let addr = listener.local_addr().unwrap();
        let _connect = StdStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        ClientSlot::new(TcpStream::from_std(accepted), kind, peer, 0)
    }

    #[test]
    fn test_insert_reuses_lowest_free_index() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let mut table = ClientTable::with_capacity(8);

        let a = table.insert(test_slot(&listener, ClientKind::JsonOneshot)).unwrap();
        let b = table.insert(test_slot(&listener, ClientKind::JsonStream)).unwrap();
        let c = table.insert(test_slot(&listener, ClientKind::JsonOneshot)).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        table.remove(1).unwrap();
        let again = table.insert(test_slot(&listener, ClientKind::JsonOneshot)).unwrap();
        assert_eq!(again, 1);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let mut table = ClientTable::with_capacity(2);

        assert!(table.insert(test_slot(&listener, ClientKind::JsonOneshot)).is_some());
        assert!(table.insert(test_slot(&listener, ClientKind::JsonOneshot)).is_some());
        assert!(table.insert(test_slot(&listener, ClientKind::JsonOneshot)).is_none());
    }

    #[test]
    fn test_remove_shrinks_trailing_slots() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let mut table = ClientTable::with_capacity(8);

        table.insert(test_slot(&listener, ClientKind::JsonOneshot)).unwrap();
        table.insert(test_slot(&listener, ClientKind::JsonOneshot)).unwrap();
        table.insert(test_slot(&listener, ClientKind::JsonOneshot)).unwrap();

        table.remove(2).unwrap();
        table.remove(1).unwrap();
        assert_eq!(table.slots.len(), 1);
        assert_eq!(table.indices(), vec![0]);
    }
}
