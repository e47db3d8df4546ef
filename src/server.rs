use crate::clock;
use crate::defs::{
    FIXED_STREAMS, LINE_BUFFER_SIZE, LISTEN_BACKLOG, MAX_STREAMS, READ_WAIT_MSEC,
    SNAPSHOT_DELAY_MSEC,
};
use crate::errors::ServerError;
use crate::ingest::Ingester;
use crate::registry::{ClientKind, ClientSlot, ClientTable, OutputMode};
use crate::store::PgnStore;

use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use socket2::{Domain, Protocol, Socket, Type};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

const INPUT: Token = Token(0);
const JSON_LISTENER: Token = Token(1);
const NMEA0183_LISTENER: Token = Token(2);

/// Client tokens start past the fixed descriptors.
const CLIENT_BASE: usize = 3;

/// What the write phase owes a client this iteration.
enum WriteAction {
    Snapshot,
    Broadcast,
    Nothing,
}

/// Startup parameters for [`Server`].
#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    /// JSON port; the NMEA 0183 listener binds `port + 1`.
    pub port: u16,
    /// Routing of forwarded client lines and the mirrored ingest stream.
    pub output_mode: OutputMode,
}

/// The single-threaded aggregation server.
///
/// Owns every descriptor — the analyzer input, the two listeners and all
/// accepted clients — plus the PGN store, the shared ingester and the
/// per-iteration pending-broadcast buffer. One value, driven by [`run`],
/// replaces the process-global state of a classic select server.
///
/// [`run`]: Server::run
pub struct Server {
    poll: Poll,
    events: Events,
    input: File,
    json_listener: TcpListener,
    nmea_listener: TcpListener,
    clients: ClientTable,
    store: PgnStore,
    ingester: Ingester,
    pending: Vec<u8>,
    output_mode: OutputMode,
}

impl Server {
    /// Creates a server reading the analyzer stream from stdin.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let input = io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| ServerError::InputError(e.to_string()))?;
        Self::with_input(config, input)
    }

    /// Creates a server reading the analyzer stream from an arbitrary
    /// descriptor (tests hand this a pipe).
    pub fn with_input(config: ServerConfig, input: OwnedFd) -> Result<Self, ServerError> {
        set_nonblocking(input.as_raw_fd())?;
        let input = File::from(input);

        let poll = Poll::new().map_err(|e| ServerError::PollError(e.to_string()))?;

        let mut json_listener = bind_listener(config.port)?;
        let mut nmea_listener = bind_listener(config.port + 1)?;

        let registry = poll.registry();
        registry
            .register(&mut json_listener, JSON_LISTENER, Interest::READABLE)
            .map_err(|e| ServerError::RegistryError(e.to_string()))?;
        registry
            .register(&mut nmea_listener, NMEA0183_LISTENER, Interest::READABLE)
            .map_err(|e| ServerError::RegistryError(e.to_string()))?;
        let raw = input.as_raw_fd();
        registry
            .register(&mut SourceFd(&raw), INPUT, Interest::READABLE)
            .map_err(|e| ServerError::RegistryError(e.to_string()))?;

        log::info!("TCP JSON server listening on port {}", config.port);
        log::info!("TCP NMEA0183 server listening on port {}", config.port + 1);

        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            input,
            json_listener,
            nmea_listener,
            clients: ClientTable::with_capacity(MAX_STREAMS - FIXED_STREAMS),
            store: PgnStore::new(),
            ingester: Ingester::new(),
            pending: Vec::new(),
            output_mode: config.output_mode,
        })
    }

    /// Runs the readiness loop until a fatal error.
    ///
    /// A clean return does not exist in normal operation: the analyzer
    /// stream ending is itself a fatal error. Writes to peers that have
    /// gone away fail by return value — the Rust runtime ignores
    /// `SIGPIPE` before `main`.
    pub fn run(&mut self) -> Result<(), ServerError> {
        log::info!("Entering main server loop");
        loop {
            self.tick()?;
        }
    }

    /// One loop iteration: wait for readiness, drain every ready source,
    /// then run the write phase and discard the broadcast buffer.
    fn tick(&mut self) -> Result<(), ServerError> {
        let timeout = self.poll_timeout()?;
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(ServerError::PollError(e.to_string()));
        }

        let tokens: Vec<Token> = self.events.iter().map(|ev| ev.token()).collect();
        let now_ms = clock::wall_millis()?;
        for token in tokens {
            match token {
                INPUT => self.drain_input()?,
                JSON_LISTENER => self.accept_clients(true, now_ms)?,
                NMEA0183_LISTENER => self.accept_clients(false, now_ms)?,
                Token(n) => self.drain_client(n - CLIENT_BASE)?,
            }
        }

        self.write_phase()?;
        self.pending.clear();
        Ok(())
    }

    /// Time the loop may sleep: at most [`READ_WAIT_MSEC`], less when a
    /// one-shot snapshot comes due sooner.
    fn poll_timeout(&self) -> Result<Duration, ServerError> {
        let now_ms = clock::wall_millis()?;
        let mut wait = READ_WAIT_MSEC;
        for (_, slot) in self.clients.iter() {
            if slot.kind == ClientKind::JsonOneshot {
                wait = wait.min(slot.snapshot_due.saturating_sub(now_ms));
            }
        }
        Ok(Duration::from_millis(wait))
    }

    /// Reads the analyzer stream to exhaustion, feeding the ingester.
    ///
    /// EOF or a hard read error is fatal: the analyzer is a required live
    /// producer and there is nothing to serve without it.
    fn drain_input(&mut self) -> Result<(), ServerError> {
        let mut chunk = [0u8; LINE_BUFFER_SIZE];
        loop {
            match self.input.read(&mut chunk) {
                Ok(0) => {
                    return Err(ServerError::InputError("EOF on analyzer stream".into()));
                }
                Ok(n) => {
                    let now = clock::wall_secs()?;
                    self.ingester
                        .feed(&chunk[..n], &mut self.store, &mut self.pending, now)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::InputError(e.to_string())),
            }
        }
    }

    /// Accepts as many pending connections as the listener holds.
    ///
    /// JSON connections start as one-shot snapshot clients with their
    /// deadline half a second out; NMEA 0183 connections are stream slots
    /// owned by the translator.
    fn accept_clients(&mut self, json: bool, now_ms: u64) -> Result<(), ServerError> {
        loop {
            let accepted = if json {
                self.json_listener.accept()
            } else {
                self.nmea_listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => self.admit_client(stream, peer, json, now_ms),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Failed to accept TCP connection: {}", e);
                    return Ok(());
                }
            }
        }
    }

    fn admit_client(&mut self, stream: TcpStream, peer: SocketAddr, json: bool, now_ms: u64) {
        let kind = if json {
            ClientKind::JsonOneshot
        } else {
            ClientKind::Nmea0183Stream
        };
        let slot = ClientSlot::new(stream, kind, peer, now_ms + SNAPSHOT_DELAY_MSEC);

        let idx = match self.clients.insert(slot) {
            Some(idx) => idx,
            None => {
                // Dropping the slot closed the socket.
                log::error!(
                    "Already {} active streams, ignoring new one from {}",
                    MAX_STREAMS - FIXED_STREAMS,
                    peer
                );
                return;
            }
        };

        let registered = match self.clients.get_mut(idx) {
            Some(slot) => self.poll.registry().register(
                &mut slot.stream,
                Token(CLIENT_BASE + idx),
                Interest::READABLE,
            ),
            None => Ok(()),
        };
        match registered {
            Ok(()) => {
                log::info!("New {:?} client {} at slot {}", kind, peer, idx);
            }
            Err(e) => {
                log::warn!("Failed to register client {}: {}", peer, e);
                self.clients.remove(idx);
            }
        }
    }

    /// Reads a client socket to exhaustion, one buffered line at a time.
    ///
    /// The slot buffer holds the current partial line and is bounded per
    /// byte at [`LINE_BUFFER_SIZE`], so no extracted line can outgrow it.
    /// A line ending in `-\n` on a JSON client upgrades the slot to the
    /// live stream; every other complete line is routed by the stdout
    /// mode. EOF, read errors and a full buffer with no newline in sight
    /// all close the slot.
    fn drain_client(&mut self, idx: usize) -> Result<(), ServerError> {
        let mut forwards: Vec<Vec<u8>> = Vec::new();
        let mut close = false;

        if let Some(slot) = self.clients.get_mut(idx) {
            let mut chunk = [0u8; LINE_BUFFER_SIZE];
            'drain: loop {
                match slot.stream.read(&mut chunk) {
                    Ok(0) => {
                        close = true;
                        break;
                    }
                    Ok(n) => {
                        for &c in &chunk[..n] {
                            if c != b'\n' {
                                if slot.read_buf.len() >= LINE_BUFFER_SIZE {
                                    log::warn!(
                                        "Client {} sent {} bytes without newline, closing",
                                        slot.peer,
                                        slot.read_buf.len()
                                    );
                                    close = true;
                                    break 'drain;
                                }
                                slot.read_buf.push(c);
                                continue;
                            }
                            let mut line = std::mem::take(&mut slot.read_buf);
                            line.push(b'\n');
                            match slot.kind {
                                ClientKind::JsonOneshot | ClientKind::JsonStream => {
                                    if line.ends_with(b"-\n") {
                                        log::info!(
                                            "Client {} switched to JSON streaming",
                                            slot.peer
                                        );
                                        slot.kind = ClientKind::JsonStream;
                                    } else {
                                        forwards.push(line);
                                    }
                                }
                                // The 0183 byte protocol belongs to the
                                // translator; inbound data is discarded.
                                ClientKind::Nmea0183Stream => {}
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("Read error on client {}: {}", slot.peer, e);
                        close = true;
                        break;
                    }
                }
            }
        }

        for line in forwards {
            self.forward_client_line(&line)?;
        }
        if close {
            self.close_client(idx, "read side done");
        }
        Ok(())
    }

    /// Routes one complete client line by stdout mode: pass it through,
    /// tee it into the ingester, or drop it.
    fn forward_client_line(&mut self, line: &[u8]) -> Result<(), ServerError> {
        match self.output_mode {
            OutputMode::Stream => {
                write_stdout(line)?;
            }
            OutputMode::Copy => {
                let now = clock::wall_secs()?;
                self.ingester
                    .feed(line, &mut self.store, &mut self.pending, now)?;
            }
            OutputMode::Sink => {}
        }
        Ok(())
    }

    /// The write half of one iteration.
    ///
    /// One-shot clients past their deadline get the snapshot (built once
    /// per phase) and are closed; stream clients and stdout get the
    /// pending-broadcast buffer. Any client that cannot take its write
    /// right now is closed — a stuck consumer is not worth blocking on.
    fn write_phase(&mut self) -> Result<(), ServerError> {
        let now_ms = clock::wall_millis()?;
        let now_secs = now_ms / 1000;
        let mut snapshot: Option<String> = None;

        for idx in self.clients.indices() {
            let action = match self.clients.get_mut(idx) {
                Some(slot) => match slot.kind {
                    ClientKind::JsonOneshot if slot.snapshot_due <= now_ms => {
                        WriteAction::Snapshot
                    }
                    ClientKind::JsonStream if !self.pending.is_empty() => WriteAction::Broadcast,
                    _ => WriteAction::Nothing,
                },
                None => WriteAction::Nothing,
            };

            match action {
                WriteAction::Snapshot => {
                    let state =
                        snapshot.get_or_insert_with(|| self.store.full_state_json(now_secs));
                    if let Some(slot) = self.clients.get_mut(idx) {
                        if let Err(e) = slot.stream.write_all(state.as_bytes()) {
                            log::debug!("Snapshot write to {} failed: {}", slot.peer, e);
                        }
                    }
                    self.close_client(idx, "snapshot sent");
                }
                WriteAction::Broadcast => {
                    let mut delivered = true;
                    if let Some(slot) = self.clients.get_mut(idx) {
                        if let Err(e) = slot.stream.write_all(&self.pending) {
                            log::debug!("Broadcast write to {} failed: {}", slot.peer, e);
                            delivered = false;
                        }
                    }
                    if !delivered {
                        self.close_client(idx, "broadcast write failed");
                    }
                }
                WriteAction::Nothing => {}
            }
        }

        if !self.pending.is_empty()
            && matches!(self.output_mode, OutputMode::Stream | OutputMode::Copy)
        {
            write_stdout(&self.pending)?;
        }
        Ok(())
    }

    /// Deregisters and drops one client slot.
    fn close_client(&mut self, idx: usize, why: &str) {
        if let Some(mut slot) = self.clients.remove(idx) {
            let _ = self.poll.registry().deregister(&mut slot.stream);
            log::debug!("Closing client {} at slot {} ({})", slot.peer, idx, why);
        }
    }
}

/// Writes to stdout, treating any failure as fatal.
fn write_stdout(bytes: &[u8]) -> Result<(), ServerError> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    out.write_all(bytes)
        .and_then(|_| out.flush())
        .map_err(|e| ServerError::StdoutError(e.to_string()))
}

/// Builds one nonblocking listener: `SO_REUSEADDR`, backlog
/// [`LISTEN_BACKLOG`].
fn bind_listener(port: u16) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let bind = || -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket)
    };
    let socket = bind().map_err(|e| ServerError::BindError(format!("port {}: {}", port, e)))?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Marks a descriptor nonblocking so edge-triggered draining cannot stall
/// the loop.
fn set_nonblocking(fd: RawFd) -> Result<(), ServerError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| ServerError::RegistryError(e.to_string()))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| ServerError::RegistryError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpStream as StdStream;
    use std::thread;
    use std::time::Duration;

    fn record(src: u32, pgn: u32) -> String {
        format!(
            "{{\"timestamp\":\"2011-11-24-22:42:04.388\",\"prio\":\"2\",\"src\":\"{}\",\"dst\":\"255\",\"pgn\":\"{}\",\"description\":\"Water Depth\",\"fields\":{{\"Depth\":\"3.1\"}}}}",
            src, pgn
        )
    }

    /// Spawns a server on `port` fed from a pipe; returns the write end
    /// standing in for the analyzer.
    fn spawn_server(port: u16, output_mode: OutputMode) -> File {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut server =
            Server::with_input(ServerConfig { port, output_mode }, read_end).unwrap();
        thread::spawn(move || {
            let _ = server.run();
        });
        thread::sleep(Duration::from_millis(100));
        File::from(write_end)
    }

    #[test]
    fn test_oneshot_client_receives_snapshot_then_eof() {
        let mut input = spawn_server(25961, OutputMode::Sink);
        let line = record(35, 128267);
        writeln!(input, "{}", line).unwrap();
        thread::sleep(Duration::from_millis(100));

        let mut client = StdStream::connect("127.0.0.1:25961").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut state = String::new();
        client.read_to_string(&mut state).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&state).unwrap();
        assert_eq!(parsed["128267"]["description"], "Water Depth");
        assert_eq!(
            parsed["128267"]["35"],
            serde_json::from_str::<serde_json::Value>(&line).unwrap()
        );
    }

    #[test]
    fn test_two_sources_in_one_snapshot() {
        let mut input = spawn_server(25971, OutputMode::Sink);
        writeln!(input, "{}", record(35, 128267)).unwrap();
        writeln!(input, "{}", record(36, 128267)).unwrap();
        thread::sleep(Duration::from_millis(100));

        let mut client = StdStream::connect("127.0.0.1:25971").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut state = String::new();
        client.read_to_string(&mut state).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&state).unwrap();
        assert!(parsed["128267"].get("35").is_some());
        assert!(parsed["128267"].get("36").is_some());
    }

    #[test]
    fn test_stream_client_receives_records_in_order_and_nothing_else() {
        let mut input = spawn_server(25981, OutputMode::Sink);

        let mut client = StdStream::connect("127.0.0.1:25981").unwrap();
        client.write_all(b"-\n").unwrap();
        thread::sleep(Duration::from_millis(200));

        let first = record(35, 128267);
        let second = record(36, 128267);
        writeln!(input, "{}", first).unwrap();
        writeln!(input, "{}", second).unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut reader = BufReader::new(&client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), first);
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), second);

        // No snapshot, no duplicates: the next read times out instead.
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        line.clear();
        let err = reader.read_line(&mut line).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_copy_mode_client_injects_records() {
        let _input = spawn_server(25991, OutputMode::Copy);

        let line = record(7, 128267);
        let mut injector = StdStream::connect("127.0.0.1:25991").unwrap();
        writeln!(injector, "{}", line).unwrap();
        thread::sleep(Duration::from_millis(100));

        let mut client = StdStream::connect("127.0.0.1:25991").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut state = String::new();
        client.read_to_string(&mut state).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&state).unwrap();
        assert!(parsed["128267"].get("7").is_some());
    }

    #[test]
    fn test_client_exceeding_line_buffer_is_closed() {
        let _input = spawn_server(26011, OutputMode::Sink);

        let mut client = StdStream::connect("127.0.0.1:26011").unwrap();
        // One byte past the line bound, no newline anywhere.
        let blob = vec![b'x'; LINE_BUFFER_SIZE + 1];
        client.write_all(&blob).unwrap();

        // The server drops the connection straight away: EOF arrives with
        // no data, well before the snapshot deadline could deliver "{}".
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn test_nmea0183_port_accepts_and_stays_open() {
        let _input = spawn_server(26001, OutputMode::Sink);

        let mut client = StdStream::connect("127.0.0.1:26002").unwrap();
        client.write_all(b"$GPGLL,ignored\n").unwrap();
        thread::sleep(Duration::from_millis(300));

        // Still connected: the read times out rather than hitting EOF.
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }
}
