/// Default TCP port of the JSON server.
///
/// The NMEA 0183 server always listens on the next port up.
pub const DEFAULT_PORT: u16 = 2597;

/// Delay in milliseconds before a freshly connected one-shot JSON client
/// receives its full-state snapshot.
///
/// Holding the snapshot back briefly lets a client that wants the live
/// stream instead announce itself (see the `-` upgrade line) before any
/// state is sent.
pub const SNAPSHOT_DELAY_MSEC: u64 = 500;

/// Upper bound in milliseconds on one readiness wait.
///
/// The loop wakes at least this often so expired snapshot deadlines are
/// served even when the bus is quiet.
pub const READ_WAIT_MSEC: u64 = 1000;

/// Seconds before an ordinary sensor message stops being included
/// in snapshots.
pub const SENSOR_TIMEOUT_SEC: u64 = 120;

/// Seconds before an AIS-class message expires.
///
/// AIS targets report slowly, so their state is kept much longer than
/// ordinary sensor readings.
pub const AIS_TIMEOUT_SEC: u64 = 3600;

/// Seconds before a SonicHub message expires (~31 days, effectively
/// permanent for the process lifetime).
pub const SONICHUB_TIMEOUT_SEC: u64 = 3600 * 24 * 31;

/// Listen backlog of both TCP servers.
pub const LISTEN_BACKLOG: i32 = 10;

/// Size of every line-reassembly buffer, for the analyzer stream and for
/// accepted clients alike.
///
/// Lines longer than this are silently truncated.
pub const LINE_BUFFER_SIZE: usize = 4096;

/// Hard cap on concurrently open descriptors, matching the classic
/// `FD_SETSIZE` budget.
pub const MAX_STREAMS: usize = 1024;

/// Descriptors the server itself owns (input, stdout and the two
/// listeners); the client table gets the rest of [`MAX_STREAMS`].
pub const FIXED_STREAMS: usize = 4;

/// Lowest valid Parameter Group Number.
pub const MIN_PGN: u32 = 59391;

/// Highest valid Parameter Group Number in the standard range.
pub const MAX_PGN: u32 = 131000;

/// Base of the manufacturer / Actisense BEM range.
pub const ACTISENSE_BEM: u32 = 0x40_0000;

/// Width of the Actisense BEM range.
pub const ACTISENSE_RNG: u32 = 0x100;

/// PGN of the product-information message, which expires on the AIS
/// schedule regardless of its secondary key.
pub const PGN_PRODUCT_INFO: u32 = 126996;

/// PGN of SonicHub media messages, which effectively never expire.
pub const PGN_SONICHUB: u32 = 130816;
