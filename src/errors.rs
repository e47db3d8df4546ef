use thiserror::Error;

/// Errors from the in-memory PGN store.
///
/// The store trusts the parser to have validated incoming records, so the
/// only failure it can report is the invariant violation of being handed a
/// PGN outside the declared ranges. That is a programming error and is
/// treated as fatal by the caller.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The PGN does not fall in `[MIN_PGN, MAX_PGN]` or the Actisense
    /// BEM range.
    #[error("PGN {0} is out of range")]
    PrnOutOfRange(u32),
}

/// Errors returned by the aggregation server and its event loop.
///
/// All of these are fatal: they unwind [`Server::run`](crate::server::Server::run)
/// and terminate the process. Per-client failures (short writes, resets,
/// disconnects) never surface here — the affected slot is closed and the
/// loop continues.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A TCP listener failed to bind to its address/port.
    #[error("Failed to bind TCP listener: {0}")]
    BindError(String),

    /// Setting up or driving the OS readiness poll failed.
    #[error("Failed to poll for readiness: {0}")]
    PollError(String),

    /// Registering a descriptor with the readiness poll failed.
    #[error("Failed to register descriptor: {0}")]
    RegistryError(String),

    /// The analyzer stream ended or could not be read.
    ///
    /// The analyzer is a required live producer; losing it leaves nothing
    /// to aggregate.
    #[error("Error on reading input stream: {0}")]
    InputError(String),

    /// Writing to stdout failed.
    #[error("Error on writing stdout: {0}")]
    StdoutError(String),

    /// The wall clock could not be read.
    #[error("Error on obtaining wall clock: {0}")]
    ClockError(#[from] std::time::SystemTimeError),

    /// An invariant violation bubbled up from the message store.
    #[error("Message store error: {0}")]
    StoreError(#[from] StoreError),
}

/// High-level errors returned by the `n2kd` binary.
///
/// Used at the entry point for formatting user-facing error messages and
/// wrapping lower-level failures.
#[derive(Error, Debug)]
pub enum CliError {
    /// General wrapper around any textual failure.
    #[error("n2kd failed with error: {0}")]
    GeneralError(String),
}

impl From<ServerError> for CliError {
    fn from(err: ServerError) -> Self {
        CliError::GeneralError(err.to_string())
    }
}
