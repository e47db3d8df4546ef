//! # n2kd
//!
//! NMEA 2000 state aggregator and fan-out server.
//!
//! Reads analyzed NMEA 2000 JSON records from stdin, accumulates the
//! latest state per PGN, and serves TCP clients: one-shot JSON snapshots
//! and live JSON streams on the main port, NMEA 0183 clients on the next
//! port up.
//!
//! ## Command-line Options
//! - `-d`: debug log level.
//! - `-q`: error-only log level.
//! - `-o`: tee client input into the message handler (synthetic records).
//! - `-r`: discard client input instead of forwarding it to stdout.
//! - `-p <port>`: JSON port (NMEA 0183 on `port + 1`), default 2597.

use n2kd::defs::DEFAULT_PORT;
use n2kd::errors::CliError;
use n2kd::registry::OutputMode;
use n2kd::server::{Server, ServerConfig};
use structopt::StructOpt;

/// Command-line options for the aggregation daemon.
#[derive(Debug, StructOpt)]
#[structopt(name = "n2kd", about = "NMEA 2000 state aggregator and fan-out server")]
struct Opt {
    /// Log at debug level
    #[structopt(short = "d")]
    debug: bool,

    /// Log errors only
    #[structopt(short = "q")]
    quiet: bool,

    /// Feed client input into the message handler instead of stdout
    #[structopt(short = "o")]
    copy: bool,

    /// Discard client input
    #[structopt(short = "r")]
    sink: bool,

    /// JSON port; the NMEA 0183 server listens on the next port up
    #[structopt(short = "p", default_value = "2597")]
    port: u16,
}

/// Initializes the logger; `-d` and `-q` override the default info level.
fn init_logger(opt: &Opt) {
    let level = if opt.debug {
        log::LevelFilter::Debug
    } else if opt.quiet {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format_timestamp_micros();
    builder.format_module_path(false);
    builder.format_target(false);
    builder.init();
}

fn main() -> Result<(), CliError> {
    let opt = Opt::from_args();

    init_logger(&opt);

    let output_mode = if opt.copy {
        OutputMode::Copy
    } else if opt.sink {
        OutputMode::Sink
    } else {
        OutputMode::Stream
    };

    if opt.port != DEFAULT_PORT {
        log::debug!("Using JSON port {} instead of {}", opt.port, DEFAULT_PORT);
    }

    log::info!("Starting n2kd");

    let mut server = Server::new(ServerConfig {
        port: opt.port,
        output_mode,
    })?;

    // Unreachable in normal operation: losing the analyzer stream is fatal.
    server.run()?;
    Ok(())
}
