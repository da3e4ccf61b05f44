//! # Command-Line Interface
//!
//! The binary is a small exercise harness: it brings a transport up against
//! the built-in mock device, publishes the default pipe policy and runs a
//! diagnostic round-trip plus one data-path send. Useful for eyeballing the
//! log output of the control plane without real hardware.

use clap::Parser;

/// Exercise the wireless transport control plane against a mock device.
#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Number of granted MSI vectors. Zero selects the legacy shared
    /// interrupt line instead.
    #[arg(long, default_value_t = 9)]
    pub msi_vectors: u32,

    /// Size in bytes of the diagnostic write/read round-trip the harness
    /// performs against device memory.
    #[arg(long, default_value_t = 5000)]
    pub diag_bytes: usize,
}
