mod cli;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::Cli;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use wlanpipe::transport::config::{default_policy, DeviceInfoBlock};
use wlanpipe::transport::constants::intr::MSI_VEC_CHANNEL_BASE;
use wlanpipe::transport::events::DummyEventSink;
use wlanpipe::transport::mockdev::MockDevice;
use wlanpipe::transport::pipes::PipeId;
use wlanpipe::transport::wire::service;
use wlanpipe::transport::Transport;

const DIAG_SCRATCH_ADDR: u32 = 0x0001_0000;

const INFO: DeviceInfoBlock = DeviceInfoBlock {
    pipe_cfg_addr: 0x8000,
    svc_to_pipe_addr: 0x9000,
};

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    let device = MockDevice::new();
    let mut transport = Transport::new(
        device.clone(),
        device.clone(),
        args.msi_vectors,
        Arc::new(DummyEventSink::new()),
    );

    transport
        .configure(default_policy(), INFO)
        .context("Configuration exchange failed")?;
    info!("Transport configured, wire tables published");

    let pattern: Vec<u8> = (0..args.diag_bytes).map(|v| (v * 13) as u8).collect();
    transport
        .diag_write(DIAG_SCRATCH_ADDR, &pattern)
        .context("Diagnostic write failed")?;
    let readback = transport
        .diag_read(DIAG_SCRATCH_ADDR, pattern.len())
        .context("Diagnostic read failed")?;
    if readback != pattern {
        bail!("Diagnostic round-trip of {} bytes did not verify", pattern.len());
    }
    info!(bytes = pattern.len(), "Diagnostic round-trip verified");

    transport
        .send(service::DATA, vec![0xab; 64])
        .context("Data-path send failed")?;
    if args.msi_vectors > 0 {
        transport.handle_msi(MSI_VEC_CHANNEL_BASE + 4);
    } else {
        let claimed = transport.handle_line_interrupt();
        info!(claimed, "legacy line interrupt handled");
    }

    // Give the dispatch worker a moment to drain the completion.
    thread::sleep(Duration::from_millis(20));

    for pipe in 0..8 {
        if let Some(counters) = transport.pipe_counters(PipeId(pipe)) {
            info!(
                pipe,
                send_credits = counters.send_credits,
                posted_rx = counters.completions_free,
                rx_deficit = counters.rx_deficit,
                "pipe state"
            );
        }
    }

    transport.shutdown();
    info!("Transport shut down");

    Ok(())
}
