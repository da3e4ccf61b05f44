//! # Diagnostic Access
//!
//! Synchronous register/memory access to the device over the designated
//! diagnostic pipe, used before the asynchronous data path is operational
//! (firmware bring-up, post-mortem). Requests are segmented into chunks of
//! at most [`DIAG_TRANSFER_LIMIT`] bytes; each chunk blocks the caller until
//! both the send and the receive side complete or a bounded timeout elapses.
//!
//! There is no retry policy here. Partial diagnostic writes to device memory
//! are not safely resumable, so a failed chunk aborts the whole transfer and
//! the caller retries the entire operation if it wants resilience.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

use super::channel::ChannelError;
use super::constants::{DIAG_ACCESS_TIMEOUT, DIAG_POLL_INTERVAL, DIAG_TRANSFER_LIMIT};
use super::pipes::Pipe;
use super::power::{PowerController, PowerError};
use super::wire::{DiagHeader, DiagOp};

/// Errors of the diagnostic access path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiagError {
    /// The device did not complete a chunk within the access timeout.
    #[error("diagnostic transfer timed out")]
    Timeout,

    /// A read returned fewer or more bytes than requested.
    #[error("diagnostic response length {actual} does not match requested {expected}")]
    ShortResponse {
        /// Bytes requested.
        expected: usize,
        /// Bytes returned.
        actual: usize,
    },

    /// The device returned a frame that does not parse as a response to the
    /// outstanding request.
    #[error("malformed diagnostic response")]
    Malformed,

    /// The configuration exchange has not run yet, so there is no
    /// diagnostic pipe to talk over.
    #[error("transport is not configured")]
    NotConfigured,

    /// Waking the device failed.
    #[error("waking the device for diagnostic access failed")]
    Power(#[from] PowerError),

    /// The diagnostic channel rejected a submission.
    #[error("diagnostic channel error")]
    Channel(#[from] ChannelError),
}

/// Completion state of one in-flight diagnostic transfer.
///
/// Ephemeral: created per chunk, discarded when the chunk completes or times
/// out, never shared across calls.
#[derive(Debug, Default)]
struct DiagXfer {
    wait_for_resp: bool,
    resp_len: u32,
    tx_done: bool,
    rx_done: bool,
}

/// The synchronous request/response helper bound to the diagnostic pipe.
#[derive(Debug)]
pub struct DiagLink {
    pipe: Arc<Pipe>,
    power: Arc<PowerController>,
    timeout: Duration,
}

impl DiagLink {
    /// Bind the helper to the designated diagnostic pipe.
    #[must_use]
    pub fn new(pipe: Arc<Pipe>, power: Arc<PowerController>) -> Self {
        Self::with_timeout(pipe, power, DIAG_ACCESS_TIMEOUT)
    }

    /// Bind with an explicit per-chunk timeout. Tests use this to keep the
    /// unresponsive-device case fast.
    #[must_use]
    pub fn with_timeout(
        pipe: Arc<Pipe>,
        power: Arc<PowerController>,
        timeout: Duration,
    ) -> Self {
        Self {
            pipe,
            power,
            timeout,
        }
    }

    /// Read `length` bytes of device memory starting at `address`.
    pub fn read(&self, address: u32, length: usize) -> Result<Vec<u8>, DiagError> {
        let mut out = Vec::with_capacity(length);
        let mut addr = address;
        let mut remaining = length;

        while remaining > 0 {
            let chunk = remaining.min(DIAG_TRANSFER_LIMIT);
            let header = DiagHeader {
                op: DiagOp::Read,
                address: addr,
                length: chunk as u32,
            };

            let payload = self.exchange(header, &[])?;
            if payload.len() != chunk {
                return Err(DiagError::ShortResponse {
                    expected: chunk,
                    actual: payload.len(),
                });
            }

            out.extend_from_slice(&payload);
            addr += chunk as u32;
            remaining -= chunk;
        }

        Ok(out)
    }

    /// Write `bytes` into device memory starting at `address`.
    pub fn write(&self, address: u32, bytes: &[u8]) -> Result<(), DiagError> {
        let mut addr = address;

        for chunk in bytes.chunks(DIAG_TRANSFER_LIMIT) {
            let header = DiagHeader {
                op: DiagOp::Write,
                address: addr,
                length: chunk.len() as u32,
            };

            self.exchange(header, chunk)?;
            addr += chunk.len() as u32;
        }

        Ok(())
    }

    /// Run one bounded request/response exchange on the diagnostic pipe.
    ///
    /// Returns the response payload (empty for write acknowledgments).
    fn exchange(&self, header: DiagHeader, payload: &[u8]) -> Result<Vec<u8>, DiagError> {
        let _wake = self.power.wake()?;

        let channel = self.pipe.channel();
        channel.post_recv(self.pipe.buf_size())?;

        let mut frame = Vec::with_capacity(DiagHeader::WIRE_SIZE + payload.len());
        header.serialize(&mut frame);
        frame.extend_from_slice(payload);
        channel.send(frame)?;

        let mut xfer = DiagXfer {
            wait_for_resp: header.op == DiagOp::Read,
            ..DiagXfer::default()
        };
        let mut response = Vec::new();
        let deadline = Instant::now() + self.timeout;

        loop {
            if !xfer.tx_done && channel.complete_send().is_some() {
                xfer.tx_done = true;
            }

            if !xfer.rx_done {
                if let Some(recv) = channel.complete_recv() {
                    let echo = DiagHeader::deserialize(&recv.frame)
                        .map_err(|_| DiagError::Malformed)?;
                    if echo.op != header.op || echo.address != header.address {
                        return Err(DiagError::Malformed);
                    }

                    response = recv.frame[DiagHeader::WIRE_SIZE..].to_vec();
                    xfer.resp_len = response.len() as u32;
                    xfer.rx_done = true;
                }
            }

            if xfer.tx_done && xfer.rx_done {
                break;
            }

            if Instant::now() >= deadline {
                return Err(DiagError::Timeout);
            }

            thread::sleep(DIAG_POLL_INTERVAL);
        }

        trace!(
            op = ?header.op,
            address = header.address,
            resp_len = xfer.resp_len,
            "diagnostic exchange complete"
        );

        if !xfer.wait_for_resp && !response.is_empty() {
            return Err(DiagError::Malformed);
        }

        Ok(response)
    }
}
