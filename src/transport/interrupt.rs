//! # Interrupt Dispatch
//!
//! Routes raw interrupt signals to per-pipe deferred handlers and to the
//! firmware-error path. The interrupt-context entry points
//! ([`Dispatcher::handle_msi`], [`Dispatcher::handle_line_interrupt`]) never
//! block; the actual completion draining runs on a dedicated worker thread,
//! the moral equivalent of the bottom halves this design replaces.
//!
//! In message-signaled mode every vector is statically bound to one cause:
//! vector 0 is reserved for firmware errors, vectors 1..=N map to pipes. In
//! legacy line mode a shared line forces a disambiguation step against the
//! cause register before acting.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use super::channel::ChannelError;
use super::constants::{fw_indicator, intr, reg, CHANNEL_COUNT_MAX, RX_POST_RETRY_INTERVAL};
use super::pipes::{Pipe, PipeId};
use super::timer::OneshotTimer;
use super::Shared;

/// One cause signal on its way to the deferred worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IrqEvent {
    /// Completions are pending on a pipe.
    Pipe(PipeId),
    /// The firmware signalled a fatal error.
    FirmwareError,
    /// The receive-replenish retry timer fired.
    RxRetry,
    /// Stop the worker.
    Shutdown,
}

/// Map an MSI vector to its statically assigned cause.
fn decode_msi(vector: u32, granted: u32) -> Option<IrqEvent> {
    if vector >= granted {
        return None;
    }

    if vector == intr::MSI_VEC_FIRMWARE {
        return Some(IrqEvent::FirmwareError);
    }

    let channel = vector - intr::MSI_VEC_CHANNEL_BASE;
    if channel < CHANNEL_COUNT_MAX as u32 {
        Some(IrqEvent::Pipe(PipeId(channel as u8)))
    } else {
        None
    }
}

/// The deferred interrupt worker plus its feed queue.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    tx: Sender<IrqEvent>,
    worker: Option<JoinHandle<()>>,
    rx_retry: Arc<OneshotTimer>,
    /// Number of granted MSI vectors; 0 selects legacy line mode.
    msi_vectors: u32,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, msi_vectors: u32) -> Self {
        let (tx, rx) = mpsc::channel();

        let rx_retry = {
            let tx = tx.clone();
            Arc::new(OneshotTimer::new("rx-post-retry", move || {
                // The worker may already be gone during shutdown.
                let _ = tx.send(IrqEvent::RxRetry);
            }))
        };

        let worker = {
            let shared = Arc::clone(&shared);
            let rx_retry = Arc::clone(&rx_retry);
            thread::Builder::new()
                .name("irq-dispatch".to_owned())
                .spawn(move || {
                    while let Ok(event) = rx.recv() {
                        match event {
                            IrqEvent::Shutdown => break,
                            IrqEvent::Pipe(id) => service_pipe(&shared, id, &rx_retry),
                            IrqEvent::FirmwareError => firmware_fault(&shared),
                            IrqEvent::RxRetry => retry_rx_posts(&shared, &rx_retry),
                        }
                    }
                })
                .expect("failed to spawn dispatch thread")
        };

        Self {
            shared,
            tx,
            worker: Some(worker),
            rx_retry,
            msi_vectors,
        }
    }

    /// Entry point for one message-signaled interrupt. Non-blocking.
    pub(crate) fn handle_msi(&self, vector: u32) {
        match decode_msi(vector, self.msi_vectors) {
            Some(event) => {
                let _ = self.tx.send(event);
            }
            None => warn!(vector, granted = self.msi_vectors, "unassigned MSI vector"),
        }
    }

    /// Entry point for the shared legacy line. Returns true if this device
    /// raised the interrupt. Non-blocking.
    ///
    /// A device that raised the line is awake, so failing to take a
    /// non-blocking wake reference classifies the signal as shared-line
    /// noise without touching any register.
    pub(crate) fn handle_line_interrupt(&self) -> bool {
        let Some(_wake) = self.shared.power.wake_if_awake() else {
            return false;
        };

        let cause = self.shared.regs.read32(reg::INTR_CAUSE);
        let relevant = cause & (intr::CHANNEL_MASK_ALL | intr::FIRMWARE_MASK);
        if relevant == 0 {
            return false;
        }

        self.shared.regs.write32(reg::INTR_CLEAR, relevant);

        if relevant & intr::FIRMWARE_MASK != 0 {
            let _ = self.tx.send(IrqEvent::FirmwareError);
        }
        for channel in 0..CHANNEL_COUNT_MAX as u8 {
            if relevant & intr::channel_mask(channel) != 0 {
                let _ = self.tx.send(IrqEvent::Pipe(PipeId(channel)));
            }
        }

        true
    }

    /// Arm the receive-replenish retry from outside the worker (used when
    /// initial buffer provisioning hits a transient failure).
    pub(crate) fn arm_rx_retry(&self) {
        self.rx_retry.arm(RX_POST_RETRY_INTERVAL);
    }

    /// Stop the worker and wait for it. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(IrqEvent::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Top up a pipe's posted receive buffers.
///
/// Returns `Err(ChannelError::Exhausted)` when the deficit could not be
/// cleared and a retry is warranted.
pub(crate) fn replenish_rx(pipe: &Pipe) -> Result<(), ChannelError> {
    while pipe.rx_deficit() > 0 {
        match pipe.channel().post_recv(pipe.buf_size()) {
            Ok(()) => pipe.rx_reposted(),
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Drain one pipe's completions and replenish its receive side.
fn service_pipe(shared: &Shared, id: PipeId, rx_retry: &OneshotTimer) {
    // Clone the routing table out so no registry-adjacent lock is held
    // while upcalls run.
    let Some(routing) = shared.routing.lock().unwrap().clone() else {
        warn!(%id, "completion signal before configuration, dropped");
        return;
    };

    if routing.diag_pipe == id {
        // The diagnostic path polls its own completions synchronously.
        trace!(%id, "completion signal on diagnostic pipe ignored");
        return;
    }

    let Some(pipe) = shared.registry.get(id) else {
        warn!(%id, "completion signal for unallocated pipe, dropped");
        return;
    };

    while let Some(completion) = pipe.channel().complete_send() {
        pipe.return_send_credit();
        trace!(%id, bytes = completion.bytes, "send completed");
        if let Some(service) = routing.service_for_out_pipe(id) {
            shared.sink.send_complete(service);
        }
    }

    while let Some(recv) = pipe.channel().complete_recv() {
        pipe.recv_delivered();
        match routing.service_for_in_pipe(id) {
            Some(service) => shared.sink.frame_received(service, recv.frame),
            None => warn!(%id, "inbound frame on unrouted pipe, dropped"),
        }
    }

    if let Err(err) = replenish_rx(&pipe) {
        debug!(%id, %err, "receive replenish failed, retry armed");
        rx_retry.arm(RX_POST_RETRY_INTERVAL);
    }
}

/// Retry receive-buffer provisioning on every pipe that still owes buffers.
fn retry_rx_posts(shared: &Shared, rx_retry: &OneshotTimer) {
    let mut failed = false;
    for pipe in shared.registry.pipes() {
        if pipe.direction().has_in() && replenish_rx(&pipe).is_err() {
            failed = true;
        }
    }

    if failed {
        rx_retry.arm(RX_POST_RETRY_INTERVAL);
    }
}

/// Handle a firmware-fatal signal: acknowledge the indicator if the device
/// is reachable and surface the failure upward. Never retried locally; the
/// owning system decides about a full reset.
fn firmware_fault(shared: &Shared) {
    if let Some(_wake) = shared.power.wake_if_awake() {
        let indicator = shared.regs.read32(reg::FW_INDICATOR);
        if indicator & fw_indicator::EVENT_PENDING != 0 {
            shared
                .regs
                .write32(reg::FW_INDICATOR, indicator & !fw_indicator::EVENT_PENDING);
        }
    }

    warn!("firmware signalled a fatal error");
    shared.sink.firmware_fault();
}
