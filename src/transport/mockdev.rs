//! # Software Device Model
//!
//! An in-memory model of the device side of the transport: a register window
//! with wake-handshake emulation, a channel factory whose channels execute
//! diagnostic frames against an internal device memory, and fault injection
//! hooks (a device that never acknowledges wake requests, an unresponsive
//! diagnostic engine, failing receive-buffer posts).
//!
//! The model backs the bring-up harness binary and the integration-style
//! tests; it stands in for the real Copy Engine and register collaborators,
//! never for their ring mechanics.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::channel::{
    ChannelError, ChannelFactory, DmaChannel, DmaChannelRef, RecvCompletion, SendCompletion,
};
use super::constants::{fw_indicator, intr, reg, rtc_state, soc_wake};
use super::pipes::PipeId;
use super::regs::RegisterWindow;
use super::wire::{DiagHeader, DiagOp, PipeDir};

/// Size of the modeled device memory.
const DEVICE_MEMORY_SIZE: usize = 1 << 20;

/// How the model reacts to a stay-awake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeBehavior {
    /// Acknowledge immediately: the wake write flips the power state to on.
    AckImmediately,
    /// Never acknowledge; wake requests time out.
    NeverAck,
}

#[derive(Debug)]
struct Shared {
    regs: Mutex<BTreeMap<u32, u32>>,
    write_log: Mutex<Vec<(u32, u32)>>,
    wake_behavior: Mutex<WakeBehavior>,
    diag_responsive: AtomicBool,
    fail_rx_posts: AtomicBool,
    fail_open_for: Mutex<Option<PipeId>>,
    memory: Mutex<Vec<u8>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    opened: AtomicUsize,
    flushed: AtomicUsize,
}

/// The software device model. One instance models one physical device.
#[derive(Debug)]
pub struct MockDevice {
    inner: Arc<Shared>,
}

impl MockDevice {
    /// Create a model that acknowledges wakes and answers diagnostics.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Shared {
                regs: Mutex::new(BTreeMap::new()),
                write_log: Mutex::new(Vec::new()),
                wake_behavior: Mutex::new(WakeBehavior::AckImmediately),
                diag_responsive: AtomicBool::new(true),
                fail_rx_posts: AtomicBool::new(false),
                fail_open_for: Mutex::new(None),
                memory: Mutex::new(vec![0; DEVICE_MEMORY_SIZE]),
                channels: Mutex::new(Vec::new()),
                opened: AtomicUsize::new(0),
                flushed: AtomicUsize::new(0),
            }),
        })
    }

    /// Change how wake requests are answered.
    pub fn set_wake_behavior(&self, behavior: WakeBehavior) {
        *self.inner.wake_behavior.lock().unwrap() = behavior;
    }

    /// Enable or disable responses on diagnostic channels. While disabled,
    /// diagnostic sends produce no completions at all.
    pub fn set_diag_responsive(&self, responsive: bool) {
        self.inner
            .diag_responsive
            .store(responsive, Ordering::SeqCst);
    }

    /// Make every receive-buffer post on a data-path channel fail with
    /// [`ChannelError::Exhausted`] until disabled again. Diagnostic
    /// (bidirectional) channels are unaffected.
    pub fn set_fail_rx_posts(&self, fail: bool) {
        self.inner.fail_rx_posts.store(fail, Ordering::SeqCst);
    }

    /// Make the next `open` of the given pipe fail.
    pub fn fail_open_for(&self, pipe: PipeId) {
        *self.inner.fail_open_for.lock().unwrap() = Some(pipe);
    }

    /// All register writes seen so far, in order.
    #[must_use]
    pub fn write_log(&self) -> Vec<(u32, u32)> {
        self.inner.write_log.lock().unwrap().clone()
    }

    /// Copy a range of device memory out of the model.
    #[must_use]
    pub fn read_device_memory(&self, addr: u32, len: usize) -> Vec<u8> {
        let memory = self.inner.memory.lock().unwrap();
        let start = (addr as usize).min(memory.len());
        let end = (start + len).min(memory.len());
        memory[start..end].to_vec()
    }

    /// Set a register from the device side, e.g. to raise interrupt causes.
    pub fn set_register(&self, offset: u32, value: u32) {
        self.inner.regs.lock().unwrap().insert(offset, value);
    }

    /// Raise completion cause bits for a pipe, as the hardware would before
    /// asserting the legacy line.
    pub fn raise_pipe_cause(&self, pipe: PipeId) {
        let mut regs = self.inner.regs.lock().unwrap();
        let cause = regs.entry(reg::INTR_CAUSE).or_insert(0);
        *cause |= intr::channel_mask(pipe.0);
    }

    /// Raise the firmware-fault cause and the event-pending indicator.
    pub fn raise_firmware_fault(&self) {
        let mut regs = self.inner.regs.lock().unwrap();
        *regs.entry(reg::INTR_CAUSE).or_insert(0) |= intr::FIRMWARE_MASK;
        *regs.entry(reg::FW_INDICATOR).or_insert(0) |= fw_indicator::EVENT_PENDING;
    }

    /// Deliver an inbound frame on a pipe, consuming one posted receive
    /// buffer. Returns false if the pipe has no buffer posted.
    #[must_use]
    pub fn inject_rx(&self, pipe: PipeId, frame: Vec<u8>) -> bool {
        let channels = self.inner.channels.lock().unwrap();
        let Some(channel) = channels.iter().find(|c| c.pipe == pipe) else {
            return false;
        };

        channel.deliver(frame)
    }

    /// Number of channels opened so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Number of channels flushed so far.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.inner.flushed.load(Ordering::SeqCst)
    }
}

impl RegisterWindow for MockDevice {
    fn read32(&self, offset: u32) -> u32 {
        *self.inner.regs.lock().unwrap().get(&offset).unwrap_or(&0)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.inner.write_log.lock().unwrap().push((offset, value));

        let mut regs = self.inner.regs.lock().unwrap();
        match offset {
            reg::SOC_WAKE => {
                regs.insert(offset, value);
                if value == soc_wake::V_ASSERT {
                    let behavior = *self.inner.wake_behavior.lock().unwrap();
                    if behavior == WakeBehavior::AckImmediately {
                        regs.insert(reg::RTC_STATE, rtc_state::ON);
                    }
                } else {
                    regs.insert(reg::RTC_STATE, 0);
                }
            }
            // Write-one-clear acknowledgment of interrupt causes.
            reg::INTR_CLEAR => {
                let cause = regs.entry(reg::INTR_CAUSE).or_insert(0);
                *cause &= !value;
            }
            _ => {
                regs.insert(offset, value);
            }
        }
    }
}

impl ChannelFactory for MockDevice {
    fn open(
        &self,
        pipe: PipeId,
        direction: PipeDir,
        _entry_count: u32,
        _buf_size: usize,
    ) -> Result<DmaChannelRef, ChannelError> {
        let mut fail_for = self.inner.fail_open_for.lock().unwrap();
        if *fail_for == Some(pipe) {
            *fail_for = None;
            return Err(ChannelError::Closed);
        }
        drop(fail_for);

        let channel = Arc::new(MockChannel {
            device: Arc::clone(&self.inner),
            pipe,
            direction,
            state: Mutex::new(ChannelState::default()),
        });

        self.inner.channels.lock().unwrap().push(Arc::clone(&channel));
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        trace!(%pipe, ?direction, "mock channel opened");

        Ok(channel)
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    rx_buffers: VecDeque<usize>,
    send_completions: VecDeque<SendCompletion>,
    recv_completions: VecDeque<RecvCompletion>,
    closed: bool,
}

/// One modeled DMA channel.
#[derive(Debug)]
pub struct MockChannel {
    device: Arc<Shared>,
    pipe: PipeId,
    direction: PipeDir,
    state: Mutex<ChannelState>,
}

impl MockChannel {
    fn deliver(&self, frame: Vec<u8>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }

        let Some(capacity) = state.rx_buffers.pop_front() else {
            return false;
        };

        let mut frame = frame;
        frame.truncate(capacity);
        state.recv_completions.push_back(RecvCompletion { frame });
        true
    }

    /// Execute a diagnostic request against the modeled device memory and
    /// return the response frame.
    fn execute_diag(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let header = DiagHeader::deserialize(frame).ok()?;
        let mut memory = self.device.memory.lock().unwrap();
        let addr = header.address as usize;
        let len = header.length as usize;

        let mut response = Vec::with_capacity(DiagHeader::WIRE_SIZE + len);
        header.serialize(&mut response);

        match header.op {
            DiagOp::Read => {
                let start = addr.min(memory.len());
                let end = (addr + len).min(memory.len());
                response.extend_from_slice(&memory[start..end]);
            }
            DiagOp::Write => {
                let payload = frame.get(DiagHeader::WIRE_SIZE..)?;
                let payload = payload.get(..len)?;
                let end = (addr + payload.len()).min(memory.len());
                if addr < end {
                    memory[addr..end].copy_from_slice(&payload[..end - addr]);
                }
            }
        }

        Some(response)
    }
}

impl DmaChannel for MockChannel {
    fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(ChannelError::Closed);
        }

        // Bidirectional channels are diagnostic channels in this model; an
        // unresponsive device swallows the request without any completion.
        if self.direction == PipeDir::InOut {
            if !self.device.diag_responsive.load(Ordering::SeqCst) {
                return Ok(());
            }

            let bytes = frame.len();
            if let Some(response) = self.execute_diag(&frame) {
                if let Some(capacity) = state.rx_buffers.pop_front() {
                    let mut response = response;
                    response.truncate(capacity);
                    state.recv_completions.push_back(RecvCompletion { frame: response });
                }
            }
            state.send_completions.push_back(SendCompletion { bytes });
            return Ok(());
        }

        state
            .send_completions
            .push_back(SendCompletion { bytes: frame.len() });
        Ok(())
    }

    fn post_recv(&self, capacity: usize) -> Result<(), ChannelError> {
        if self.direction != PipeDir::InOut && self.device.fail_rx_posts.load(Ordering::SeqCst) {
            return Err(ChannelError::Exhausted);
        }

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(ChannelError::Closed);
        }

        state.rx_buffers.push_back(capacity);
        Ok(())
    }

    fn complete_send(&self) -> Option<SendCompletion> {
        self.state.lock().unwrap().send_completions.pop_front()
    }

    fn complete_recv(&self) -> Option<RecvCompletion> {
        self.state.lock().unwrap().recv_completions.pop_front()
    }

    fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.rx_buffers.clear();
        state.send_completions.clear();
        state.recv_completions.clear();
        self.device.flushed.fetch_add(1, Ordering::SeqCst);
    }
}
