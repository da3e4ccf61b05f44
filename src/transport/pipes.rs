//! # Pipe Registry
//!
//! Fixed-capacity collection of pipe descriptors, one per DMA channel. A
//! pipe's direction and buffer size are fixed at configuration time and
//! never change; pipe numbers are unique within the registry.
//!
//! Locking discipline: the registry-wide lock protects only slot
//! insert/remove/lookup and is held O(1). Steady-state counter updates take
//! only the per-pipe lock, which is also O(1) and safe from
//! interrupt-deferred context.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::channel::DmaChannelRef;
use super::constants::CHANNEL_COUNT_MAX;
use super::wire::PipeDir;

/// Index of a pipe within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipeId(pub u8);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe {}", self.0)
    }
}

/// The per-pipe counters protected by the pipe lock.
///
/// All arithmetic is clamped to `0..=entry_count` so that spurious or
/// repeated completion signals can never drive a counter negative or past
/// the ring size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeCounters {
    /// Outstanding-send permits still available.
    pub send_credits: u32,
    /// Receive buffers currently posted to the device.
    pub completions_free: u32,
    /// Receive buffers consumed but not yet replenished.
    pub rx_deficit: u32,
}

/// One entry of the pipe registry, wrapping an opaque DMA channel.
#[derive(Debug)]
pub struct Pipe {
    id: PipeId,
    direction: PipeDir,
    entry_count: u32,
    buf_size: usize,
    channel: DmaChannelRef,
    counters: Mutex<PipeCounters>,
}

impl Pipe {
    /// Wrap a freshly opened channel.
    #[must_use]
    pub fn new(
        id: PipeId,
        direction: PipeDir,
        entry_count: u32,
        buf_size: usize,
        channel: DmaChannelRef,
    ) -> Self {
        let send_credits = if direction.has_out() { entry_count } else { 0 };

        Self {
            id,
            direction,
            entry_count,
            buf_size,
            channel,
            counters: Mutex::new(PipeCounters {
                send_credits,
                completions_free: 0,
                rx_deficit: 0,
            }),
        }
    }

    /// The pipe's registry index.
    #[must_use]
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// The pipe's fixed direction.
    #[must_use]
    pub fn direction(&self) -> PipeDir {
        self.direction
    }

    /// Number of descriptor entries in the channel.
    #[must_use]
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Per-buffer size in bytes.
    #[must_use]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// The underlying channel handle.
    #[must_use]
    pub fn channel(&self) -> &DmaChannelRef {
        &self.channel
    }

    /// Consume one send permit. Returns false if none is available.
    #[must_use]
    pub fn take_send_credit(&self) -> bool {
        let mut counters = self.counters.lock().unwrap();
        if counters.send_credits == 0 {
            return false;
        }
        counters.send_credits -= 1;
        true
    }

    /// Return a send permit after a send completion.
    pub fn return_send_credit(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.send_credits = (counters.send_credits + 1).min(self.entry_count);
    }

    /// Record that a posted receive buffer completed and was handed upward.
    pub fn recv_delivered(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.completions_free = counters.completions_free.saturating_sub(1);
        counters.rx_deficit = (counters.rx_deficit + 1).min(self.entry_count);
    }

    /// Mark the whole ring as owed to the device, ahead of the initial
    /// receive-buffer provisioning at configure time.
    pub fn prime_rx(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.rx_deficit = self.entry_count;
        counters.completions_free = 0;
    }

    /// Record one successfully replenished receive buffer.
    pub fn rx_reposted(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.rx_deficit = counters.rx_deficit.saturating_sub(1);
        counters.completions_free = (counters.completions_free + 1).min(self.entry_count);
    }

    /// Number of receive buffers still owed to the device.
    #[must_use]
    pub fn rx_deficit(&self) -> u32 {
        self.counters.lock().unwrap().rx_deficit
    }

    /// A copy of the counters, for inspection.
    #[must_use]
    pub fn counters(&self) -> PipeCounters {
        *self.counters.lock().unwrap()
    }
}

/// The fixed-capacity pipe collection of one transport instance.
#[derive(Debug)]
pub struct PipeRegistry {
    slots: Mutex<Vec<Option<Arc<Pipe>>>>,
}

impl PipeRegistry {
    /// Create an empty registry with [`CHANNEL_COUNT_MAX`] slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![None; CHANNEL_COUNT_MAX]),
        }
    }

    /// Insert a pipe into its slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already occupied; configuration validates pipe
    /// numbers before any insert, so an occupied slot is a logic error.
    pub fn insert(&self, pipe: Arc<Pipe>) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[pipe.id().0 as usize];
        assert!(slot.is_none(), "{} allocated twice", pipe.id());
        *slot = Some(pipe);
    }

    /// Look up a pipe by index.
    #[must_use]
    pub fn get(&self, id: PipeId) -> Option<Arc<Pipe>> {
        let slots = self.slots.lock().unwrap();
        slots.get(id.0 as usize).and_then(Clone::clone)
    }

    /// A snapshot of all allocated pipes.
    #[must_use]
    pub fn pipes(&self) -> Vec<Arc<Pipe>> {
        let slots = self.slots.lock().unwrap();
        slots.iter().flatten().cloned().collect()
    }

    /// True if no pipe is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let slots = self.slots.lock().unwrap();
        slots.iter().all(Option::is_none)
    }

    /// Release every allocated channel.
    ///
    /// Outstanding completions are drained before the channel handle is
    /// flushed, so no in-flight transfer is dropped on the floor. Safe to
    /// call after a partial configuration failure (it releases exactly what
    /// was allocated) and safe to call twice.
    pub fn teardown(&self) {
        let pipes: Vec<Arc<Pipe>> = {
            let mut slots = self.slots.lock().unwrap();
            slots.iter_mut().filter_map(Option::take).collect()
        };

        for pipe in pipes {
            while pipe.channel().complete_send().is_some() {}
            while pipe.channel().complete_recv().is_some() {}
            pipe.channel().flush();
            debug!("{} torn down", pipe.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::{ChannelError, DmaChannel, RecvCompletion, SendCompletion};

    #[derive(Debug)]
    struct NullChannel;

    impl DmaChannel for NullChannel {
        fn send(&self, _frame: Vec<u8>) -> Result<(), ChannelError> {
            Ok(())
        }

        fn post_recv(&self, _capacity: usize) -> Result<(), ChannelError> {
            Ok(())
        }

        fn complete_send(&self) -> Option<SendCompletion> {
            None
        }

        fn complete_recv(&self) -> Option<RecvCompletion> {
            None
        }

        fn flush(&self) {}
    }

    fn test_pipe(direction: PipeDir, entries: u32) -> Pipe {
        Pipe::new(PipeId(4), direction, entries, 256, Arc::new(NullChannel))
    }

    #[test]
    fn send_credits_start_at_entry_count_for_out_pipes() {
        let pipe = test_pipe(PipeDir::Out, 4);
        assert_eq!(pipe.counters().send_credits, 4);

        let pipe = test_pipe(PipeDir::In, 4);
        assert_eq!(pipe.counters().send_credits, 0);
        assert!(!pipe.take_send_credit());
    }

    #[test]
    fn send_credits_never_exceed_entry_count() {
        let pipe = test_pipe(PipeDir::Out, 2);

        // Spurious completions must not mint extra credits.
        for _ in 0..10 {
            pipe.return_send_credit();
        }
        assert_eq!(pipe.counters().send_credits, 2);

        assert!(pipe.take_send_credit());
        assert!(pipe.take_send_credit());
        assert!(!pipe.take_send_credit());
    }

    #[test]
    fn recv_counters_clamp_at_zero() {
        let pipe = test_pipe(PipeDir::In, 3);

        // No buffers posted yet; deliveries must not underflow.
        for _ in 0..5 {
            pipe.recv_delivered();
        }
        let counters = pipe.counters();
        assert_eq!(counters.completions_free, 0);
        assert_eq!(counters.rx_deficit, 3);

        for _ in 0..10 {
            pipe.rx_reposted();
        }
        let counters = pipe.counters();
        assert_eq!(counters.rx_deficit, 0);
        assert_eq!(counters.completions_free, 3);
    }

    #[test]
    fn registry_slots_and_teardown() {
        let registry = PipeRegistry::new();
        assert!(registry.is_empty());

        registry.insert(Arc::new(test_pipe(PipeDir::Out, 4)));
        assert!(registry.get(PipeId(4)).is_some());
        assert!(registry.get(PipeId(5)).is_none());
        assert_eq!(registry.pipes().len(), 1);

        registry.teardown();
        assert!(registry.is_empty());
        // Idempotent.
        registry.teardown();
    }

    #[test]
    #[should_panic(expected = "allocated twice")]
    fn double_insert_panics() {
        let registry = PipeRegistry::new();
        registry.insert(Arc::new(test_pipe(PipeDir::Out, 4)));
        registry.insert(Arc::new(test_pipe(PipeDir::Out, 4)));
    }
}
