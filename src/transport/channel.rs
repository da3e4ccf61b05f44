//! # DMA Channel Abstraction
//!
//! This module contains the seam between the transport and the Copy Engine
//! descriptor-ring layer. The transport treats each channel as an opaque
//! queue pair with send/receive/completion operations; ring mechanics
//! (enqueue, dequeue, wraparound) live behind [`DmaChannel`].

use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

use super::wire::PipeDir;
use super::pipes::PipeId;

/// Errors reported by the channel layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel has no room for another descriptor right now.
    ///
    /// This is transient; receive-buffer posts that fail this way are retried
    /// on a fixed interval.
    #[error("channel descriptor ring exhausted")]
    Exhausted,

    /// The channel is gone, e.g. because the device was torn down underneath
    /// us.
    #[error("channel closed")]
    Closed,
}

/// A completed outbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCompletion {
    /// Number of bytes the device consumed.
    pub bytes: usize,
}

/// A completed inbound buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvCompletion {
    /// The received frame.
    pub frame: Vec<u8>,
}

/// One DMA-backed queue pair between host and device firmware.
///
/// All operations are non-blocking: submissions either take effect
/// immediately or fail with [`ChannelError::Exhausted`], and completion
/// drains return `None` when nothing is pending. This is what allows the
/// interrupt-deferred handlers to use a channel without ever suspending.
pub trait DmaChannel: Debug + Send + Sync {
    /// Queue one outbound frame toward the device.
    fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Hand the device an empty receive buffer of the given capacity.
    fn post_recv(&self, capacity: usize) -> Result<(), ChannelError>;

    /// Take the next completed outbound transfer, if one is pending.
    fn complete_send(&self) -> Option<SendCompletion>;

    /// Take the next completed inbound buffer, if one is pending.
    fn complete_recv(&self) -> Option<RecvCompletion>;

    /// Abandon all in-flight transfers and release the channel's device-side
    /// resources. Called exactly once, at teardown.
    fn flush(&self);
}

/// A reference-counted reference to a DMA channel.
pub type DmaChannelRef = Arc<dyn DmaChannel>;

/// The collaborator that owns the descriptor-ring implementation and can
/// open channels on behalf of the transport.
pub trait ChannelFactory: Debug + Send + Sync {
    /// Open the channel for pipe `pipe` with the given fixed geometry.
    ///
    /// Direction, entry count and buffer size never change for the life of
    /// the channel.
    fn open(
        &self,
        pipe: PipeId,
        direction: PipeDir,
        entry_count: u32,
        buf_size: usize,
    ) -> Result<DmaChannelRef, ChannelError>;
}

/// A reference-counted reference to a channel factory.
pub type ChannelFactoryRef = Arc<dyn ChannelFactory>;
