//! # Register Window
//!
//! This module exposes the [`RegisterWindow`] trait, the transport's view of
//! the device's memory-mapped control registers. Mapping and unmapping the
//! window is the job of the device bring-up collaborator; the transport only
//! uses it.
//!
//! Every access requires the caller to hold a wake reference (see
//! [`crate::transport::power`]). Touching registers while the device sleeps
//! risks undefined device behavior, up to the device scribbling over host
//! memory.

use std::fmt::Debug;
use std::sync::Arc;

/// Byte-addressed 32-bit access to the mapped register region.
///
/// Registers are independently addressed per pipe, so concurrent accesses
/// from different pipes need no ordering between each other; the only
/// precondition is a held wake reference.
pub trait RegisterWindow: Debug + Send + Sync + 'static {
    /// Read a 32-bit register at `offset` bytes into the window.
    fn read32(&self, offset: u32) -> u32;

    /// Write a 32-bit register at `offset` bytes into the window.
    fn write32(&self, offset: u32, value: u32);
}

/// A reference-counted reference to a register window.
pub type RegisterWindowRef = Arc<dyn RegisterWindow>;
