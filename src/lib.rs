//! # wlanpipe
//!
//! Host-side PCIe transport control plane for a wireless network adapter:
//! pipe configuration shared with device firmware, synchronous diagnostic
//! access, power-state arbitration and interrupt dispatch. See
//! [`transport`] for the entry point.

pub mod transport;
