//! # Transport Constants
//!
//! This module collects the hardware/firmware contract constants of the
//! transport: channel capacity, diagnostic transfer limits, power-state
//! timing, and the register map shared with the device.

use std::time::Duration;

/// The maximum number of DMA channels supported by this hardware generation.
///
/// The pipe registry is sized to this and pipe numbers above it are invalid.
pub const CHANNEL_COUNT_MAX: usize = 8;

/// Maximum number of bytes one diagnostic transfer can move atomically.
///
/// Larger requests are segmented into chunks of this size. This is a
/// hardware/firmware contract, not a tunable.
pub const DIAG_TRANSFER_LIMIT: usize = 2048;

/// Upper bound for one diagnostic chunk to complete on both the send and the
/// receive side.
pub const DIAG_ACCESS_TIMEOUT: Duration = Duration::from_millis(10);

/// Worst-case bound for the device to acknowledge a wake request.
pub const WAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the wake acknowledgment.
pub const WAKE_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Delay between the last wake-reference release and the actual sleep
/// indication.
///
/// Toggling the power register round-trips several milliseconds, so bursty
/// traffic must not pay that cost on every acquire/release pair. The device
/// is also known to misbehave when the wake register is poked too frequently,
/// so this value is conservative. Adjust with great care.
pub const SLEEP_GRACE_PERIOD: Duration = Duration::from_millis(60);

/// Interval at which failed receive-buffer replenishment is retried.
pub const RX_POST_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Poll interval while waiting for diagnostic completions.
pub const DIAG_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Offsets of the control registers this component touches, relative to the
/// start of the register window.
pub mod reg {
    /// Current power state of the device. See [`super::rtc_state`].
    pub const RTC_STATE: u32 = 0x0000;

    /// Stay-awake request register. See [`super::soc_wake`].
    pub const SOC_WAKE: u32 = 0x0004;

    /// Pending interrupt causes, one bit per channel plus the firmware bit.
    pub const INTR_CAUSE: u32 = 0x000c;

    /// Write-one-clear acknowledgment register for [`INTR_CAUSE`].
    pub const INTR_CLEAR: u32 = 0x0010;

    /// Firmware state indication; the event-pending bit signals a firmware
    /// fault condition.
    pub const FW_INDICATOR: u32 = 0x0014;
}

/// Field values of the [`super::reg::RTC_STATE`] register.
pub mod rtc_state {
    /// Mask of the power-state field.
    pub const V_MASK: u32 = 0x7;

    /// The device is fully awake and registers are accessible.
    pub const ON: u32 = 0x3;
}

/// Field values of the [`super::reg::SOC_WAKE`] register.
pub mod soc_wake {
    /// Request the device to stay awake.
    pub const V_ASSERT: u32 = 0x1;

    /// Allow the device to sleep.
    pub const V_RESET: u32 = 0x0;
}

/// Interrupt cause assignment in [`super::reg::INTR_CAUSE`] and the MSI
/// vector map.
pub mod intr {
    use super::CHANNEL_COUNT_MAX;

    /// Cause bit signalling a firmware fault.
    pub const FIRMWARE_MASK: u32 = 0x0000_0400;

    /// Mask covering all per-channel completion cause bits (bit n = channel n).
    pub const CHANNEL_MASK_ALL: u32 = (1 << CHANNEL_COUNT_MAX) - 1;

    /// MSI vector reserved for firmware faults.
    pub const MSI_VEC_FIRMWARE: u32 = 0;

    /// First MSI vector assigned to a channel; vector `BASE + n` maps to
    /// channel `n`.
    pub const MSI_VEC_CHANNEL_BASE: u32 = 1;

    /// Cause bit for a single channel.
    #[must_use]
    pub const fn channel_mask(channel: u8) -> u32 {
        1 << channel
    }
}

/// Bits of the [`super::reg::FW_INDICATOR`] register.
pub mod fw_indicator {
    /// The firmware has raised an event that requires host attention; in the
    /// context of this transport that is a fatal firmware condition.
    pub const EVENT_PENDING: u32 = 0x1;
}
