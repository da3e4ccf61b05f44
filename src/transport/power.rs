//! # Power-State Controller
//!
//! The device has a powersave-oriented register: while it is considered
//! asleep it drains less power and the host is forbidden from accessing most
//! of the register window. Accessing registers anyway can make the device
//! scribble over host memory or return garbage readouts.
//!
//! [`PowerController`] arbitrates this with a wake reference count. The
//! first reference pokes the stay-awake register and waits for the device to
//! acknowledge; further references are free. When the last reference goes
//! away the device is not put to sleep immediately: waking up round-trips
//! several milliseconds, so bursty traffic gets a grace period during which a
//! new reference cancels the pending sleep.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::constants::{
    reg, rtc_state, soc_wake, SLEEP_GRACE_PERIOD, WAKE_POLL_INTERVAL, WAKE_TIMEOUT,
};
use super::regs::RegisterWindowRef;
use super::timer::OneshotTimer;

/// Errors of the power-state controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PowerError {
    /// The device did not acknowledge the wake request within the bound.
    ///
    /// The controller is left Asleep; the caller must not assume any
    /// register is readable.
    #[error("device did not acknowledge wake request in time")]
    WakeTimeout,
}

#[derive(Debug)]
struct PsState {
    /// Cached awake flag. Registers communicate the real state, but with
    /// intensive traffic re-reading the powersave register would needlessly
    /// stall callers, so it is only touched on actual state changes.
    awake: bool,
    wake_refs: u64,
}

#[derive(Debug)]
struct PsShared {
    regs: RegisterWindowRef,
    /// Protects the awake flag and the wake reference count. Taken from
    /// ordinary call paths, interrupt-deferred context and the grace timer
    /// alike; never held across a blocking call except the wake poll itself,
    /// which deliberately serializes concurrent wakers.
    state: Mutex<PsState>,
}

/// Reference-counted wake/sleep arbitrator gating all register access.
#[derive(Debug)]
pub struct PowerController {
    shared: Arc<PsShared>,
    grace_timer: OneshotTimer,
    wake_timeout: Duration,
    grace_period: Duration,
}

impl PowerController {
    /// Create a controller for the given register window. The device starts
    /// out asleep.
    #[must_use]
    pub fn new(regs: RegisterWindowRef) -> Self {
        Self::with_timing(regs, WAKE_TIMEOUT, SLEEP_GRACE_PERIOD)
    }

    /// Create a controller with explicit wake-timeout and grace-period
    /// bounds. Production code uses the hardware defaults via
    /// [`PowerController::new`]; tests inject shorter ones.
    #[must_use]
    pub fn with_timing(
        regs: RegisterWindowRef,
        wake_timeout: Duration,
        grace_period: Duration,
    ) -> Self {
        let shared = Arc::new(PsShared {
            regs,
            state: Mutex::new(PsState {
                awake: false,
                wake_refs: 0,
            }),
        });

        let grace_timer = {
            let shared = Arc::clone(&shared);
            OneshotTimer::new("ps-sleep-timer", move || {
                let mut state = shared.state.lock().unwrap();
                // An acquire may have slipped in between expiry and this
                // callback; the reference count decides.
                if state.wake_refs == 0 && state.awake {
                    shared.regs.write32(reg::SOC_WAKE, soc_wake::V_RESET);
                    state.awake = false;
                    debug!("grace period elapsed, device put to sleep");
                }
            })
        };

        Self {
            shared,
            grace_timer,
            wake_timeout,
            grace_period,
        }
    }

    /// Take a wake reference, waking the device if necessary.
    ///
    /// If the device is asleep this blocks until it acknowledges, bounded by
    /// the wake timeout. Concurrent acquirers serialize on the state lock, so
    /// only the first one signals the device; the rest find it awake and
    /// return immediately.
    pub fn acquire_wake(&self) -> Result<(), PowerError> {
        let mut state = self.shared.state.lock().unwrap();

        state.wake_refs += 1;
        self.grace_timer.cancel();

        if state.awake {
            trace!(refs = state.wake_refs, "wake reference taken while awake");
            return Ok(());
        }

        self.shared.regs.write32(reg::SOC_WAKE, soc_wake::V_ASSERT);

        let deadline = Instant::now() + self.wake_timeout;
        loop {
            let rtc = self.shared.regs.read32(reg::RTC_STATE);
            if rtc & rtc_state::V_MASK == rtc_state::ON {
                state.awake = true;
                debug!("device acknowledged wake request");
                return Ok(());
            }

            if Instant::now() >= deadline {
                // Fail safe: roll back the reference and deassert the wake
                // request so the state is a clean Asleep.
                state.wake_refs -= 1;
                self.shared.regs.write32(reg::SOC_WAKE, soc_wake::V_RESET);
                warn!("wake request timed out, device left asleep");
                return Err(PowerError::WakeTimeout);
            }

            thread::sleep(WAKE_POLL_INTERVAL);
        }
    }

    /// Drop a wake reference.
    ///
    /// When the last reference goes away the grace timer is (re)armed; the
    /// sleep indication is only written if no new reference shows up before
    /// it fires.
    pub fn release_wake(&self) {
        let mut state = self.shared.state.lock().unwrap();

        debug_assert!(state.wake_refs > 0, "unbalanced wake release");
        state.wake_refs = state.wake_refs.saturating_sub(1);

        if state.wake_refs == 0 && state.awake {
            self.grace_timer.arm(self.grace_period);
            trace!("last wake reference dropped, grace timer armed");
        }
    }

    /// Take a wake reference with RAII release.
    pub fn wake(&self) -> Result<WakeGuard<'_>, PowerError> {
        self.acquire_wake()?;
        Ok(WakeGuard { power: self })
    }

    /// Take a wake reference only if the device is already awake.
    ///
    /// Never blocks and never signals the device. This is the variant for
    /// interrupt context: a device that raised an interrupt is awake, so a
    /// `None` here classifies the signal as not ours.
    #[must_use]
    pub fn wake_if_awake(&self) -> Option<WakeGuard<'_>> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.awake {
            return None;
        }

        state.wake_refs += 1;
        self.grace_timer.cancel();
        Some(WakeGuard { power: self })
    }

    /// Return the cached awake flag.
    #[must_use]
    pub fn is_awake(&self) -> bool {
        self.shared.state.lock().unwrap().awake
    }
}

/// A held wake reference; dropping it releases the reference.
#[derive(Debug)]
pub struct WakeGuard<'a> {
    power: &'a PowerController,
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        self.power.release_wake();
    }
}
