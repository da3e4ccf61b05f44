//! # PCIe Transport Control Plane
//!
//! The host side of a wireless adapter's PCIe transport: a fixed set of
//! DMA-backed pipes shared with the device firmware, a synchronous
//! diagnostic access path for bring-up, a reference-counted power-state
//! arbitrator gating all register access, and the interrupt dispatch that
//! feeds pipe completions back into the system.
//!
//! [`Transport`] is the entry point. Exactly one instance exists per
//! physical device; it outlives all pipes and is destroyed only after every
//! pipe is torn down. This crate should never depend on bus enumeration,
//! firmware images or frame processing; those are collaborators behind the
//! [`regs::RegisterWindow`] and [`channel::ChannelFactory`] seams.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod channel;
pub mod config;
pub mod constants;
pub mod diag;
pub mod events;
mod interrupt;
pub mod mockdev;
pub mod pipes;
pub mod power;
pub mod regs;
pub mod timer;
pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use channel::{ChannelError, ChannelFactoryRef};
use config::{ConfigError, DeviceInfoBlock, PolicyTable};
use diag::{DiagError, DiagLink};
use events::EventSinkRef;
use interrupt::Dispatcher;
use pipes::{Pipe, PipeId, PipeRegistry};
use power::{PowerController, PowerError};
use regs::RegisterWindowRef;
use wire::{PipeDir, ServiceId};

/// Errors of the outbound send path.
#[derive(Debug, Error)]
pub enum SendError {
    /// No route maps this service to an outbound pipe.
    #[error("no outbound route for service {0:?}")]
    UnknownService(ServiceId),

    /// All send permits of the routed pipe are in flight.
    #[error("no send permit available")]
    NoCredit,

    /// The configuration exchange has not run yet.
    #[error("transport is not configured")]
    NotConfigured,

    /// Waking the device failed.
    #[error("waking the device for send failed")]
    Power(#[from] PowerError),

    /// The channel rejected the frame.
    #[error("channel rejected the frame")]
    Channel(#[from] ChannelError),
}

/// State shared between the transport facade and the deferred interrupt
/// worker.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) regs: RegisterWindowRef,
    pub(crate) power: Arc<PowerController>,
    pub(crate) registry: Arc<PipeRegistry>,
    pub(crate) sink: EventSinkRef,
    /// The routing/policy table, set exactly once by `configure`.
    pub(crate) routing: Mutex<Option<PolicyTable>>,
}

/// The transport context for one physical device instance.
#[derive(Debug)]
pub struct Transport {
    shared: Arc<Shared>,
    factory: ChannelFactoryRef,
    dispatcher: Dispatcher,
    /// The diagnostic link doubles as the serialization point for
    /// diagnostic calls: one pipe, one transfer at a time.
    diag: Mutex<Option<DiagLink>>,
    configured: AtomicBool,
}

impl Transport {
    /// Create a transport over a ready register window and channel factory.
    ///
    /// `msi_vectors` is the granted message-signaled vector count as
    /// negotiated by the interrupt collaborator; 0 selects legacy line
    /// mode. The device starts out asleep and no pipe exists until
    /// [`Transport::configure`] runs.
    #[must_use]
    pub fn new(
        regs: RegisterWindowRef,
        factory: ChannelFactoryRef,
        msi_vectors: u32,
        sink: EventSinkRef,
    ) -> Self {
        let shared = Arc::new(Shared {
            power: Arc::new(PowerController::new(Arc::clone(&regs))),
            regs,
            registry: Arc::new(PipeRegistry::new()),
            sink,
            routing: Mutex::new(None),
        });

        let dispatcher = Dispatcher::new(Arc::clone(&shared), msi_vectors);

        Self {
            shared,
            factory,
            dispatcher,
            diag: Mutex::new(None),
            configured: AtomicBool::new(false),
        }
    }

    /// Run the one-time configuration exchange.
    ///
    /// Allocates one pipe per policy entry, provisions receive buffers,
    /// and publishes the pipe-configuration and service-routing tables to
    /// device-visible memory at the addresses in `info`. On any failure the
    /// pipes allocated so far are torn down and the transport returns to
    /// its unconfigured state; a successful exchange is final, there is no
    /// reconfiguration of a live pipe.
    pub fn configure(
        &self,
        policy: PolicyTable,
        info: DeviceInfoBlock,
    ) -> Result<(), ConfigError> {
        if self
            .configured
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConfigError::AlreadyConfigured);
        }

        match self.configure_inner(&policy, info) {
            Ok(()) => {
                *self.shared.routing.lock().unwrap() = Some(policy);
                info!("configuration exchange complete");
                Ok(())
            }
            Err(err) => {
                // Tear down exactly what was allocated so no
                // half-initialized pipe stays reachable.
                *self.diag.lock().unwrap() = None;
                self.shared.registry.teardown();
                self.configured.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn configure_inner(
        &self,
        policy: &PolicyTable,
        info: DeviceInfoBlock,
    ) -> Result<(), ConfigError> {
        policy.validate()?;

        for attrs in &policy.pipes {
            let id = PipeId(attrs.pipe_num as u8);
            let channel =
                self.factory
                    .open(id, attrs.direction, attrs.entry_count, attrs.buf_size)?;
            self.shared.registry.insert(Arc::new(Pipe::new(
                id,
                attrs.direction,
                attrs.entry_count,
                attrs.buf_size,
                channel,
            )));
        }

        // Initial receive provisioning. A transient post failure is not
        // fatal; the retry timer keeps topping the ring up.
        let mut provision_failed = false;
        for pipe in self.shared.registry.pipes() {
            if pipe.direction().has_in() {
                pipe.prime_rx();
                if interrupt::replenish_rx(&pipe).is_err() {
                    provision_failed = true;
                }
            }
        }
        if provision_failed {
            self.dispatcher.arm_rx_retry();
        }

        // Publish the handshake tables through the diagnostic pipe; the
        // firmware reads them at its own startup.
        let diag_pipe = self
            .shared
            .registry
            .get(policy.diag_pipe)
            .ok_or(ConfigError::BadDiagPipe {
                pipe: u32::from(policy.diag_pipe.0),
            })?;
        let link = DiagLink::new(diag_pipe, Arc::clone(&self.shared.power));

        let mut table = Vec::new();
        for record in policy.pipe_config_records() {
            record.serialize(&mut table);
        }
        link.write(info.pipe_cfg_addr, &table)?;

        table.clear();
        for entry in policy.route_entries() {
            entry.serialize(&mut table);
        }
        link.write(info.svc_to_pipe_addr, &table)?;

        *self.diag.lock().unwrap() = Some(link);
        Ok(())
    }

    /// Queue one outbound frame for a logical service.
    pub fn send(&self, service: ServiceId, frame: Vec<u8>) -> Result<(), SendError> {
        let pipe_id = {
            let routing = self.shared.routing.lock().unwrap();
            let routing = routing.as_ref().ok_or(SendError::NotConfigured)?;
            routing
                .pipe_for(service, PipeDir::Out)
                .ok_or(SendError::UnknownService(service))?
        };

        let pipe = self
            .shared
            .registry
            .get(pipe_id)
            .ok_or(SendError::NotConfigured)?;

        if !pipe.take_send_credit() {
            return Err(SendError::NoCredit);
        }

        let wake = match self.shared.power.wake() {
            Ok(guard) => guard,
            Err(err) => {
                pipe.return_send_credit();
                return Err(err.into());
            }
        };

        if let Err(err) = pipe.channel().send(frame) {
            pipe.return_send_credit();
            return Err(err.into());
        }

        drop(wake);
        Ok(())
    }

    /// Synchronously read device memory over the diagnostic pipe.
    pub fn diag_read(&self, address: u32, length: usize) -> Result<Vec<u8>, DiagError> {
        let diag = self.diag.lock().unwrap();
        diag.as_ref()
            .ok_or(DiagError::NotConfigured)?
            .read(address, length)
    }

    /// Synchronously write device memory over the diagnostic pipe.
    pub fn diag_write(&self, address: u32, bytes: &[u8]) -> Result<(), DiagError> {
        let diag = self.diag.lock().unwrap();
        diag.as_ref()
            .ok_or(DiagError::NotConfigured)?
            .write(address, bytes)
    }

    /// Entry point for one message-signaled interrupt.
    pub fn handle_msi(&self, vector: u32) {
        self.dispatcher.handle_msi(vector);
    }

    /// Entry point for the shared legacy interrupt line. Returns true if
    /// this device raised the interrupt.
    #[must_use]
    pub fn handle_line_interrupt(&self) -> bool {
        self.dispatcher.handle_line_interrupt()
    }

    /// The power-state controller gating register access.
    ///
    /// Collaborators performing their own register accesses must hold a
    /// wake reference from here for the duration of the access.
    #[must_use]
    pub fn power(&self) -> &PowerController {
        &self.shared.power
    }

    /// Look up a pipe's counters, for inspection and tests.
    #[must_use]
    pub fn pipe_counters(&self, pipe: PipeId) -> Option<pipes::PipeCounters> {
        self.shared.registry.get(pipe).map(|pipe| pipe.counters())
    }

    /// Stop interrupt dispatch and release every pipe. Idempotent; also
    /// runs on drop.
    pub fn shutdown(&mut self) {
        self.dispatcher.shutdown();
        *self.diag.lock().unwrap() = None;
        self.shared.registry.teardown();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::config::default_policy;
    use crate::transport::constants::intr;
    use crate::transport::events::EventSink;
    use crate::transport::mockdev::MockDevice;
    use crate::transport::regs::RegisterWindow;
    use crate::transport::wire::service;
    use std::time::{Duration, Instant};

    const INFO: DeviceInfoBlock = DeviceInfoBlock {
        pipe_cfg_addr: 0x8000,
        svc_to_pipe_addr: 0x9000,
    };

    /// Vector assigned to a pipe in MSI mode.
    fn pipe_vector(pipe: u8) -> u32 {
        intr::MSI_VEC_CHANNEL_BASE + u32::from(pipe)
    }

    #[derive(Debug, Default)]
    struct RecordingSink {
        frames: Mutex<Vec<(ServiceId, Vec<u8>)>>,
        send_completes: Mutex<Vec<ServiceId>>,
        faults: Mutex<usize>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<(ServiceId, Vec<u8>)> {
            self.frames.lock().unwrap().clone()
        }

        fn send_completes(&self) -> usize {
            self.send_completes.lock().unwrap().len()
        }

        fn faults(&self) -> usize {
            *self.faults.lock().unwrap()
        }
    }

    impl EventSink for RecordingSink {
        fn frame_received(&self, service: ServiceId, frame: Vec<u8>) {
            self.frames.lock().unwrap().push((service, frame));
        }

        fn send_complete(&self, service: ServiceId) {
            self.send_completes.lock().unwrap().push(service);
        }

        fn firmware_fault(&self) {
            *self.faults.lock().unwrap() += 1;
        }
    }

    fn transport(msi_vectors: u32) -> (Arc<MockDevice>, Transport, Arc<RecordingSink>) {
        let device = MockDevice::new();
        let sink = Arc::new(RecordingSink::default());
        let transport = Transport::new(
            device.clone(),
            device.clone(),
            msi_vectors,
            sink.clone(),
        );
        (device, transport, sink)
    }

    /// Poll until `cond` holds; the dispatch worker runs asynchronously.
    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn configure_publishes_consistent_tables() {
        let (device, transport, _sink) = transport(9);
        let policy = default_policy();

        transport.configure(policy.clone(), INFO).unwrap();
        assert_eq!(device.open_count(), policy.pipes.len());

        // Decode the published pipe-configuration table back out of device
        // memory and compare against the policy.
        let raw = device.read_device_memory(
            INFO.pipe_cfg_addr,
            policy.pipes.len() * wire::PipeConfigRecord::WIRE_SIZE,
        );
        for (i, attrs) in policy.pipes.iter().enumerate() {
            let record = wire::PipeConfigRecord::deserialize(
                &raw[i * wire::PipeConfigRecord::WIRE_SIZE..],
            )
            .unwrap();
            assert_eq!(record.pipe_num, attrs.pipe_num);
            assert_eq!(record.direction, attrs.direction);
            assert_eq!(record.entry_count, attrs.entry_count);
            assert_eq!(record.max_transfer as usize, attrs.buf_size);
        }

        // Every published route references a published pipe whose direction
        // covers the route.
        let raw = device.read_device_memory(
            INFO.svc_to_pipe_addr,
            policy.routes.len() * wire::ServiceRouteEntry::WIRE_SIZE,
        );
        for i in 0..policy.routes.len() {
            let entry = wire::ServiceRouteEntry::deserialize(
                &raw[i * wire::ServiceRouteEntry::WIRE_SIZE..],
            )
            .unwrap();
            let attrs = policy.attrs_for(entry.pipe_num).unwrap();
            assert!(attrs.direction.covers(entry.direction));
        }
    }

    #[test]
    fn configure_is_one_shot() {
        let (_device, transport, _sink) = transport(9);

        transport.configure(default_policy(), INFO).unwrap();
        assert!(matches!(
            transport.configure(default_policy(), INFO),
            Err(ConfigError::AlreadyConfigured)
        ));
    }

    #[test]
    fn partial_configure_failure_releases_exactly_what_was_allocated() {
        let (device, transport, _sink) = transport(9);
        device.fail_open_for(PipeId(4));

        assert!(matches!(
            transport.configure(default_policy(), INFO),
            Err(ConfigError::Channel(_))
        ));

        // Pipes 0..=3 were opened before pipe 4 failed; all of them, and
        // nothing else, were flushed again.
        assert_eq!(device.open_count(), 4);
        assert_eq!(device.flush_count(), device.open_count());

        // The failure is recoverable by retrying the whole exchange.
        transport.configure(default_policy(), INFO).unwrap();
    }

    #[test]
    fn diag_roundtrip_through_the_transport() {
        let (_device, transport, _sink) = transport(9);
        transport.configure(default_policy(), INFO).unwrap();

        let bytes: Vec<u8> = (0..3000u32).map(|v| (v % 251) as u8).collect();
        transport.diag_write(0x2_0000, &bytes).unwrap();
        assert_eq!(transport.diag_read(0x2_0000, bytes.len()).unwrap(), bytes);
    }

    #[test]
    fn diag_requires_configuration() {
        let (_device, transport, _sink) = transport(9);
        assert_eq!(
            transport.diag_read(0, 4),
            Err(DiagError::NotConfigured)
        );
    }

    #[test]
    fn send_and_completion_roundtrip() {
        let (_device, transport, sink) = transport(9);
        transport.configure(default_policy(), INFO).unwrap();

        transport.send(service::DATA, vec![0xAA; 64]).unwrap();
        let counters = transport.pipe_counters(PipeId(4)).unwrap();
        assert_eq!(counters.send_credits, 63);

        // The device completes the send; the completion interrupt returns
        // the permit and notifies upward.
        transport.handle_msi(pipe_vector(4));
        wait_until(|| sink.send_completes() == 1);
        wait_until(|| transport.pipe_counters(PipeId(4)).unwrap().send_credits == 64);
    }

    #[test]
    fn send_credits_run_out() {
        let (_device, transport, _sink) = transport(9);
        transport.configure(default_policy(), INFO).unwrap();

        // Control out pipe 0 has 16 entries.
        for _ in 0..16 {
            transport.send(service::CONTROL, vec![1]).unwrap();
        }
        assert!(matches!(
            transport.send(service::CONTROL, vec![1]),
            Err(SendError::NoCredit)
        ));
    }

    #[test]
    fn send_path_rejects_unknown_and_unconfigured() {
        let (_device, transport, _sink) = transport(9);
        assert!(matches!(
            transport.send(service::DATA, vec![]),
            Err(SendError::NotConfigured)
        ));

        transport.configure(default_policy(), INFO).unwrap();
        assert!(matches!(
            transport.send(ServiceId(99), vec![]),
            Err(SendError::UnknownService(ServiceId(99)))
        ));
    }

    #[test]
    fn inbound_frames_are_delivered_by_service() {
        let (device, transport, sink) = transport(9);
        transport.configure(default_policy(), INFO).unwrap();

        assert!(device.inject_rx(PipeId(5), vec![0xDE, 0xAD]));
        transport.handle_msi(pipe_vector(5));

        wait_until(|| !sink.frames().is_empty());
        assert_eq!(sink.frames(), vec![(service::DATA, vec![0xDE, 0xAD])]);

        // The consumed buffer was replenished.
        wait_until(|| {
            let counters = transport.pipe_counters(PipeId(5)).unwrap();
            counters.completions_free == 64 && counters.rx_deficit == 0
        });
    }

    #[test]
    fn interrupt_storm_does_not_corrupt_counters() {
        let (_device, transport, _sink) = transport(9);
        transport.configure(default_policy(), INFO).unwrap();

        // A storm of completion signals with no actual completions behind
        // them.
        for _ in 0..1000 {
            transport.handle_msi(pipe_vector(5));
            transport.handle_msi(pipe_vector(4));
        }

        // Let the worker chew through the backlog.
        std::thread::sleep(Duration::from_millis(100));

        let rx = transport.pipe_counters(PipeId(5)).unwrap();
        assert_eq!(rx.completions_free, 64);
        assert_eq!(rx.rx_deficit, 0);

        let tx = transport.pipe_counters(PipeId(4)).unwrap();
        assert_eq!(tx.send_credits, 64);
    }

    #[test]
    fn firmware_fault_is_surfaced_once_per_signal() {
        let (device, transport, sink) = transport(9);
        transport.configure(default_policy(), INFO).unwrap();

        device.raise_firmware_fault();
        transport.handle_msi(intr::MSI_VEC_FIRMWARE);
        wait_until(|| sink.faults() == 1);

        device.raise_firmware_fault();
        transport.handle_msi(intr::MSI_VEC_FIRMWARE);
        wait_until(|| sink.faults() == 2);
    }

    #[test]
    fn legacy_line_claim_check() {
        let (device, transport, sink) = transport(0);
        transport.configure(default_policy(), INFO).unwrap();

        // Keep the device provably awake while it "raises" the line.
        let guard = transport.power().wake().unwrap();

        // No cause bits: shared-line noise.
        assert!(!transport.handle_line_interrupt());

        assert!(device.inject_rx(PipeId(5), vec![7]));
        device.raise_pipe_cause(PipeId(5));
        assert!(transport.handle_line_interrupt());

        wait_until(|| !sink.frames().is_empty());
        // The claim acknowledged the cause bits.
        assert_eq!(
            device.read32(constants::reg::INTR_CAUSE) & intr::CHANNEL_MASK_ALL,
            0
        );

        drop(guard);
    }

    #[test]
    fn legacy_line_is_not_ours_while_asleep() {
        let (device, transport, _sink) = transport(0);
        transport.configure(default_policy(), INFO).unwrap();

        // Wait out the grace period so the device is asleep again after
        // the configuration exchange.
        wait_until(|| !transport.power().is_awake());

        device.raise_pipe_cause(PipeId(5));
        assert!(!transport.handle_line_interrupt());
    }

    #[test]
    fn failed_rx_provisioning_recovers_via_retry_timer() {
        let (device, transport, _sink) = transport(9);
        device.set_fail_rx_posts(true);

        transport.configure(default_policy(), INFO).unwrap();
        let counters = transport.pipe_counters(PipeId(5)).unwrap();
        assert_eq!(counters.completions_free, 0);
        assert_eq!(counters.rx_deficit, 64);

        device.set_fail_rx_posts(false);
        wait_until(|| {
            let counters = transport.pipe_counters(PipeId(5)).unwrap();
            counters.completions_free == 64 && counters.rx_deficit == 0
        });
    }

    #[test]
    fn shutdown_releases_all_pipes() {
        let (device, mut transport, _sink) = transport(9);
        transport.configure(default_policy(), INFO).unwrap();

        transport.shutdown();
        assert_eq!(device.flush_count(), device.open_count());

        // Idempotent, and drop after shutdown is fine.
        transport.shutdown();
        drop(transport);
        assert_eq!(device.flush_count(), device.open_count());
    }
}
