//! # Configuration Exchange Inputs
//!
//! The policy table maps each logical service to a direction and a pipe and
//! fixes the geometry of every pipe it references. [`PolicyTable::validate`]
//! checks it against the registry capacity before any channel is opened.
//!
//! The validated table is published to device-visible memory once, at
//! bring-up, at addresses supplied by the device-information block. A
//! mismatch between the published table and the firmware's compiled
//! expectations is undetectable at this layer; version negotiation elsewhere
//! has to catch it.

use std::collections::BTreeSet;

use thiserror::Error;

use super::channel::ChannelError;
use super::constants::{CHANNEL_COUNT_MAX, DIAG_TRANSFER_LIMIT};
use super::diag::DiagError;
use super::pipes::PipeId;
use super::wire::{
    service, PipeConfigRecord, PipeDir, ServiceId, ServiceRouteEntry,
};

/// Errors of the one-shot configuration exchange.
///
/// All of these are fatal to bring-up and never retried automatically; the
/// caller has to fix the policy and retry the whole exchange.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The policy references more pipes than the registry can hold, or a
    /// pipe number beyond the hardware's channel count.
    #[error("policy references pipe {pipe} outside the registry capacity {capacity}")]
    CapacityExceeded {
        /// The offending pipe number.
        pipe: u32,
        /// The fixed registry capacity.
        capacity: usize,
    },

    /// A route needs a direction the pipe's declared direction does not
    /// provide.
    #[error("service {service:?} routes {route_dir:?} traffic over pipe {pipe}, which is declared {pipe_dir:?}")]
    DirectionConflict {
        /// The service whose route conflicts.
        service: ServiceId,
        /// The direction the route needs.
        route_dir: PipeDir,
        /// The pipe in question.
        pipe: u32,
        /// The pipe's declared direction.
        pipe_dir: PipeDir,
    },

    /// A route references a pipe with no attribute entry.
    #[error("route references pipe {pipe} with no declared attributes")]
    UnknownPipe {
        /// The missing pipe number.
        pipe: u32,
    },

    /// Two attribute entries declare the same pipe.
    #[error("pipe {pipe} declared twice")]
    DuplicatePipe {
        /// The duplicated pipe number.
        pipe: u32,
    },

    /// The designated diagnostic pipe is missing or not bidirectional.
    #[error("diagnostic pipe {pipe} must be declared bidirectional")]
    BadDiagPipe {
        /// The designated diagnostic pipe.
        pipe: u32,
    },

    /// The exchange already ran for this transport instance. There is no
    /// reconfiguration of a live pipe's direction or size.
    #[error("transport is already configured")]
    AlreadyConfigured,

    /// Opening a channel failed.
    #[error("opening channel failed")]
    Channel(#[from] ChannelError),

    /// Publishing the tables to device memory failed.
    #[error("publishing handshake tables failed")]
    Publish(#[from] DiagError),
}

/// Fixed geometry of one pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeAttrs {
    /// The pipe this entry describes.
    pub pipe_num: u32,
    /// Declared direction, relative to the host.
    pub direction: PipeDir,
    /// Number of descriptor entries in the channel.
    pub entry_count: u32,
    /// Per-buffer size in bytes.
    pub buf_size: usize,
}

/// One service route: which pipe carries a service's traffic in one
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRoute {
    /// The logical service.
    pub service: ServiceId,
    /// Traffic direction covered by this route.
    pub direction: PipeDir,
    /// The pipe that carries it.
    pub pipe_num: u32,
}

/// Addresses in device-visible memory where firmware expects the handshake
/// tables.
///
/// Populated by the device bring-up collaborator from the device-information
/// block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfoBlock {
    /// Address of the pipe-configuration record array.
    pub pipe_cfg_addr: u32,
    /// Address of the service-to-pipe routing array.
    pub svc_to_pipe_addr: u32,
}

/// The static policy driving one configuration exchange.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    /// Geometry of every pipe the routes reference.
    pub pipes: Vec<PipeAttrs>,
    /// The service routes.
    pub routes: Vec<ServiceRoute>,
    /// The pipe reserved for synchronous diagnostic access.
    pub diag_pipe: PipeId,
}

impl PolicyTable {
    /// Check the table against the registry capacity and the direction
    /// rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for attrs in &self.pipes {
            if attrs.pipe_num as usize >= CHANNEL_COUNT_MAX {
                return Err(ConfigError::CapacityExceeded {
                    pipe: attrs.pipe_num,
                    capacity: CHANNEL_COUNT_MAX,
                });
            }
            if !seen.insert(attrs.pipe_num) {
                return Err(ConfigError::DuplicatePipe {
                    pipe: attrs.pipe_num,
                });
            }
        }

        for route in &self.routes {
            let attrs = self
                .attrs_for(route.pipe_num)
                .ok_or(ConfigError::UnknownPipe {
                    pipe: route.pipe_num,
                })?;

            if !attrs.direction.covers(route.direction) {
                return Err(ConfigError::DirectionConflict {
                    service: route.service,
                    route_dir: route.direction,
                    pipe: route.pipe_num,
                    pipe_dir: attrs.direction,
                });
            }
        }

        match self.attrs_for(u32::from(self.diag_pipe.0)) {
            Some(attrs) if attrs.direction == PipeDir::InOut => Ok(()),
            _ => Err(ConfigError::BadDiagPipe {
                pipe: u32::from(self.diag_pipe.0),
            }),
        }
    }

    /// Look up the attribute entry for a pipe.
    #[must_use]
    pub fn attrs_for(&self, pipe_num: u32) -> Option<&PipeAttrs> {
        self.pipes.iter().find(|attrs| attrs.pipe_num == pipe_num)
    }

    /// The pipe that carries `service` traffic in direction `direction`, if
    /// routed.
    #[must_use]
    pub fn pipe_for(&self, svc: ServiceId, direction: PipeDir) -> Option<PipeId> {
        self.routes
            .iter()
            .find(|route| route.service == svc && route.direction == direction)
            .map(|route| PipeId(route.pipe_num as u8))
    }

    /// The service whose device-to-host traffic arrives on `pipe`, if any.
    ///
    /// Inbound frames are delivered upward keyed by this service.
    #[must_use]
    pub fn service_for_in_pipe(&self, pipe: PipeId) -> Option<ServiceId> {
        self.routes
            .iter()
            .find(|route| {
                route.pipe_num == u32::from(pipe.0) && route.direction == PipeDir::In
            })
            .map(|route| route.service)
    }

    /// The service whose host-to-device traffic leaves on `pipe`, if any.
    #[must_use]
    pub fn service_for_out_pipe(&self, pipe: PipeId) -> Option<ServiceId> {
        self.routes
            .iter()
            .find(|route| {
                route.pipe_num == u32::from(pipe.0) && route.direction == PipeDir::Out
            })
            .map(|route| route.service)
    }

    /// Build the pipe-configuration records published to firmware.
    #[must_use]
    pub fn pipe_config_records(&self) -> Vec<PipeConfigRecord> {
        self.pipes
            .iter()
            .map(|attrs| PipeConfigRecord {
                pipe_num: attrs.pipe_num,
                direction: attrs.direction,
                entry_count: attrs.entry_count,
                max_transfer: attrs.buf_size as u32,
                flags: 0,
            })
            .collect()
    }

    /// Build the service-to-pipe routing entries published to firmware.
    #[must_use]
    pub fn route_entries(&self) -> Vec<ServiceRouteEntry> {
        self.routes
            .iter()
            .map(|route| ServiceRouteEntry {
                service: route.service,
                direction: route.direction,
                pipe_num: route.pipe_num,
            })
            .collect()
    }
}

/// The driver's standard policy.
///
/// Control traffic rides pipes 0 (out) and 1 (in), command traffic pipes 3
/// (out) and 2 (in), bulk data pipes 4 (out) and 5 (in). Pipe 7 is reserved
/// for diagnostic access and carries no service.
#[must_use]
pub fn default_policy() -> PolicyTable {
    PolicyTable {
        pipes: vec![
            PipeAttrs {
                pipe_num: 0,
                direction: PipeDir::Out,
                entry_count: 16,
                buf_size: 256,
            },
            PipeAttrs {
                pipe_num: 1,
                direction: PipeDir::In,
                entry_count: 16,
                buf_size: 512,
            },
            PipeAttrs {
                pipe_num: 2,
                direction: PipeDir::In,
                entry_count: 32,
                buf_size: 2048,
            },
            PipeAttrs {
                pipe_num: 3,
                direction: PipeDir::Out,
                entry_count: 32,
                buf_size: 2048,
            },
            PipeAttrs {
                pipe_num: 4,
                direction: PipeDir::Out,
                entry_count: 64,
                buf_size: 4096,
            },
            PipeAttrs {
                pipe_num: 5,
                direction: PipeDir::In,
                entry_count: 64,
                buf_size: 4096,
            },
            PipeAttrs {
                pipe_num: 7,
                direction: PipeDir::InOut,
                entry_count: 2,
                buf_size: DIAG_TRANSFER_LIMIT + 64,
            },
        ],
        routes: vec![
            ServiceRoute {
                service: service::CONTROL,
                direction: PipeDir::Out,
                pipe_num: 0,
            },
            ServiceRoute {
                service: service::CONTROL,
                direction: PipeDir::In,
                pipe_num: 1,
            },
            ServiceRoute {
                service: service::COMMAND,
                direction: PipeDir::Out,
                pipe_num: 3,
            },
            ServiceRoute {
                service: service::COMMAND,
                direction: PipeDir::In,
                pipe_num: 2,
            },
            ServiceRoute {
                service: service::DATA,
                direction: PipeDir::Out,
                pipe_num: 4,
            },
            ServiceRoute {
                service: service::DATA,
                direction: PipeDir::In,
                pipe_num: 5,
            },
        ],
        diag_pipe: PipeId(7),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_is_valid() {
        default_policy().validate().unwrap();
    }

    #[test]
    fn capacity_is_enforced() {
        let mut policy = default_policy();
        policy.pipes.push(PipeAttrs {
            pipe_num: CHANNEL_COUNT_MAX as u32,
            direction: PipeDir::In,
            entry_count: 4,
            buf_size: 64,
        });

        assert!(matches!(
            policy.validate(),
            Err(ConfigError::CapacityExceeded { pipe, .. }) if pipe == CHANNEL_COUNT_MAX as u32
        ));
    }

    #[test]
    fn direction_conflicts_are_detected() {
        let mut policy = default_policy();
        // Route inbound traffic over the outbound-only control pipe.
        policy.routes.push(ServiceRoute {
            service: service::DATA,
            direction: PipeDir::In,
            pipe_num: 0,
        });

        assert!(matches!(
            policy.validate(),
            Err(ConfigError::DirectionConflict { pipe: 0, .. })
        ));
    }

    #[test]
    fn routes_need_declared_pipes() {
        let mut policy = default_policy();
        policy.routes.push(ServiceRoute {
            service: service::DATA,
            direction: PipeDir::In,
            pipe_num: 6,
        });

        assert!(matches!(
            policy.validate(),
            Err(ConfigError::UnknownPipe { pipe: 6 })
        ));
    }

    #[test]
    fn duplicate_pipe_attrs_are_rejected() {
        let mut policy = default_policy();
        policy.pipes.push(policy.pipes[0]);

        assert!(matches!(
            policy.validate(),
            Err(ConfigError::DuplicatePipe { pipe: 0 })
        ));
    }

    #[test]
    fn diag_pipe_must_be_bidirectional() {
        let mut policy = default_policy();
        policy.diag_pipe = PipeId(4);

        assert!(matches!(
            policy.validate(),
            Err(ConfigError::BadDiagPipe { pipe: 4 })
        ));
    }

    #[test]
    fn route_lookup_matches_table() {
        let policy = default_policy();

        assert_eq!(
            policy.pipe_for(service::COMMAND, PipeDir::Out),
            Some(PipeId(3))
        );
        assert_eq!(policy.service_for_in_pipe(PipeId(5)), Some(service::DATA));
        assert_eq!(policy.service_for_in_pipe(PipeId(7)), None);
    }

    proptest! {
        /// For any valid policy, published routes only reference published
        /// pipes and each route's direction is covered by the published pipe
        /// record. This is the non-conflict property of the two tables that
        /// firmware relies on.
        #[test]
        fn published_tables_are_consistent(extra_routes in proptest::collection::vec(
            (0u32..4, 0u32..8, prop_oneof![Just(PipeDir::In), Just(PipeDir::Out)]),
            0..8,
        )) {
            let mut policy = default_policy();
            for (svc, pipe, dir) in extra_routes {
                policy.routes.push(ServiceRoute {
                    service: ServiceId(10 + svc),
                    direction: dir,
                    pipe_num: pipe,
                });
            }

            if policy.validate().is_ok() {
                let records = policy.pipe_config_records();
                for entry in policy.route_entries() {
                    let record = records
                        .iter()
                        .find(|r| r.pipe_num == entry.pipe_num)
                        .expect("route references unpublished pipe");
                    prop_assert!(record.direction.covers(entry.direction));
                }
            }
        }
    }
}
