//! # Host/Firmware Wire Formats
//!
//! Fixed-layout little-endian records shared with the device firmware. The
//! firmware reads the pipe-configuration table and the service-to-pipe
//! routing table at its own startup, asynchronously to the host, so a layout
//! mismatch silently corrupts traffic. To keep layout bugs testable in
//! isolation, every record is an explicit serialize/deserialize pair over a
//! byte buffer, never a memory overlay.

use thiserror::Error;

/// Errors produced while decoding wire records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The buffer is too short for the record.
    #[error("truncated record: need {need} bytes, got {got}")]
    Truncated {
        /// Required length.
        need: usize,
        /// Available length.
        got: usize,
    },

    /// A direction field holds a value outside 0..=3.
    #[error("invalid pipe direction encoding {0}")]
    BadDirection(u32),
}

/// Direction of a pipe, relative to the host.
///
/// `In` carries device-to-host traffic (the receive direction), `Out` carries
/// host-to-device traffic (the transmit direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDir {
    /// The pipe carries no traffic.
    None,
    /// Device-to-host.
    In,
    /// Host-to-device.
    Out,
    /// Both directions.
    InOut,
}

impl PipeDir {
    /// The wire encoding of this direction.
    #[must_use]
    pub const fn encode(self) -> u32 {
        match self {
            Self::None => 0,
            Self::In => 1,
            Self::Out => 2,
            Self::InOut => 3,
        }
    }

    /// Decode a direction from its wire encoding.
    pub const fn decode(value: u32) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::In),
            2 => Ok(Self::Out),
            3 => Ok(Self::InOut),
            other => Err(WireError::BadDirection(other)),
        }
    }

    /// Return true if a pipe declared with direction `self` can carry traffic
    /// in direction `other`.
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::InOut, Self::In | Self::Out | Self::InOut)
                | (Self::In, Self::In)
                | (Self::Out, Self::Out)
        )
    }

    /// Return true if the pipe receives device-to-host traffic.
    #[must_use]
    pub const fn has_in(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    /// Return true if the pipe sends host-to-device traffic.
    #[must_use]
    pub const fn has_out(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// Identifier of a logical traffic class (service).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub u32);

/// The well-known services of the surrounding driver.
pub mod service {
    use super::ServiceId;

    /// Transport-internal control messages.
    pub const CONTROL: ServiceId = ServiceId(1);

    /// Management commands to the firmware and their event replies.
    pub const COMMAND: ServiceId = ServiceId(2);

    /// Bulk data frames.
    pub const DATA: ServiceId = ServiceId(3);
}

/// One entry of the pipe-configuration table, as read by firmware.
///
/// All fields are 32-bit little-endian quantities to facilitate device
/// access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeConfigRecord {
    /// The pipe this record configures.
    pub pipe_num: u32,
    /// Direction of the pipe, relative to the host.
    pub direction: PipeDir,
    /// Number of descriptor entries in the channel.
    pub entry_count: u32,
    /// Maximum transfer size in bytes.
    pub max_transfer: u32,
    /// Attribute flags. Currently always zero.
    pub flags: u32,
}

impl PipeConfigRecord {
    /// Serialized size of one record in bytes.
    pub const WIRE_SIZE: usize = 24;

    /// Append the wire encoding of this record to `buf`.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.pipe_num.to_le_bytes());
        buf.extend_from_slice(&self.direction.encode().to_le_bytes());
        buf.extend_from_slice(&self.entry_count.to_le_bytes());
        buf.extend_from_slice(&self.max_transfer.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        // Reserved trailing word, must be zero.
        buf.extend_from_slice(&0u32.to_le_bytes());
    }

    /// Decode one record from the start of `buf`.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        let words = read_le_words::<6>(buf)?;

        Ok(Self {
            pipe_num: words[0],
            direction: PipeDir::decode(words[1])?,
            entry_count: words[2],
            max_transfer: words[3],
            flags: words[4],
        })
    }
}

/// One entry of the service-to-pipe routing table, as read by firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRouteEntry {
    /// The logical service this route applies to.
    pub service: ServiceId,
    /// The direction of traffic covered by this route.
    pub direction: PipeDir,
    /// The pipe that carries the traffic.
    pub pipe_num: u32,
}

impl ServiceRouteEntry {
    /// Serialized size of one entry in bytes.
    pub const WIRE_SIZE: usize = 12;

    /// Append the wire encoding of this entry to `buf`.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.service.0.to_le_bytes());
        buf.extend_from_slice(&self.direction.encode().to_le_bytes());
        buf.extend_from_slice(&self.pipe_num.to_le_bytes());
    }

    /// Decode one entry from the start of `buf`.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        let words = read_le_words::<3>(buf)?;

        Ok(Self {
            service: ServiceId(words[0]),
            direction: PipeDir::decode(words[1])?,
            pipe_num: words[2],
        })
    }
}

/// Operations carried in a diagnostic request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagOp {
    /// Copy device memory to the host.
    Read,
    /// Copy host bytes into device memory.
    Write,
}

impl DiagOp {
    const fn encode(self) -> u32 {
        match self {
            Self::Read => 1,
            Self::Write => 2,
        }
    }
}

/// Header of a diagnostic request or response frame.
///
/// A read request is the bare header; the response echoes the header followed
/// by `length` payload bytes. A write request is the header followed by
/// `length` payload bytes; the response is the bare header and serves as the
/// acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagHeader {
    /// Requested operation.
    pub op: DiagOp,
    /// Device memory address.
    pub address: u32,
    /// Payload length in bytes.
    pub length: u32,
}

impl DiagHeader {
    /// Serialized size of the header in bytes.
    pub const WIRE_SIZE: usize = 12;

    /// Append the wire encoding of this header to `buf`.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.op.encode().to_le_bytes());
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
    }

    /// Decode a header from the start of `buf`.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        let words = read_le_words::<3>(buf)?;

        let op = match words[0] {
            1 => DiagOp::Read,
            2 => DiagOp::Write,
            // Reuse the direction error shape; an unknown op is equally a
            // framing failure.
            other => return Err(WireError::BadDirection(other)),
        };

        Ok(Self {
            op,
            address: words[1],
            length: words[2],
        })
    }
}

/// Read `N` consecutive little-endian 32-bit words from the start of `buf`.
fn read_le_words<const N: usize>(buf: &[u8]) -> Result<[u32; N], WireError> {
    let need = N * 4;
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            got: buf.len(),
        });
    }

    let mut words = [0u32; N];
    for (i, word) in words.iter_mut().enumerate() {
        // The slice bounds were checked above.
        let bytes: [u8; 4] = buf[i * 4..i * 4 + 4].try_into().unwrap();
        *word = u32::from_le_bytes(bytes);
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pipe_config_record_layout() {
        let record = PipeConfigRecord {
            pipe_num: 3,
            direction: PipeDir::Out,
            entry_count: 32,
            max_transfer: 2048,
            flags: 0,
        };

        let mut buf = Vec::new();
        record.serialize(&mut buf);

        assert_eq!(buf.len(), PipeConfigRecord::WIRE_SIZE);
        // Spot-check the layout against the firmware contract: pipe number
        // first, then direction, entries, max transfer, flags, reserved.
        assert_eq!(&buf[0..4], &3u32.to_le_bytes());
        assert_eq!(&buf[4..8], &2u32.to_le_bytes());
        assert_eq!(&buf[8..12], &32u32.to_le_bytes());
        assert_eq!(&buf[12..16], &2048u32.to_le_bytes());
        assert_eq!(&buf[20..24], &[0, 0, 0, 0]);

        assert_eq!(PipeConfigRecord::deserialize(&buf), Ok(record));
    }

    #[test]
    fn service_route_entry_layout() {
        let entry = ServiceRouteEntry {
            service: service::COMMAND,
            direction: PipeDir::In,
            pipe_num: 2,
        };

        let mut buf = Vec::new();
        entry.serialize(&mut buf);

        assert_eq!(buf.len(), ServiceRouteEntry::WIRE_SIZE);
        assert_eq!(&buf[0..4], &service::COMMAND.0.to_le_bytes());
        assert_eq!(&buf[4..8], &1u32.to_le_bytes());
        assert_eq!(&buf[8..12], &2u32.to_le_bytes());

        assert_eq!(ServiceRouteEntry::deserialize(&buf), Ok(entry));
    }

    #[test]
    fn truncated_records_are_rejected() {
        let err = PipeConfigRecord::deserialize(&[0u8; 10]);
        assert_eq!(err, Err(WireError::Truncated { need: 24, got: 10 }));

        let err = ServiceRouteEntry::deserialize(&[]);
        assert_eq!(err, Err(WireError::Truncated { need: 12, got: 0 }));
    }

    #[test]
    fn bad_direction_is_rejected() {
        let mut buf = Vec::new();
        ServiceRouteEntry {
            service: ServiceId(9),
            direction: PipeDir::None,
            pipe_num: 0,
        }
        .serialize(&mut buf);
        buf[4..8].copy_from_slice(&7u32.to_le_bytes());

        assert_eq!(
            ServiceRouteEntry::deserialize(&buf),
            Err(WireError::BadDirection(7))
        );
    }

    #[test]
    fn direction_subsumption() {
        assert!(PipeDir::InOut.covers(PipeDir::In));
        assert!(PipeDir::InOut.covers(PipeDir::Out));
        assert!(PipeDir::In.covers(PipeDir::In));
        assert!(!PipeDir::In.covers(PipeDir::Out));
        assert!(!PipeDir::Out.covers(PipeDir::InOut));
        assert!(!PipeDir::None.covers(PipeDir::In));
    }

    #[test]
    fn diag_header_roundtrip() {
        let header = DiagHeader {
            op: DiagOp::Write,
            address: 0x0040_0000,
            length: 2048,
        };

        let mut buf = Vec::new();
        header.serialize(&mut buf);
        buf.extend_from_slice(&[0xAB; 16]); // trailing payload is ignored

        assert_eq!(DiagHeader::deserialize(&buf), Ok(header));
    }

    proptest! {
        #[test]
        fn direction_decode_inverts_encode(raw in 0u32..=3) {
            let dir = PipeDir::decode(raw).unwrap();
            prop_assert_eq!(dir.encode(), raw);
        }

        #[test]
        fn covers_implies_component_direction(a in 0u32..=3, b in 0u32..=3) {
            let a = PipeDir::decode(a).unwrap();
            let b = PipeDir::decode(b).unwrap();

            // A pipe that covers a route direction must provide every
            // component (in/out) that the route needs.
            if a.covers(b) {
                prop_assert!(!b.has_in() || a.has_in());
                prop_assert!(!b.has_out() || a.has_out());
            }
        }
    }
}
