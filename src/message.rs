//! Message wire format and the in-memory `Message` carrier.
//!
//! Grounded in the teacher's `Header`/`WireMessage`
//! (`communication::message::{Header, WireMessage}`) and its
//! `serialize_into`/`deserialize_from` pair, generalized from a
//! fixed-role BFT header to spec §3/§6's identity+serial+type+lengths
//! framing. The teacher serializes via `mem::transmute`; this port uses
//! explicit `to_be_bytes`/`from_be_bytes` instead, since transmuting a
//! `#[repr(C)]` struct containing padding is unsound and the wire layout
//! here isn't the type's in-memory layout anyway.

use std::fmt;

use crate::address::{Identity, PeerAddress};
use crate::error::{Error, ErrorKind, Result};

/// Length, in bytes, of the application-level handshake record: a
/// `u16` port followed by a 16-byte [`Identity`] (spec §4.4/§6).
pub const HANDSHAKE_LEN: usize = 2 + 16;

/// Length, in bytes, of the framed wire header. spec §9 leaves the
/// choice between a packed 27-byte header and a padded, aligned 40-byte
/// one open; this port picks the padded form, trailing bytes reserved
/// and zeroed.
pub const WIRE_HEADER_LEN: usize = 40;

const WIRE_HEADER_PACKED_LEN: usize = 16 + 4 + 1 + 2 + 4;

/// Bitset of message type flags (spec §3/§6).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct MessageType(u8);

impl MessageType {
    pub const NONE: MessageType = MessageType(0);
    pub const REQ_ACK: MessageType = MessageType(0x01);
    pub const ACK: MessageType = MessageType(0x02);
    pub const NOOP: MessageType = MessageType(0x04);

    pub fn from_bits(bits: u8) -> Self {
        MessageType(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: MessageType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MessageType) {
        self.0 |= other.0;
    }

    pub fn is_control(self) -> bool {
        self.contains(MessageType::ACK) || self.contains(MessageType::NOOP)
    }
}

impl std::ops::BitOr for MessageType {
    type Output = MessageType;
    fn bitor(self, rhs: MessageType) -> MessageType {
        MessageType(self.0 | rhs.0)
    }
}

/// Internal lifecycle flags tracked on a [`Message`] (spec §3).
///
/// `FREE_HEADER`/`FREE_DATA` of the original design existed to track
/// whether the header/data buffer was heap-allocated by the core (and so
/// must be freed on release) versus borrowed from inline slot scratch.
/// In this port `Message::header`/`Message::data` are always an owned
/// `Vec<u8>`, so that bookkeeping is obsoleted by ownership rather than
/// tracked at runtime (spec §9's "let invariants fall out of type
/// discipline").
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct MessageFlags(u16);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    /// Enqueued on a remote queue or currently in flight; must not be
    /// submitted to `send` again until release.
    pub const USED: MessageFlags = MessageFlags(0x01);
    /// An ack (real or synthesized) has arrived for this outbound message.
    pub const ACK_RECEIVED: MessageFlags = MessageFlags(0x02);
    /// The writer finished placing this message's bytes on the wire.
    pub const WRITE_DONE: MessageFlags = MessageFlags(0x04);
    /// Release of this (inbound) message should emit an ack.
    pub const SEND_ACK: MessageFlags = MessageFlags(0x08);
    /// This message was acquired from a slot pool and must be released
    /// through that path.
    pub const HAS_SLOT: MessageFlags = MessageFlags(0x10);

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MessageFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: MessageFlags) {
        self.0 &= !other.0;
    }
}

/// A message identity: opaque, assigned once at allocation, stable
/// across the ack round-trip (spec §3). Distinct from a node's
/// [`Identity`] even though both are 16 bytes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn random() -> Self {
        MessageId(rand::random())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A carrier for one message, inbound or outbound. See spec §3 for the
/// full invariant list; the slot-pool/queue bookkeeping invariants
/// (never on two queues at once, release exactly once, etc.) are
/// enforced by [`crate::remote::Remote`] and [`crate::slot::SlotPool`],
/// not by this type itself.
pub struct Message {
    pub id: MessageId,
    pub serial: u32,
    pub msg_type: MessageType,
    pub header: Vec<u8>,
    pub data: Vec<u8>,
    pub peer: PeerAddress,
    /// Identity learned from the handshake of the connection that
    /// delivered (inbound) or will deliver (outbound) this message.
    pub remote_identity: Identity,
    pub flags: MessageFlags,
    /// Invoked exactly once when an outbound message's lifecycle
    /// completes (spec §7/§8: "the send callback is invoked exactly
    /// once with a final status").
    pub send_cb: Option<SendCallback>,
}

/// A user send-completion callback: `FnOnce` because spec guarantees
/// it fires exactly once.
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send>;

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("msg_type", &self.msg_type)
            .field("header_len", &self.header.len())
            .field("data_len", &self.data.len())
            .field("peer", &self.peer)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Message {
    /// Builds a new outbound data message. `serial` is stamped later, at
    /// write time, by the owning remote (spec §4.3).
    pub fn new(
        peer: PeerAddress,
        msg_type: MessageType,
        header: Vec<u8>,
        data: Vec<u8>,
    ) -> Self {
        Message {
            id: MessageId::random(),
            serial: 0,
            msg_type,
            header,
            data,
            peer,
            remote_identity: [0; 16],
            flags: MessageFlags::NONE,
            send_cb: None,
        }
    }

    /// Builds the zero-payload ack for a delivered message, addressed
    /// back at `peer`. Built by the protocol's release handler when the
    /// released slot's message carries `SEND_ACK`, then queued via
    /// `Remote::enqueue_control`.
    pub fn ack_for(id: MessageId, peer: PeerAddress) -> Self {
        Message {
            id,
            serial: 0,
            msg_type: MessageType::ACK,
            header: Vec::new(),
            data: Vec::new(),
            peer,
            remote_identity: [0; 16],
            flags: MessageFlags::NONE,
            send_cb: None,
        }
    }

    /// Builds a zero-payload liveness probe (spec §4.3 "Probe/noop").
    pub fn noop(peer: PeerAddress) -> Self {
        Message {
            id: MessageId::random(),
            serial: 0,
            msg_type: MessageType::NOOP,
            header: Vec::new(),
            data: Vec::new(),
            peer,
            remote_identity: [0; 16],
            flags: MessageFlags::NONE,
            send_cb: None,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.header.len() as u64 + self.data.len() as u64
    }

    pub fn take_send_cb(&mut self) -> Option<SendCallback> {
        self.send_cb.take()
    }

    /// Invokes the send callback, if any, exactly once.
    pub fn finish(&mut self, result: Result<()>) {
        if let Some(cb) = self.take_send_cb() {
            cb(result);
        }
    }
}

/// A parsed (but not yet slot-backed) wire header, as produced by the
/// reader's WAIT state (spec §4.2).
#[derive(Debug, Copy, Clone)]
pub struct WireHeader {
    pub id: MessageId,
    pub serial: u32,
    pub msg_type: MessageType,
    pub header_len: u16,
    pub data_len: u32,
}

impl WireHeader {
    pub fn body_len(&self) -> u64 {
        self.header_len as u64 + self.data_len as u64
    }

    /// Validates the control-message invariant of spec §3/§8: ACK and
    /// NOOP never carry a payload and never request an ack.
    pub fn validate_control_shape(&self) -> Result<()> {
        if self.msg_type.is_control() {
            if self.header_len != 0 || self.data_len != 0 {
                return Err(Error::simple_msg(
                    ErrorKind::ProtocolError,
                    "ACK/NOOP must not carry a payload",
                ));
            }
            if self.msg_type.contains(MessageType::REQ_ACK) {
                return Err(Error::simple_msg(
                    ErrorKind::ProtocolError,
                    "ACK/NOOP must not set REQ_ACK",
                ));
            }
        }
        Ok(())
    }

    /// Serializes the framed, padded [`WIRE_HEADER_LEN`]-byte header.
    pub fn encode(&self) -> [u8; WIRE_HEADER_LEN] {
        let mut buf = [0u8; WIRE_HEADER_LEN];
        let mut off = 0;
        buf[off..off + 16].copy_from_slice(&self.id.0);
        off += 16;
        buf[off..off + 4].copy_from_slice(&self.serial.to_be_bytes());
        off += 4;
        buf[off] = self.msg_type.bits();
        off += 1;
        buf[off..off + 2].copy_from_slice(&self.header_len.to_be_bytes());
        off += 2;
        buf[off..off + 4].copy_from_slice(&self.data_len.to_be_bytes());
        // remaining WIRE_HEADER_LEN - WIRE_HEADER_PACKED_LEN bytes stay
        // zero: reserved padding for wire alignment (spec §9).
        buf
    }

    /// Parses a framed [`WIRE_HEADER_LEN`]-byte header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < WIRE_HEADER_LEN {
            return Err(Error::simple_msg(
                ErrorKind::ProtocolError,
                "short wire header",
            ));
        }
        let mut off = 0;
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[off..off + 16]);
        off += 16;
        let serial = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let msg_type = MessageType::from_bits(buf[off]);
        off += 1;
        let header_len = u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
        off += 2;
        let data_len = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        Ok(WireHeader {
            id: MessageId(id),
            serial,
            msg_type,
            header_len,
            data_len,
        })
    }
}

/// Encodes the application-level handshake record of spec §4.4/§6:
/// a `u16` public port followed by the sender's 16-byte [`Identity`].
pub fn encode_handshake(public_port: u16, identity: Identity) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[..2].copy_from_slice(&public_port.to_be_bytes());
    buf[2..].copy_from_slice(&identity);
    buf
}

/// Decodes the application-level handshake record.
pub fn decode_handshake(buf: &[u8]) -> Result<(u16, Identity)> {
    if buf.len() < HANDSHAKE_LEN {
        return Err(Error::simple_msg(
            ErrorKind::ProtocolError,
            "short handshake record",
        ));
    }
    let port = u16::from_be_bytes(buf[..2].try_into().unwrap());
    let mut identity = [0u8; 16];
    identity.copy_from_slice(&buf[2..18]);
    Ok((port, identity))
}

impl Error {
    pub(crate) fn simple_msg(kind: ErrorKind, msg: &str) -> Error {
        Error::wrapped(kind, msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> PeerAddress {
        PeerAddress::new_v4(Ipv4Addr::new(127, 0, 0, 1), 9000)
    }

    #[test]
    fn wire_header_roundtrips() {
        let hdr = WireHeader {
            id: MessageId::random(),
            serial: 42,
            msg_type: MessageType::REQ_ACK,
            header_len: 3,
            data_len: 5,
        };
        let encoded = hdr.encode();
        assert_eq!(encoded.len(), WIRE_HEADER_LEN);
        let decoded = WireHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.id, hdr.id);
        assert_eq!(decoded.serial, hdr.serial);
        assert_eq!(decoded.msg_type, hdr.msg_type);
        assert_eq!(decoded.header_len, hdr.header_len);
        assert_eq!(decoded.data_len, hdr.data_len);
    }

    #[test]
    fn rejects_payload_on_control_messages() {
        let hdr = WireHeader {
            id: MessageId::random(),
            serial: 0,
            msg_type: MessageType::ACK,
            header_len: 0,
            data_len: 1,
        };
        assert_eq!(
            hdr.validate_control_shape().unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
    }

    #[test]
    fn rejects_req_ack_on_noop() {
        let hdr = WireHeader {
            id: MessageId::random(),
            serial: 0,
            msg_type: MessageType::NOOP | MessageType::REQ_ACK,
            header_len: 0,
            data_len: 0,
        };
        assert_eq!(
            hdr.validate_control_shape().unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
    }

    #[test]
    fn handshake_roundtrips() {
        let identity = [7u8; 16];
        let buf = encode_handshake(4000, identity);
        let (port, id) = decode_handshake(&buf).unwrap();
        assert_eq!(port, 4000);
        assert_eq!(id, identity);
    }

    #[test]
    fn empty_req_ack_message_is_well_formed() {
        let msg = Message::new(peer(), MessageType::REQ_ACK, Vec::new(), Vec::new());
        assert_eq!(msg.total_len(), 0);
        assert!(msg.msg_type.contains(MessageType::REQ_ACK));
    }
}
