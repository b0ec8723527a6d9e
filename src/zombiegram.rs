//! Zombiegram wire codec: authenticated header + opcode-typed payloads.
//!
//! A Zombiegram is a single LoRa datagram of at most 64 bytes. The 10-byte
//! header carries a truncated HMAC-SHA256 tag, the originator's source id, a
//! wrapping sequence number and a flag byte; the payload area is a
//! concatenation of `opcode || body` records. Layout (big-endian):
//!
//! ```text
//! [hmac: 4][source_id: 4][seq_num: 1][flags: 1][opcode: 1][body: ..] ...
//! ```
//!
//! Outbound frames are assembled through [`ZombiegramBuilder`] and turned
//! into an immutable [`Zombiegram`] by [`ZombiegramBuilder::sign`]; inbound
//! frames come from [`Zombiegram::from_bytes`]. Mutating a signed frame is
//! therefore unrepresentable rather than a runtime error.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::errors::{UsmsError, ZombiegramError};
use crate::usms;

type HmacSha256 = Hmac<Sha256>;

/// Maximum on-wire size of a Zombiegram.
pub const MAX_FRAME_SIZE: usize = 64;
/// Fixed header size (hmac + source_id + seq_num + flags).
pub const HEADER_SIZE: usize = 10;

/// Signed message authenticated by a network-change payload:
/// `signed_source_id = HMAC-SHA256(trust_key, 0x807D)[0..4]`.
const NETWORK_CHANGE_MESSAGE: [u8; 2] = [0x80, 0x7d];

const TAMPERED_FLAG: u8 = 1 << 2;
const MAINTENANCE_FLAG: u8 = 1 << 3;

fn truncated_hmac(key: &[u8], message: &[u8]) -> u32 {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    let digest = mac.finalize().into_bytes();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Propagation priority, low to urgent. Urgent frames demand broader mesh
/// coverage before their retransmission is considered satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl TryFrom<u8> for Priority {
    type Error = ZombiegramError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            3 => Ok(Self::Urgent),
            other => Err(ZombiegramError::FieldOutOfRange {
                field: "priority",
                value: u32::from(other),
            }),
        }
    }
}

/// Position of a node in the mesh topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    Child = 0,
    Router = 1,
    Leader = 2,
}

impl TryFrom<u8> for NetworkRole {
    type Error = ZombiegramError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Child),
            1 => Ok(Self::Router),
            2 => Ok(Self::Leader),
            other => Err(ZombiegramError::FieldOutOfRange {
                field: "network_role",
                value: u32::from(other),
            }),
        }
    }
}

/// Per-opcode wire facts. The parser and the encoder both consult this table;
/// the opcode is the index.
struct OpcodeSpec {
    combinable: bool,
    /// Body size for fixed-length payloads; `None` for the variable-length
    /// USMS payload, which consumes the remainder of the frame.
    fixed_size: Option<usize>,
}

const OPCODE_TABLE: [OpcodeSpec; 5] = [
    // 0: acknowledge
    OpcodeSpec { combinable: false, fixed_size: Some(5) },
    // 1: network change
    OpcodeSpec { combinable: false, fixed_size: Some(4) },
    // 2: detection
    OpcodeSpec { combinable: true, fixed_size: Some(2) },
    // 3: usms
    OpcodeSpec { combinable: false, fixed_size: None },
    // 4: diagnostic
    OpcodeSpec { combinable: true, fixed_size: Some(23) },
];

/// Diagnostic information reported by network elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub gps_latitude: f32,
    pub gps_longitude: f32,
    /// Up to three best neighbor source ids; absent slots encode as zero.
    pub best_neighbors: Vec<u32>,
    /// Battery level 0..=100; 101 is reserved for "unknown".
    pub battery_status: u8,
    pub network_role: NetworkRole,
    pub is_sensor: bool,
    pub is_router: bool,
    pub is_gateway: bool,
    /// Attached sensor id; 0 means no sensor.
    pub sensor_id: u8,
}

impl Diagnostic {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gps_coordinates: (f32, f32),
        best_neighbors: Vec<u32>,
        battery_status: u8,
        network_role: NetworkRole,
        is_sensor: bool,
        is_router: bool,
        is_gateway: bool,
        sensor_id: u8,
    ) -> Result<Self, ZombiegramError> {
        if battery_status > 101 {
            return Err(ZombiegramError::FieldOutOfRange {
                field: "battery_status",
                value: u32::from(battery_status),
            });
        }
        if best_neighbors.len() > 3 {
            return Err(ZombiegramError::FieldOutOfRange {
                field: "best_neighbors",
                value: best_neighbors.len() as u32,
            });
        }
        Ok(Self {
            gps_latitude: gps_coordinates.0,
            gps_longitude: gps_coordinates.1,
            best_neighbors,
            battery_status,
            network_role,
            is_sensor,
            is_router,
            is_gateway,
            sensor_id,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.gps_latitude.to_be_bytes());
        out.extend_from_slice(&self.gps_longitude.to_be_bytes());
        for slot in 0..3 {
            let id = self.best_neighbors.get(slot).copied().unwrap_or(0);
            out.extend_from_slice(&id.to_be_bytes());
        }
        out.push(self.battery_status);
        out.push(self.sensor_id);
        let mut roles = self.network_role as u8;
        roles |= (self.is_sensor as u8) << 2;
        roles |= (self.is_router as u8) << 3;
        roles |= (self.is_gateway as u8) << 4;
        out.push(roles);
    }

    fn decode(body: &[u8]) -> Result<Self, ZombiegramError> {
        let gps_latitude = f32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let gps_longitude = f32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        let mut best_neighbors = Vec::new();
        for slot in 0..3 {
            let off = 8 + slot * 4;
            let id = u32::from_be_bytes([body[off], body[off + 1], body[off + 2], body[off + 3]]);
            if id != 0 {
                best_neighbors.push(id);
            }
        }
        let battery_status = body[20];
        let sensor_id = body[21];
        let roles = body[22];
        Self::new(
            (gps_latitude, gps_longitude),
            best_neighbors,
            battery_status,
            NetworkRole::try_from(roles & 0x03)?,
            roles & (1 << 2) != 0,
            roles & (1 << 3) != 0,
            roles & (1 << 4) != 0,
            sensor_id,
        )
    }
}

/// Payload variants, one per opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Acknowledges `(source_id, seq_num)` towards the originator. Opcode 0.
    Acknowledge { source_id: u32, seq_num: u8 },
    /// Announces a trust-key compromise across the mesh. Opcode 1.
    NetworkChange { signed_source_id: [u8; 4] },
    /// Movement/presence detection event. Opcode 2.
    Detection { confidence: u8, hitcounter: u8 },
    /// Human text message in the packed 6-bit USMS encoding. Opcode 3.
    Usms { text: String, packed: Vec<u8> },
    /// Node diagnostics. Opcode 4.
    Diagnostic(Diagnostic),
}

impl Payload {
    /// Build a detection payload. `confidence` is a percentage.
    pub fn detection(confidence: u8, hitcounter: u8) -> Result<Self, ZombiegramError> {
        if confidence > 100 {
            return Err(ZombiegramError::FieldOutOfRange {
                field: "confidence_percentage",
                value: u32::from(confidence),
            });
        }
        Ok(Self::Detection { confidence, hitcounter })
    }

    /// Build a USMS payload from an ASCII message of at most 70 characters.
    pub fn usms(text: &str) -> Result<Self, UsmsError> {
        if text.chars().count() > usms::MAX_CHARS {
            return Err(UsmsError::SizeTooLarge {
                given: text.chars().count(),
                max: usms::MAX_CHARS,
            });
        }
        let packed = usms::encode(text)?;
        Ok(Self::Usms { text: text.to_string(), packed })
    }

    /// Build a network-change payload by signing the fixed announcement
    /// message with the (compromised) trust key.
    pub fn network_change_from_key(trust_key: &[u8]) -> Self {
        let signed = truncated_hmac(trust_key, &NETWORK_CHANGE_MESSAGE);
        Self::NetworkChange { signed_source_id: signed.to_be_bytes() }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Self::Acknowledge { .. } => 0,
            Self::NetworkChange { .. } => 1,
            Self::Detection { .. } => 2,
            Self::Usms { .. } => 3,
            Self::Diagnostic(_) => 4,
        }
    }

    fn spec(&self) -> &'static OpcodeSpec {
        &OPCODE_TABLE[self.opcode() as usize]
    }

    /// Whether this payload may share a frame with others.
    pub fn combinable(&self) -> bool {
        self.spec().combinable
    }

    /// Body size on the wire, without the opcode byte.
    pub fn wire_size(&self) -> usize {
        match self {
            Self::Usms { packed, .. } => packed.len(),
            other => other.spec().fixed_size.unwrap_or(0),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Acknowledge { source_id, seq_num } => {
                out.extend_from_slice(&source_id.to_be_bytes());
                out.push(*seq_num);
            }
            Self::NetworkChange { signed_source_id } => {
                out.extend_from_slice(signed_source_id);
            }
            Self::Detection { confidence, hitcounter } => {
                out.push(*confidence);
                out.push(*hitcounter);
            }
            Self::Usms { packed, .. } => out.extend_from_slice(packed),
            Self::Diagnostic(diag) => diag.encode_into(out),
        }
    }

    /// Decode one payload body. Returns the payload and the number of bytes
    /// consumed from `body`.
    fn decode(opcode: u8, body: &[u8]) -> Result<(Self, usize), ZombiegramError> {
        let spec = OPCODE_TABLE
            .get(opcode as usize)
            .ok_or(ZombiegramError::UnknownOpcode(opcode))?;
        if let Some(size) = spec.fixed_size {
            if body.len() < size {
                return Err(ZombiegramError::Truncated { opcode });
            }
        }
        match opcode {
            0 => {
                let source_id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                Ok((Self::Acknowledge { source_id, seq_num: body[4] }, 5))
            }
            1 => {
                let signed_source_id = [body[0], body[1], body[2], body[3]];
                Ok((Self::NetworkChange { signed_source_id }, 4))
            }
            2 => Ok((Self::detection(body[0], body[1])?, 2)),
            3 => {
                let text = usms::decode(body)?;
                Ok((Self::Usms { text, packed: body.to_vec() }, body.len()))
            }
            _ => Ok((Self::Diagnostic(Diagnostic::decode(body)?), 23)),
        }
    }

    /// JSON shape consumed by the gateway webhooks.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Acknowledge { source_id, seq_num } => json!({
                "source_id": source_id,
                "seq_num": seq_num,
            }),
            Self::NetworkChange { .. } => json!({}),
            Self::Detection { confidence, hitcounter } => json!({
                "confidence_percentage": confidence,
                "hitcounter": hitcounter,
            }),
            Self::Usms { text, .. } => json!({ "ascii_text": text }),
            Self::Diagnostic(diag) => json!({
                "gps_coordinates": [diag.gps_latitude, diag.gps_longitude],
                "best_neighbors": diag.best_neighbors,
                "battery_status": diag.battery_status,
                "network_role": diag.network_role as u8,
                "is_sensor": diag.is_sensor,
                "is_router": diag.is_router,
                "is_gateway": diag.is_gateway,
                "sensor_id": diag.sensor_id,
            }),
        }
    }
}

/// Mutable outbound frame under construction. Consumed by [`Self::sign`].
#[derive(Debug)]
pub struct ZombiegramBuilder {
    source_id: u32,
    seq_num: u8,
    priority: Priority,
    tampered: bool,
    maintenance: bool,
    payloads: Vec<Payload>,
    size: usize,
}

impl ZombiegramBuilder {
    pub fn new(source_id: u32, seq_num: u8) -> Self {
        Self {
            source_id,
            seq_num,
            priority: Priority::Normal,
            tampered: false,
            maintenance: false,
            payloads: Vec::new(),
            size: HEADER_SIZE,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn tampered(mut self, tampered: bool) -> Self {
        self.tampered = tampered;
        self
    }

    pub fn maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    /// Append a payload record.
    ///
    /// # Errors
    /// [`ZombiegramError::PiggybackProhibited`] when the frame already holds a
    /// non-combinable payload or `payload` itself refuses company;
    /// [`ZombiegramError::PayloadOverflow`] past the 64-byte limit.
    pub fn add_payload(&mut self, payload: Payload) -> Result<(), ZombiegramError> {
        if !payload.combinable() && !self.payloads.is_empty() {
            return Err(ZombiegramError::PiggybackProhibited);
        }
        if self.payloads.first().map_or(false, |first| !first.combinable()) {
            return Err(ZombiegramError::PiggybackProhibited);
        }
        let added = 1 + payload.wire_size();
        if self.size + added > MAX_FRAME_SIZE {
            return Err(ZombiegramError::PayloadOverflow {
                current: self.size,
                payload: payload.wire_size(),
            });
        }
        self.size += added;
        self.payloads.push(payload);
        Ok(())
    }

    /// Sign the frame and freeze it.
    ///
    /// With a non-empty `trust_key` the hmac field becomes the first 4 bytes
    /// of `HMAC-SHA256(trust_key, frame[4..])`; without one the all-zero
    /// sentinel marks the frame as unsigned.
    pub fn sign(self, trust_key: Option<&[u8]>) -> Zombiegram {
        let mut buf = Vec::with_capacity(self.size);
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.source_id.to_be_bytes());
        buf.push(self.seq_num);
        let mut flags = self.priority as u8;
        if self.tampered {
            flags |= TAMPERED_FLAG;
        }
        if self.maintenance {
            flags |= MAINTENANCE_FLAG;
        }
        buf.push(flags);
        for payload in &self.payloads {
            buf.push(payload.opcode());
            payload.encode_into(&mut buf);
        }

        let hmac = match trust_key {
            Some(key) if !key.is_empty() => truncated_hmac(key, &buf[4..]),
            _ => 0,
        };
        buf[0..4].copy_from_slice(&hmac.to_be_bytes());

        Zombiegram {
            hmac,
            source_id: self.source_id,
            seq_num: self.seq_num,
            priority: self.priority,
            tampered: self.tampered,
            maintenance: self.maintenance,
            payloads: self.payloads,
            bytes: Bytes::from(buf),
        }
    }
}

/// Immutable, wire-complete Zombiegram. Obtained by signing a builder or by
/// parsing received bytes; its cached byte representation is cheap to clone
/// into the retransmission cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Zombiegram {
    hmac: u32,
    source_id: u32,
    seq_num: u8,
    priority: Priority,
    tampered: bool,
    maintenance: bool,
    payloads: Vec<Payload>,
    bytes: Bytes,
}

impl Zombiegram {
    /// Parse a received frame.
    ///
    /// Payload parsing terminates when the input is exhausted or after a
    /// non-combinable payload has been consumed.
    ///
    /// # Errors
    /// [`ZombiegramError`] when the frame is shorter than the header plus one
    /// payload byte, longer than 64 bytes, carries an unknown opcode or a
    /// truncated or out-of-range payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ZombiegramError> {
        if data.len() <= HEADER_SIZE {
            return Err(ZombiegramError::TooShort { len: data.len() });
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(ZombiegramError::Oversize { len: data.len() });
        }

        let hmac = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let source_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let seq_num = data[8];
        let flags = data[9];
        let priority = match flags & 0x03 {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Urgent,
        };
        let tampered = flags & TAMPERED_FLAG != 0;
        let maintenance = flags & MAINTENANCE_FLAG != 0;

        let mut payloads = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < data.len() {
            let opcode = data[offset];
            offset += 1;
            let (payload, consumed) = Payload::decode(opcode, &data[offset..])?;
            offset += consumed;
            let terminal = !payload.combinable();
            payloads.push(payload);
            if terminal {
                break;
            }
        }

        Ok(Self {
            hmac,
            source_id,
            seq_num,
            priority,
            tampered,
            maintenance,
            payloads,
            bytes: Bytes::copy_from_slice(data),
        })
    }

    pub fn hmac(&self) -> u32 {
        self.hmac
    }

    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    pub fn seq_num(&self) -> u8 {
        self.seq_num
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn tampered(&self) -> bool {
        self.tampered
    }

    pub fn maintenance(&self) -> bool {
        self.maintenance
    }

    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    /// Cached wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Verify the frame against a trust key.
    ///
    /// Unsigned frames are never trusted: an empty or absent key yields
    /// `false` even when the stored tag is the all-zero sentinel.
    pub fn is_trusted(&self, trust_key: Option<&[u8]>) -> bool {
        let key = match trust_key {
            Some(key) if !key.is_empty() => key,
            _ => return false,
        };
        truncated_hmac(key, &self.bytes[4..]) == self.hmac
    }

    /// JSON document POSTed to gateway webhooks.
    pub fn to_bridge_json(&self, trusted: bool) -> Value {
        json!({
            "source_id": self.source_id,
            "priority": self.priority as u8,
            "tampered": self.tampered,
            "maintenance": self.maintenance,
            "trusted": trusted,
            "payloads": self.payloads.iter().map(Payload::to_json).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn detection_frame(trust_key: Option<&[u8]>) -> Zombiegram {
        let mut builder = ZombiegramBuilder::new(0x0000_0003, 2).priority(Priority::Urgent);
        builder.add_payload(Payload::detection(50, 1).unwrap()).unwrap();
        builder.sign(trust_key)
    }

    #[test]
    fn unsigned_frame_has_exact_bytes() {
        let zg = detection_frame(None);
        assert_eq!(hex::encode(zg.as_bytes()), "00000000000000030203023201");
    }

    #[test]
    fn sign_and_parse_urgent_detection() {
        let zg = detection_frame(Some(b"test"));
        let parsed = Zombiegram::from_bytes(zg.as_bytes()).unwrap();
        assert!(parsed.is_trusted(Some(b"test")));
        assert!(!parsed.is_trusted(Some(b"wrong")));
        assert_eq!(parsed.source_id(), 3);
        assert_eq!(parsed.seq_num(), 2);
        assert_eq!(parsed.priority(), Priority::Urgent);
        assert!(!parsed.tampered());
        assert!(!parsed.maintenance());
        assert_eq!(parsed.payloads(), &[Payload::detection(50, 1).unwrap()]);
    }

    #[test]
    fn empty_key_signs_with_zero_sentinel() {
        let zg = detection_frame(Some(b""));
        assert_eq!(zg.hmac(), 0);
        assert_eq!(&zg.as_bytes()[0..4], &[0, 0, 0, 0]);
        assert!(!zg.is_trusted(None));
        assert!(!zg.is_trusted(Some(b"")));
        assert!(!zg.is_trusted(Some(b"anything")));
    }

    #[test]
    fn flag_bits_round_trip() {
        let zg = ZombiegramBuilder::new(9, 7)
            .priority(Priority::High)
            .tampered(true)
            .maintenance(true)
            .sign(None);
        // flags byte: priority 2 | tampered 4 | maintenance 8
        assert_eq!(zg.as_bytes()[9], 0x0e);
        // A bare header is not parseable (no payload), check via a detection.
        let mut builder = ZombiegramBuilder::new(9, 7).priority(Priority::High).tampered(true);
        builder.add_payload(Payload::detection(1, 1).unwrap()).unwrap();
        let parsed = Zombiegram::from_bytes(builder.sign(None).as_bytes()).unwrap();
        assert_eq!(parsed.priority(), Priority::High);
        assert!(parsed.tampered());
        assert!(!parsed.maintenance());
    }

    #[test]
    fn piggyback_rules() {
        let ack = Payload::Acknowledge { source_id: 3, seq_num: 255 };
        let detection = Payload::detection(50, 1).unwrap();

        // A non-combinable payload refuses company in either order.
        let mut builder = ZombiegramBuilder::new(1, 0);
        builder.add_payload(ack.clone()).unwrap();
        assert_eq!(
            builder.add_payload(detection.clone()),
            Err(ZombiegramError::PiggybackProhibited)
        );

        let mut builder = ZombiegramBuilder::new(1, 0);
        builder.add_payload(detection.clone()).unwrap();
        assert_eq!(builder.add_payload(ack), Err(ZombiegramError::PiggybackProhibited));

        // Combinable payloads piggyback freely.
        let mut builder = ZombiegramBuilder::new(1, 0);
        builder.add_payload(detection.clone()).unwrap();
        builder.add_payload(detection).unwrap();
        let diag = Diagnostic::new((1.1, 2.2), vec![0x1111_1111], 97, NetworkRole::Router, false, false, false, 112)
            .unwrap();
        builder.add_payload(Payload::Diagnostic(diag)).unwrap();
        let zg = builder.sign(Some(b"test"));
        let parsed = Zombiegram::from_bytes(zg.as_bytes()).unwrap();
        assert_eq!(parsed.payloads().len(), 3);
    }

    #[test]
    fn payload_overflow_is_rejected() {
        // 70 chars pack into 53 bytes: 10 + 1 + 53 fills the frame exactly.
        let text: String = std::iter::repeat('a').take(70).collect();
        let usms = Payload::usms(&text).unwrap();
        assert_eq!(usms.wire_size(), 53);
        let mut builder = ZombiegramBuilder::new(1, 0);
        builder.add_payload(usms).unwrap();
        let zg = builder.sign(None);
        assert_eq!(zg.as_bytes().len(), MAX_FRAME_SIZE);

        // One diagnostic too many overflows.
        let mut builder = ZombiegramBuilder::new(1, 0);
        let diag = Diagnostic::new((0.0, 0.0), vec![], 100, NetworkRole::Child, false, false, false, 0).unwrap();
        builder.add_payload(Payload::Diagnostic(diag.clone())).unwrap();
        builder.add_payload(Payload::Diagnostic(diag.clone())).unwrap();
        assert!(matches!(
            builder.add_payload(Payload::Diagnostic(diag)),
            Err(ZombiegramError::PayloadOverflow { .. })
        ));
    }

    #[test]
    fn oversize_usms_is_rejected() {
        let text: String = std::iter::repeat('a').take(71).collect();
        assert_eq!(
            Payload::usms(&text),
            Err(UsmsError::SizeTooLarge { given: 71, max: 70 })
        );
    }

    #[test]
    fn usms_text_round_trips_through_frame() {
        let mut builder = ZombiegramBuilder::new(42, 1).priority(Priority::High);
        builder.add_payload(Payload::usms("help zombies at the mall").unwrap()).unwrap();
        let zg = builder.sign(Some(b"test"));
        let parsed = Zombiegram::from_bytes(zg.as_bytes()).unwrap();
        match &parsed.payloads()[0] {
            Payload::Usms { text, .. } => assert_eq!(text, "help zombies at the mall"),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(parsed.is_trusted(Some(b"test")));
    }

    #[test]
    fn network_change_derivation_is_key_bound() {
        let a = Payload::network_change_from_key(b"test");
        let b = Payload::network_change_from_key(b"test");
        let c = Payload::network_change_from_key(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut builder = ZombiegramBuilder::new(5, 0);
        builder.add_payload(a.clone()).unwrap();
        let parsed = Zombiegram::from_bytes(builder.sign(Some(b"test")).as_bytes()).unwrap();
        assert_eq!(parsed.payloads(), &[a]);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        // Header only, no payload.
        assert_eq!(
            Zombiegram::from_bytes(&[0u8; 10]),
            Err(ZombiegramError::TooShort { len: 10 })
        );
        // Over the wire maximum.
        assert_eq!(
            Zombiegram::from_bytes(&[0u8; 65]),
            Err(ZombiegramError::Oversize { len: 65 })
        );
        // Unknown opcodes, including the first one past the table.
        let mut frame = vec![0u8; 10];
        frame.push(5);
        assert_eq!(Zombiegram::from_bytes(&frame), Err(ZombiegramError::UnknownOpcode(5)));
        frame[10] = 0x0b;
        frame.push(0);
        assert_eq!(Zombiegram::from_bytes(&frame), Err(ZombiegramError::UnknownOpcode(0x0b)));
        // Truncated diagnostic body.
        let mut frame = vec![0u8; 10];
        frame.push(4);
        frame.extend_from_slice(&[0u8; 10]);
        assert_eq!(Zombiegram::from_bytes(&frame), Err(ZombiegramError::Truncated { opcode: 4 }));
    }

    #[test]
    fn parsing_stops_after_terminal_payload() {
        // An acknowledge payload ends the frame; trailing bytes are ignored.
        let mut builder = ZombiegramBuilder::new(1, 9);
        builder.add_payload(Payload::Acknowledge { source_id: 7, seq_num: 3 }).unwrap();
        let mut bytes = builder.sign(None).as_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff]);
        let parsed = Zombiegram::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.payloads(), &[Payload::Acknowledge { source_id: 7, seq_num: 3 }]);
    }

    #[test]
    fn detection_confidence_is_validated() {
        assert!(matches!(
            Payload::detection(101, 0),
            Err(ZombiegramError::FieldOutOfRange { field: "confidence_percentage", .. })
        ));
        // And on the parse side too.
        let mut frame = vec![0u8; 10];
        frame.extend_from_slice(&[2, 101, 0]);
        assert!(matches!(
            Zombiegram::from_bytes(&frame),
            Err(ZombiegramError::FieldOutOfRange { field: "confidence_percentage", .. })
        ));
    }

    #[test]
    fn bridge_json_shape() {
        let mut builder = ZombiegramBuilder::new(3, 2).priority(Priority::Urgent).tampered(true);
        builder.add_payload(Payload::detection(50, 1).unwrap()).unwrap();
        let zg = builder.sign(Some(b"test"));
        let doc = zg.to_bridge_json(true);
        assert_eq!(doc["source_id"], 3);
        assert_eq!(doc["priority"], 3);
        assert_eq!(doc["tampered"], true);
        assert_eq!(doc["maintenance"], false);
        assert_eq!(doc["trusted"], true);
        assert_eq!(doc["payloads"][0]["confidence_percentage"], 50);
        assert_eq!(doc["payloads"][0]["hitcounter"], 1);
    }

    fn arb_detection() -> impl Strategy<Value = Payload> {
        (0u8..=100, any::<u8>()).prop_map(|(confidence, hitcounter)| {
            Payload::detection(confidence, hitcounter).unwrap()
        })
    }

    fn arb_role() -> impl Strategy<Value = NetworkRole> {
        prop_oneof![
            Just(NetworkRole::Child),
            Just(NetworkRole::Router),
            Just(NetworkRole::Leader),
        ]
    }

    fn arb_diagnostic() -> impl Strategy<Value = Payload> {
        (
            -90.0f32..=90.0,
            -180.0f32..=180.0,
            proptest::collection::vec(1u32.., 0..=3),
            0u8..=101,
            arb_role(),
            any::<(bool, bool, bool)>(),
            any::<u8>(),
        )
            .prop_map(|(lat, lon, neighbors, battery, role, (s, r, g), sensor_id)| {
                Payload::Diagnostic(
                    Diagnostic::new((lat, lon), neighbors, battery, role, s, r, g, sensor_id).unwrap(),
                )
            })
    }

    fn arb_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Urgent),
        ]
    }

    proptest! {
        // Any combinable payload set that fits signs, parses back to an
        // equivalent frame and verifies under the signing key.
        #[test]
        fn prop_sign_parse_round_trip(
            source_id in any::<u32>(),
            seq_num in any::<u8>(),
            priority in arb_priority(),
            tampered in any::<bool>(),
            maintenance in any::<bool>(),
            detections in proptest::collection::vec(arb_detection(), 0..=4),
            diagnostic in proptest::option::of(arb_diagnostic()),
        ) {
            let mut payloads = detections;
            if let Some(diag) = diagnostic {
                payloads.push(diag);
            }
            prop_assume!(!payloads.is_empty());

            let mut builder = ZombiegramBuilder::new(source_id, seq_num)
                .priority(priority)
                .tampered(tampered)
                .maintenance(maintenance);
            for payload in &payloads {
                builder.add_payload(payload.clone()).unwrap();
            }
            let zg = builder.sign(Some(b"test"));
            prop_assert!(zg.as_bytes().len() <= MAX_FRAME_SIZE);

            let parsed = Zombiegram::from_bytes(zg.as_bytes()).unwrap();
            prop_assert_eq!(parsed.source_id(), source_id);
            prop_assert_eq!(parsed.seq_num(), seq_num);
            prop_assert_eq!(parsed.priority(), priority);
            prop_assert_eq!(parsed.tampered(), tampered);
            prop_assert_eq!(parsed.maintenance(), maintenance);
            prop_assert_eq!(parsed.payloads(), payloads.as_slice());
            prop_assert!(parsed.is_trusted(Some(b"test")));
            prop_assert!(!parsed.is_trusted(Some(b"wrong")));
        }
    }
}
