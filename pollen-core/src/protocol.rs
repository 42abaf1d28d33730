//! PDU layer: INTEREST / OFFER / ASSIMILATE protocol units.
//! Framing: length-prefix (4 bytes LE) + one command tag byte + bincode body.

use serde::{Deserialize, Serialize};

use crate::era::Era;

/// Current protocol version, exchanged implicitly through frame shape.
pub const PROTOCOL_VERSION: u8 = 1;

/// Command tags on the wire.
pub const INTEREST_CMD: u8 = 1;
pub const OFFER_CMD: u8 = 2;
pub const ASSIMILATE_CMD: u8 = 3;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Fields common to every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PduHeader {
    pub sender: String,
    pub recipient: Option<String>,
    pub format: String,
    pub uri: Option<String>,
    pub era: Option<Era>,
    /// Whether this unit is cryptographically signed. Carried, not enforced.
    pub signed: bool,
}

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    /// Ask the peer for data in a format, optionally narrowed to uri/era.
    Interest(PduHeader),
    /// Advertise a chunk the sender holds.
    Offer(PduHeader),
    /// Carry serialized chunk units (codec payload) for assimilation.
    Assimilate { header: PduHeader, payload: Vec<u8> },
    /// Unrecognized command tag. Logged and discarded by the dispatcher;
    /// never terminates the connection.
    Unknown(u8),
}

impl Pdu {
    pub fn header(&self) -> Option<&PduHeader> {
        match self {
            Pdu::Interest(h) | Pdu::Offer(h) => Some(h),
            Pdu::Assimilate { header, .. } => Some(header),
            Pdu::Unknown(_) => None,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Pdu::Interest(_) => "INTEREST",
            Pdu::Offer(_) => "OFFER",
            Pdu::Assimilate { .. } => "ASSIMILATE",
            Pdu::Unknown(_) => "UNKNOWN",
        }
    }
}

/// Error encoding a PDU into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("unknown command cannot be encoded")]
    UnknownCommand,
}

/// Encode a PDU into a single frame: 4 bytes LE length + tag + bincode body.
pub fn encode_frame(pdu: &Pdu) -> Result<Vec<u8>, FrameEncodeError> {
    let (tag, body) = match pdu {
        Pdu::Interest(h) => (INTEREST_CMD, bincode::serialize(h)?),
        Pdu::Offer(h) => (OFFER_CMD, bincode::serialize(h)?),
        Pdu::Assimilate { header, payload } => {
            (ASSIMILATE_CMD, bincode::serialize(&(header, payload))?)
        }
        Pdu::Unknown(_) => return Err(FrameEncodeError::UnknownCommand),
    };
    let len = (1 + body.len()) as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + 1 + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("empty frame")]
    Empty,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Decode one frame from the front of `bytes`. Returns the PDU and the number
/// of bytes consumed. Call with a partial buffer; `NeedMore` means try again
/// after more data arrived.
pub fn decode_frame(bytes: &[u8]) -> Result<(Pdu, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let len = len as usize;
    if len == 0 {
        return Err(FrameDecodeError::Empty);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let tag = bytes[LEN_SIZE];
    let body = &bytes[LEN_SIZE + 1..LEN_SIZE + len];
    let pdu = match tag {
        INTEREST_CMD => Pdu::Interest(bincode::deserialize(body)?),
        OFFER_CMD => Pdu::Offer(bincode::deserialize(body)?),
        ASSIMILATE_CMD => {
            let (header, payload): (PduHeader, Vec<u8>) = bincode::deserialize(body)?;
            Pdu::Assimilate { header, payload }
        }
        other => Pdu::Unknown(other),
    };
    Ok((pdu, LEN_SIZE + len))
}
