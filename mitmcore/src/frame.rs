use log::trace;
use openssl::hash::{hash, MessageDigest};
use std::convert::TryFrom;
use std::fmt;
use thiserror::Error;

pub const FRAME_MAGIC: [u8; 4] = *b"NFCG";
pub const SESSION_ID_LEN: usize = 16;
pub const CHECKSUM_LEN: usize = 4;

/// Bytes of the length-covered remainder that are not payload:
/// session id, kind byte and trailing checksum.
pub const FRAME_OVERHEAD: usize = SESSION_ID_LEN + 1 + CHECKSUM_LEN;

/// Ceiling for the length field; anything larger is a malformed frame.
pub const MAX_FRAME_REMAINDER: usize = 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Init = 0x01,
    NfcData = 0x02,
    Status = 0x03,
    Config = 0x04,
    Error = 0x05,
    Heartbeat = 0x06,
    Relay = 0x07,
    Emulation = 0x08,
}

impl From<MessageKind> for u8 {
    fn from(orig: MessageKind) -> Self {
        match orig {
            MessageKind::Init => 0x01,
            MessageKind::NfcData => 0x02,
            MessageKind::Status => 0x03,
            MessageKind::Config => 0x04,
            MessageKind::Error => 0x05,
            MessageKind::Heartbeat => 0x06,
            MessageKind::Relay => 0x07,
            MessageKind::Emulation => 0x08,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(orig: u8) -> Result<Self, u8> {
        match orig {
            0x01 => Ok(MessageKind::Init),
            0x02 => Ok(MessageKind::NfcData),
            0x03 => Ok(MessageKind::Status),
            0x04 => Ok(MessageKind::Config),
            0x05 => Ok(MessageKind::Error),
            0x06 => Ok(MessageKind::Heartbeat),
            0x07 => Ok(MessageKind::Relay),
            0x08 => Ok(MessageKind::Emulation),
            _ => Err(orig),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MessageKind::Init => "INIT",
            MessageKind::NfcData => "NFC_DATA",
            MessageKind::Status => "STATUS",
            MessageKind::Config => "CONFIG",
            MessageKind::Error => "ERROR",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::Relay => "RELAY",
            MessageKind::Emulation => "EMULATION",
        };
        write!(f, "{}", name)
    }
}

/// One outer relay frame. `session_id` is opaque to the proxy and echoed
/// verbatim into every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapper {
    pub session_id: [u8; SESSION_ID_LEN],
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Wrapper {
    pub fn new(session_id: [u8; SESSION_ID_LEN], kind: MessageKind, payload: Vec<u8>) -> Wrapper {
        Wrapper {
            session_id,
            kind,
            payload,
        }
    }

    pub fn session_hex(&self) -> String {
        hex::encode_upper(self.session_id)
    }
}

/// Frame integrity function. The upstream protocol truncates MD5 to four
/// bytes; the seam exists so a different integrity scheme can be swapped in
/// without touching the codec.
pub trait FrameChecksum: Send + Sync {
    fn digest(&self, data: &[u8]) -> [u8; CHECKSUM_LEN];
}

pub struct Md5Checksum;

impl FrameChecksum for Md5Checksum {
    fn digest(&self, data: &[u8]) -> [u8; CHECKSUM_LEN] {
        let digest = hash(MessageDigest::md5(), data).expect("MD5 digest");
        let mut out = [0u8; CHECKSUM_LEN];
        out.copy_from_slice(&digest[..CHECKSUM_LEN]);
        out
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame magic {0:02X?} is not NFCG")]
    BadMagic([u8; 4]),

    #[error("frame length {0} outside the valid range")]
    BadLength(u32),

    #[error("frame shorter than its declared length")]
    Truncated,

    #[error("frame checksum mismatch (carried {carried}, computed {computed})")]
    ChecksumMismatch { carried: String, computed: String },

    #[error("unknown message kind {0:#04X}")]
    UnknownKind(u8),
}

/// Serialize one frame, recomputing length and checksum.
pub fn encode_frame(wrapper: &Wrapper, checksum: &dyn FrameChecksum) -> Vec<u8> {
    let remainder = FRAME_OVERHEAD + wrapper.payload.len();

    let mut buf: Vec<u8> = Vec::with_capacity(8 + remainder);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&(remainder as u32).to_be_bytes());
    buf.extend_from_slice(&wrapper.session_id);
    buf.push(wrapper.kind.into());
    buf.extend_from_slice(&wrapper.payload);

    let digest = checksum.digest(&buf);
    buf.extend_from_slice(&digest);

    trace!(
        "encoded {} frame, session {}, {} payload bytes",
        wrapper.kind,
        wrapper.session_hex(),
        wrapper.payload.len()
    );

    buf
}

/// Parse one complete frame (magic through checksum). The checksum covers
/// magic, length, session id, kind and payload.
pub fn decode_frame(buf: &[u8], checksum: &dyn FrameChecksum) -> Result<Wrapper, FrameError> {
    if buf.len() < 8 {
        return Err(FrameError::Truncated);
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[..4]);
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }

    let remainder = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if (remainder as usize) < FRAME_OVERHEAD || remainder as usize > MAX_FRAME_REMAINDER {
        return Err(FrameError::BadLength(remainder));
    }
    if buf.len() != 8 + remainder as usize {
        return Err(FrameError::Truncated);
    }

    let checksum_at = buf.len() - CHECKSUM_LEN;
    let computed = checksum.digest(&buf[..checksum_at]);
    let carried = &buf[checksum_at..];
    if carried != &computed[..] {
        return Err(FrameError::ChecksumMismatch {
            carried: hex::encode_upper(carried),
            computed: hex::encode_upper(computed),
        });
    }

    let mut session_id = [0u8; SESSION_ID_LEN];
    session_id.copy_from_slice(&buf[8..8 + SESSION_ID_LEN]);

    let kind_byte = buf[8 + SESSION_ID_LEN];
    let kind = MessageKind::try_from(kind_byte).map_err(FrameError::UnknownKind)?;

    Ok(Wrapper {
        session_id,
        kind,
        payload: buf[8 + SESSION_ID_LEN + 1..checksum_at].to_vec(),
    })
}
