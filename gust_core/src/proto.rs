use crate::crash::Crasher;
use bincode::config::Configuration;
use bincode::{Decode, Encode};
use std::io::{Read, Write};
use thiserror::Error;

/// Hard ceiling on a single frame's payload. Inputs are bounded by the
/// mutation size limit, so anything near this is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: u32 = 64 << 20;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("protocol I/O error: {0}")]
    Io(String),

    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    Oversized(u32),

    #[error("frame encode error: {0}")]
    Encode(String),

    #[error("frame decode error: {0}")]
    Decode(String),
}

impl From<std::io::Error> for ProtoError {
    fn from(err: std::io::Error) -> Self {
        ProtoError::Io(err.to_string())
    }
}

/// Frame payload encoding: little-endian, fixed-width integers, so the
/// format is stable across peer architectures.
pub fn wire_config() -> Configuration<bincode::config::LittleEndian, bincode::config::Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// A coverage-novel input a worker forwards to the coordinator. The
/// signature carries the full sample bit set, not just the locally new
/// bits; the coordinator re-classifies against its own accumulator.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct NewInput {
    pub input: Vec<u8>,
    pub signature: Vec<u32>,
    pub verdict: i32,
    pub parentage: String,
}

/// Counter deltas accumulated since the worker's previous report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct StatsDelta {
    pub executions: u64,
    pub forced_restarts: u64,
    pub fault_restarts: u64,
    pub hangs: u64,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Request {
    /// First frame on a fresh connection.
    Hello { worker: String },
    /// Poll for peer discoveries without anything to report.
    GetWork,
    /// Periodic upload of local findings and counter deltas.
    ReportResult {
        new_inputs: Vec<NewInput>,
        crashers: Vec<Crasher>,
        stats: StatsDelta,
    },
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Response {
    /// Answers `Hello` with the coordinator's current corpus.
    Welcome { seeds: Vec<NewInput> },
    /// Answers `GetWork` with discoveries the worker has not seen yet.
    Work { discoveries: Vec<NewInput> },
    /// Answers `ReportResult`, likewise carrying fresh peer discoveries.
    Ack { discoveries: Vec<NewInput> },
}

/// Writes one length-prefixed frame: a u32 little-endian payload length
/// followed by the bincode payload.
pub fn write_frame<T: Encode>(stream: &mut impl Write, message: &T) -> Result<(), ProtoError> {
    let payload =
        bincode::encode_to_vec(message, wire_config()).map_err(|e| ProtoError::Encode(e.to_string()))?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtoError::Oversized(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::Oversized(len));
    }
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

/// Reads one frame written by [`write_frame`]. Rejects oversized lengths
/// before allocating.
pub fn read_frame<T: Decode<()>>(stream: &mut impl Read) -> Result<T, ProtoError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::Oversized(len));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    let (message, consumed) = bincode::decode_from_slice(&payload, wire_config())
        .map_err(|e| ProtoError::Decode(e.to_string()))?;
    if consumed != payload.len() {
        return Err(ProtoError::Decode(format!(
            "trailing garbage: {} of {} bytes consumed",
            consumed,
            payload.len()
        )));
    }
    Ok(message)
}
