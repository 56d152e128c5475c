//! The framing codec that carries TCP segments, UDP datagrams, and control
//! messages over a single ordered transport byte stream.
//!
//! Wire format (all multi-byte integers big-endian):
//! ```text
//! offset  bytes  field
//! 0       4      magic "AMB1"
//! 4       4      id
//! 8       4      flags
//! 12      4      len
//! 16      len    payload
//! ```

use bitflags::bitflags;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"AMB1";
const MAX_REALIGN_SCAN: usize = 1 << 20;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        const SYN  = 0x01;
        const FIN  = 0x02;
        const RST  = 0x04;
        const TCP  = 0x10;
        const UDP  = 0x20;
        const AUTH = 0x100;
        const INFO = 0x200;
        const PING = 0x400;
        const PONG = 0x800;
        const JSON = 0x1000;
    }
}

/// Renders the set bits as a `|`-joined debug string, e.g. `"TCP|SYN"`. Logging only.
pub fn flags_to_string(flags: Flags) -> String {
    const NAMED: &[(Flags, &str)] = &[
        (Flags::SYN, "SYN"),
        (Flags::FIN, "FIN"),
        (Flags::RST, "RST"),
        (Flags::TCP, "TCP"),
        (Flags::UDP, "UDP"),
        (Flags::AUTH, "AUTH"),
        (Flags::INFO, "INFO"),
        (Flags::PING, "PING"),
        (Flags::PONG, "PONG"),
        (Flags::JSON, "JSON"),
    ];
    let names: Vec<&str> = NAMED
        .iter()
        .filter(|(bit, _)| flags.contains(*bit))
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "NONE".to_string()
    } else {
        names.join("|")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub flags: Flags,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("underlying stream error: {0}")]
    Io(#[from] io::Error),
    #[error("lost magic sync for more than {0} bytes")]
    LostSync(usize),
    #[error("frame length {0} exceeds the maximum of {MAX_FRAME_LEN}")]
    OversizedLen(u32),
    #[error("payload pointer is null but len > 0")]
    NullPayload,
}

/// Reads one frame, realigning on the magic sequence if the stream has drifted.
pub fn decode<R: Read>(stream: &mut R) -> Result<Frame, MuxError> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic)?;

    let mut scanned = 0usize;
    while magic != MAGIC {
        magic[0] = magic[1];
        magic[1] = magic[2];
        magic[2] = magic[3];
        let mut next = [0u8; 1];
        stream.read_exact(&mut next)?;
        magic[3] = next[0];
        scanned += 1;
        if scanned > MAX_REALIGN_SCAN {
            return Err(MuxError::LostSync(scanned));
        }
    }

    let id = read_u32(stream)?;
    let flags = Flags::from_bits_truncate(read_u32(stream)?);
    let len = read_u32(stream)?;
    if len > MAX_FRAME_LEN {
        return Err(MuxError::OversizedLen(len));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;

    Ok(Frame { id, flags, payload })
}

/// Writes a frame. `payload` may be empty but must be a valid (non-dangling) slice.
pub fn encode<W: Write>(stream: &mut W, id: u32, flags: Flags, payload: &[u8]) -> Result<(), MuxError> {
    stream.write_all(&MAGIC)?;
    stream.write_all(&id.to_be_bytes())?;
    stream.write_all(&flags.bits().to_be_bytes())?;
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}

fn read_u32<R: Read>(stream: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Parses `key: value\r\n` lines. Keys are lower-cased; values are trimmed.
/// Lines that don't match the pattern are logged and skipped.
pub fn parse_headers(payload: &[u8]) -> BTreeMap<String, String> {
    let text = String::from_utf8_lossy(payload);
    let mut headers = BTreeMap::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => {
                headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
            None => {
                crate::logger::warn(format!("mux: skipping malformed header line: {line:?}"));
            }
        }
    }
    headers
}

/// Formats `key: value\r\n` lines, preserving the given order.
pub fn format_headers<'a, I: IntoIterator<Item = (&'a str, &'a str)>>(pairs: I) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out
}
