/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Wire framing shared by every transport.
//!
//! All transports move whole frames: the in-process queue stores encoded
//! frames verbatim, the socket transports write them to streams, and the
//! broker daemon routes them without re-encoding. A frame is length-prefixed
//! with a fixed preamble, followed by the JSON header and the JSON payload.
//!
//! # Wire Format (Protocol v1)
//!
//! ```text
//! +----------------------------------------------------------------+
//! | Frame Length (4 bytes, big-endian u32, excludes preamble)      |
//! +----------------------------------------------------------------+
//! | Protocol Version (1 byte, currently 0x01)                      |
//! +----------------------------------------------------------------+
//! | Frame Kind (1 byte)                                            |
//! |   0x01 = Data                                                  |
//! |   0x02 = Eof                                                   |
//! |   0x03 = Attach (broker control)                               |
//! +----------------------------------------------------------------+
//! | Header Length (4 bytes, big-endian u32)                        |
//! +----------------------------------------------------------------+
//! | Header (JSON, see [`Header`])                                  |
//! +----------------------------------------------------------------+
//! | Payload (JSON, may be empty)                                   |
//! +----------------------------------------------------------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Header, PortError};

/// Protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Preamble size: 4 bytes length + 1 byte version + 1 byte kind.
pub const PREAMBLE_SIZE: usize = 6;

/// Maximum frame size (16 MiB hard limit).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Discriminates the three frame shapes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// An ordinary message: header plus payload.
    Data,
    /// End-of-stream marker: header with `eof` set, empty payload.
    Eof,
    /// Broker control frame: the payload names a queue and a role.
    Attach,
}

impl FrameKind {
    /// Wire byte for data frames.
    pub const DATA_BYTE: u8 = 0x01;
    /// Wire byte for end-of-stream frames.
    pub const EOF_BYTE: u8 = 0x02;
    /// Wire byte for broker attach frames.
    pub const ATTACH_BYTE: u8 = 0x03;

    /// Convert kind to wire byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Data => Self::DATA_BYTE,
            Self::Eof => Self::EOF_BYTE,
            Self::Attach => Self::ATTACH_BYTE,
        }
    }

    /// Parse kind from wire byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::DATA_BYTE => Some(Self::Data),
            Self::EOF_BYTE => Some(Self::Eof),
            Self::ATTACH_BYTE => Some(Self::Attach),
            _ => None,
        }
    }
}

/// Encodes a complete frame, preamble included.
///
/// The payload must already be serialized; pass an empty slice for EOF
/// frames. Fails with [`PortError::Protocol`] if the frame would exceed the
/// hard size limit.
pub fn encode(kind: FrameKind, header: &Header, payload: &[u8]) -> Result<Vec<u8>, PortError> {
    let header_bytes = serde_json::to_vec(header)?;
    let body_len = 4 + header_bytes.len() + payload.len();

    if body_len > MAX_FRAME_SIZE {
        return Err(PortError::Protocol(format!(
            "Frame size {body_len} exceeds hard limit {MAX_FRAME_SIZE}"
        )));
    }
    let length: u32 = body_len
        .try_into()
        .map_err(|_| PortError::Protocol("Frame too large for u32 length".to_string()))?;
    let header_len: u32 = header_bytes
        .len()
        .try_into()
        .map_err(|_| PortError::Protocol("Header too large for u32 length".to_string()))?;

    let mut frame = Vec::with_capacity(PREAMBLE_SIZE + body_len);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(PROTOCOL_VERSION);
    frame.push(kind.to_byte());
    frame.extend_from_slice(&header_len.to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decodes a complete frame back into its kind, header, and payload bytes.
///
/// The slice must hold exactly one frame, preamble included, as produced by
/// [`encode`] or collected by [`read_frame_bytes`].
pub fn decode(frame: &[u8]) -> Result<(FrameKind, Header, Vec<u8>), PortError> {
    if frame.len() < PREAMBLE_SIZE + 4 {
        return Err(PortError::Protocol(format!(
            "Frame truncated: {} bytes",
            frame.len()
        )));
    }

    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let version = frame[4];
    let kind_byte = frame[5];

    if version != PROTOCOL_VERSION {
        return Err(PortError::Protocol(format!(
            "Unsupported protocol version: {version}, expected {PROTOCOL_VERSION}"
        )));
    }
    let kind = FrameKind::from_byte(kind_byte).ok_or_else(|| {
        PortError::Protocol(format!("Unknown frame kind: {kind_byte:#04x}"))
    })?;
    if frame.len() - PREAMBLE_SIZE != length {
        return Err(PortError::Protocol(format!(
            "Frame length mismatch: preamble says {length}, body is {}",
            frame.len() - PREAMBLE_SIZE
        )));
    }

    let body = &frame[PREAMBLE_SIZE..];
    let header_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if 4 + header_len > body.len() {
        return Err(PortError::Protocol(format!(
            "Header length {header_len} overruns frame body of {} bytes",
            body.len()
        )));
    }

    let header: Header = serde_json::from_slice(&body[4..4 + header_len])?;
    let payload = body[4 + header_len..].to_vec();
    Ok((kind, header, payload))
}

/// Reads the kind byte from an encoded frame without parsing the header.
///
/// Used by the broker daemon to route frames it never needs to open.
pub fn peek_kind(frame: &[u8]) -> Result<FrameKind, PortError> {
    if frame.len() < PREAMBLE_SIZE {
        return Err(PortError::Protocol(format!(
            "Frame truncated: {} bytes",
            frame.len()
        )));
    }
    FrameKind::from_byte(frame[5])
        .ok_or_else(|| PortError::Protocol(format!("Unknown frame kind: {:#04x}", frame[5])))
}

/// Reads one complete frame from the stream.
///
/// Returns the frame kind and the full encoded bytes, preamble included, so
/// the frame can be forwarded or stored without re-encoding. A clean EOF at
/// a frame boundary maps to [`PortError::Closed`].
pub async fn read_frame_bytes<R>(
    reader: &mut R,
    max_size: usize,
) -> Result<(FrameKind, Vec<u8>), PortError>
where
    R: AsyncRead + Unpin,
{
    let mut preamble = [0u8; PREAMBLE_SIZE];
    reader.read_exact(&mut preamble).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PortError::Closed
        } else {
            PortError::Io(e.to_string())
        }
    })?;

    let length = u32::from_be_bytes([preamble[0], preamble[1], preamble[2], preamble[3]]) as usize;
    let version = preamble[4];
    let kind_byte = preamble[5];

    if version != PROTOCOL_VERSION {
        return Err(PortError::Protocol(format!(
            "Unsupported protocol version: {version}, expected {PROTOCOL_VERSION}"
        )));
    }
    let kind = FrameKind::from_byte(kind_byte).ok_or_else(|| {
        PortError::Protocol(format!("Unknown frame kind: {kind_byte:#04x}"))
    })?;
    if length > max_size {
        return Err(PortError::Protocol(format!(
            "Frame size {length} exceeds maximum {max_size}"
        )));
    }
    if length > MAX_FRAME_SIZE {
        return Err(PortError::Protocol(format!(
            "Frame size {length} exceeds hard limit {MAX_FRAME_SIZE}"
        )));
    }

    let mut frame = vec![0u8; PREAMBLE_SIZE + length];
    frame[..PREAMBLE_SIZE].copy_from_slice(&preamble);
    reader
        .read_exact(&mut frame[PREAMBLE_SIZE..])
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                PortError::Closed
            } else {
                PortError::Io(e.to_string())
            }
        })?;

    Ok((kind, frame))
}

/// Writes pre-encoded frame bytes to the stream and flushes.
pub async fn write_bytes<W>(writer: &mut W, frame: &[u8]) -> Result<(), PortError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(frame)
        .await
        .map_err(|e| PortError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| PortError::Io(e.to_string()))?;
    Ok(())
}
