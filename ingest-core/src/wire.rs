//! Framing: length prefix (4 bytes BE) + type tag + name + type-specific fields, all big-endian.
//!
//! ```text
//! u32 totalLength | u8 type | u8 nameLen | name[nameLen] | fields
//! ```
//!
//! `totalLength` covers everything after itself. The raw payload of a DATA frame is not part
//! of the frame: `dataLength` bytes follow it on the stream and are consumed by the receiver.

use crate::protocol::{Message, MessageType};

/// Size of the length prefix.
pub const LEN_SIZE: usize = 4;
/// Upper bound on `totalLength`. DATA payload bytes travel outside the frame and are not counted.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

const MAX_NAME_LEN: usize = u8::MAX as usize;
const START_FIELDS: usize = 16;
const DATA_FIELDS: usize = 16;

/// Encode a message into a single frame: 4 bytes BE length + body.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let name = msg.image_name().as_bytes();
    if name.len() > MAX_NAME_LEN {
        return Err(FrameEncodeError::NameTooLong(name.len()));
    }
    let fields_len = match msg {
        Message::Start { .. } => START_FIELDS,
        Message::End { .. } => 0,
        Message::Data { .. } => DATA_FIELDS,
        Message::Header { line, .. } => line.len(),
    };
    let body_len = 2 + name.len() + fields_len;
    if body_len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.push(msg.message_type().tag());
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    match msg {
        Message::Start {
            width,
            height,
            header_count,
            client_count,
            ..
        } => {
            for v in [width, height, header_count, client_count] {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        Message::End { .. } => {}
        Message::Data {
            offset,
            stride_length,
            stride_spacing,
            data_length,
            ..
        } => {
            for v in [offset, stride_length, stride_spacing, data_length] {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        Message::Header { line, .. } => out.extend_from_slice(line.as_bytes()),
    }
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("image name is {0} bytes, at most 255 allowed")]
    NameTooLong(usize),
    #[error("frame too large")]
    TooLarge,
}

/// Parse the length prefix. Fails if the declared length exceeds [`MAX_FRAME_LEN`].
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode the part of a frame after the length prefix. `body` must be exactly `totalLength` bytes.
pub fn decode_body(body: &[u8]) -> Result<Message, FrameDecodeError> {
    let (&tag, rest) = body.split_first().ok_or(FrameDecodeError::Truncated)?;
    let kind = MessageType::from_tag(tag).ok_or(FrameDecodeError::UnknownType(tag))?;
    let (&name_len, rest) = rest.split_first().ok_or(FrameDecodeError::Truncated)?;
    let name_len = name_len as usize;
    if rest.len() < name_len {
        return Err(FrameDecodeError::Truncated);
    }
    let (name, fields) = rest.split_at(name_len);
    let image_name = std::str::from_utf8(name)
        .map_err(|_| FrameDecodeError::InvalidText)?
        .to_owned();

    match kind {
        MessageType::Start => {
            let [width, height, header_count, client_count] = read_u32s(fields)?;
            Ok(Message::Start {
                image_name,
                width,
                height,
                header_count,
                client_count,
            })
        }
        MessageType::End => {
            if !fields.is_empty() {
                return Err(FrameDecodeError::TrailingBytes);
            }
            Ok(Message::End { image_name })
        }
        MessageType::Data => {
            let [offset, stride_length, stride_spacing, data_length] = read_u32s(fields)?;
            Ok(Message::Data {
                image_name,
                offset,
                stride_length,
                stride_spacing,
                data_length,
            })
        }
        MessageType::Header => {
            let line = std::str::from_utf8(fields)
                .map_err(|_| FrameDecodeError::InvalidText)?
                .to_owned();
            Ok(Message::Header { image_name, line })
        }
    }
}

fn read_u32s(fields: &[u8]) -> Result<[u32; 4], FrameDecodeError> {
    if fields.len() < 16 {
        return Err(FrameDecodeError::Truncated);
    }
    if fields.len() > 16 {
        return Err(FrameDecodeError::TrailingBytes);
    }
    let mut out = [0u32; 4];
    for (v, chunk) in out.iter_mut().zip(fields.chunks_exact(4)) {
        *v = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(out)
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("truncated frame")]
    Truncated,
    #[error("unexpected bytes after frame fields")]
    TrailingBytes,
    #[error("name or header text is not valid UTF-8")]
    InvalidText,
}
