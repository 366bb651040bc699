//! Ingest wire protocol: message types and type tags.

/// Bytes per pixel. Pixel-unit fields on the wire are multiplied by this to address bytes.
pub const BYTES_PER_PIXEL: u64 = 4;

/// Type tag carried in the first byte after the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Start = 0,
    End = 1,
    Data = 2,
    Header = 3,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Start),
            1 => Some(Self::End),
            2 => Some(Self::Data),
            3 => Some(Self::Header),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// All wire message types. Every variant carries the image name, the only correlation key
/// between frames of one logical image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A new image is about to be sent by `client_count` senders.
    Start {
        image_name: String,
        width: u32,
        height: u32,
        header_count: u32,
        client_count: u32,
    },
    /// One sender has finished with the image.
    End { image_name: String },
    /// Region write. `offset`, `stride_length` and `stride_spacing` are pixel counts;
    /// `data_length` is a byte count. The payload follows the frame on the stream.
    Data {
        image_name: String,
        offset: u32,
        stride_length: u32,
        stride_spacing: u32,
        data_length: u32,
    },
    /// One textual header record.
    Header { image_name: String, line: String },
}

impl Message {
    pub fn image_name(&self) -> &str {
        match self {
            Message::Start { image_name, .. }
            | Message::End { image_name }
            | Message::Data { image_name, .. }
            | Message::Header { image_name, .. } => image_name,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Start { .. } => MessageType::Start,
            Message::End { .. } => MessageType::End,
            Message::Data { .. } => MessageType::Data,
            Message::Header { .. } => MessageType::Header,
        }
    }
}
