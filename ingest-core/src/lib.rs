//! Segmented image ingest core: wire protocol, blocking session registry, image store contract.
//! No sockets here; the server crate owns connections and drives these pieces.

pub mod protocol;
pub mod registry;
pub mod store;
pub mod wire;

pub use protocol::{Message, MessageType, BYTES_PER_PIXEL};
pub use registry::Registry;
pub use store::{ImageSpec, ImageStore, StoreError, StoreFactory};
pub use wire::{decode_body, encode_frame, frame_len, FrameDecodeError, FrameEncodeError};

// Store implementations.
pub mod fits;
pub mod memory;
