//! Wire protocol and shared core types for the Gridvale server.
//!
//! Every message exchanged with a client is a single length-delimited binary
//! frame. A frame body starts with a [`VarInt`] message kind, a `VarInt`
//! correlation id (zero for uncorrelated server events), and the protocol
//! version, followed by the payload fields of that message type.
//!
//! The [`Encode`] and [`Decode`] traits define the binary format. They are
//! implemented by hand for primitives and for every payload struct in
//! [`messages`]; there is no reflection or schema negotiation at runtime.

pub mod codec;
mod error;
mod impls;
pub mod messages;
mod types;
pub mod var_int;

use std::io::Write;

pub use codec::{FrameDecoder, FrameEncoder, MessageFrame};
pub use error::{ErrorCategory, ErrorCode};
pub use messages::MessageKind;
pub use types::{
    Direction, EntityInstanceId, EntityState, EquipmentSlot, GroundItemId, ItemKindId, ItemStack,
    MapId, PlayerId, Rarity, Role, SkillKind, TilePos,
};
pub use var_int::VarInt;

/// The maximum number of bytes in a single protocol frame.
pub const MAX_FRAME_SIZE: i32 = 2097152;

/// The protocol version this library currently targets. Sent in every frame
/// header and echoed back by clients.
pub const PROTOCOL_VERSION: i32 = 1;

/// The `Encode` trait allows objects to be written to the wire format. It is
/// the inverse of [`Decode`].
///
/// Components of a type are encoded in the order they appear in the type
/// definition.
pub trait Encode {
    /// Writes this object to the provided writer.
    ///
    /// If this type also implements [`Decode`] then successful calls to this
    /// function returning `Ok(())` must always successfully decode using the
    /// data that was written to the writer. The exact number of bytes that
    /// were originally written must be consumed during the decoding.
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;
}

/// The `Decode` trait allows objects to be read from the wire format. It is
/// the inverse of [`Encode`].
///
/// `Decode` is parameterized by a lifetime. This allows the decoded value to
/// borrow data from the byte slice it was read from.
pub trait Decode<'a>: Sized {
    /// Reads this object from the provided byte slice.
    ///
    /// Implementations of `Decode` are expected to shrink the slice from the
    /// front as bytes are read.
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self>;
}

/// Types considered to be a protocol message. A message has a numeric kind
/// used for dispatch and a name used for error reporting.
pub trait Message: std::fmt::Debug {
    /// The message kind this payload belongs to.
    const KIND: MessageKind;

    /// The name of this message for debugging purposes.
    const NAME: &'static str;
}
