//! Frame-level encoding and decoding.
//!
//! A frame on the wire is a [`VarInt`] length prefix followed by that many
//! body bytes. The body starts with the message kind, the correlation id
//! (zero when the message is an uncorrelated server event), and the protocol
//! version, followed by the payload of the message type.

use anyhow::{bail, ensure, Context};
use bytes::{Buf, BufMut, BytesMut};

use crate::var_int::{VarInt, VarIntDecodeError};
use crate::{Decode, Encode, Message, MessageKind, MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// A decoded frame whose payload has not been interpreted yet.
#[derive(Clone, Debug)]
pub struct MessageFrame {
    /// The kind tag of the message.
    pub kind: i32,
    /// Client-chosen correlation id; zero for server events.
    pub correlation: i32,
    /// Protocol version the sender speaks.
    pub version: i32,
    /// The payload bytes after the frame header.
    pub body: BytesMut,
}

impl MessageFrame {
    /// Attempts to decode this frame's payload as message type `M`. An error
    /// is returned if the kind does not match, the body fails to decode, or
    /// some input was missed.
    pub fn decode<'a, M>(&'a self) -> anyhow::Result<M>
    where
        M: Message + Decode<'a>,
    {
        ensure!(
            M::KIND as i32 == self.kind,
            "message kind mismatch while decoding '{}': expected {}, got {}",
            M::NAME,
            M::KIND as i32,
            self.kind
        );

        let mut r = &self.body[..];
        let msg = M::decode(&mut r)?;

        ensure!(
            r.is_empty(),
            "missed {} bytes while decoding '{}'",
            r.len(),
            M::NAME
        );

        Ok(msg)
    }

    /// The kind tag as a typed enum, if it names a known message.
    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_i32(self.kind)
    }
}

/// Incremental decoder over a byte stream.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the next complete frame off the buffer, or returns `Ok(None)` if
    /// more data is needed.
    pub fn try_next_frame(&mut self) -> anyhow::Result<Option<MessageFrame>> {
        let mut r = &self.buf[..];

        let frame_len = match VarInt::decode_partial(&mut r) {
            Ok(len) => len,
            Err(VarIntDecodeError::Incomplete) => return Ok(None),
            Err(VarIntDecodeError::TooLarge) => bail!("malformed frame length VarInt"),
        };

        ensure!(
            (0..=MAX_FRAME_SIZE).contains(&frame_len),
            "frame length of {frame_len} is out of bounds"
        );

        if r.len() < frame_len as usize {
            // Not enough data arrived yet.
            return Ok(None);
        }

        let frame_len_len = VarInt(frame_len).written_size();
        self.buf.advance(frame_len_len);

        let mut body = self.buf.split_to(frame_len as usize);

        let mut r = &body[..];
        let kind = VarInt::decode(&mut r).context("failed to decode message kind")?.0;
        let correlation = VarInt::decode(&mut r)
            .context("failed to decode correlation id")?
            .0;
        let version = VarInt::decode(&mut r)
            .context("failed to decode protocol version")?
            .0;

        body.advance(body.len() - r.len());

        Ok(Some(MessageFrame {
            kind,
            correlation,
            version,
            body,
        }))
    }

    pub fn queue_bytes(&mut self, bytes: BytesMut) {
        self.buf.unsplit(bytes);
    }

    pub fn queue_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Takes the decoder's spare capacity so a reader can fill it without an
    /// extra copy; give the bytes back with [`queue_bytes`](Self::queue_bytes).
    pub fn take_capacity(&mut self) -> BytesMut {
        self.buf.split_off(self.buf.len())
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }
}

/// Accumulates outgoing frames into one buffer.
#[derive(Default)]
pub struct FrameEncoder {
    buf: BytesMut,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one framed message with the given correlation id.
    pub fn append_message<M>(&mut self, correlation: i32, msg: &M) -> anyhow::Result<()>
    where
        M: Message + Encode,
    {
        let start_len = self.buf.len();

        let mut w = (&mut self.buf).writer();
        VarInt(M::KIND as i32).encode(&mut w)?;
        VarInt(correlation).encode(&mut w)?;
        VarInt(PROTOCOL_VERSION).encode(&mut w)?;
        msg.encode(&mut w)?;

        self.enframe_from(start_len)
    }

    /// Appends an uncorrelated server event.
    pub fn append_event<M>(&mut self, msg: &M) -> anyhow::Result<()>
    where
        M: Message + Encode,
    {
        self.append_message(0, msg)
    }

    /// Adds a length prefix in front of the bytes written since `from`.
    fn enframe_from(&mut self, from: usize) -> anyhow::Result<()> {
        let frame_len = self.buf.len() - from;

        ensure!(
            frame_len <= MAX_FRAME_SIZE as usize,
            "frame exceeds maximum length"
        );

        let frame_len_size = VarInt(frame_len as i32).written_size();

        self.buf.put_bytes(0, frame_len_size);
        self.buf
            .copy_within(from..from + frame_len, from + frame_len_size);

        let front = &mut self.buf[from..];
        VarInt(frame_len as i32).encode(front)?;

        Ok(())
    }

    /// Takes all frames written so far.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Encodes a single event into a standalone byte buffer. Convenience for
/// broadcast paths that fan the same bytes out to many sessions.
pub fn encode_event<M>(msg: &M) -> anyhow::Result<BytesMut>
where
    M: Message + Encode,
{
    let mut enc = FrameEncoder::new();
    enc.append_event(msg)?;
    Ok(enc.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChatChannel, EventChatMessage};
    use crate::TilePos;

    fn sample_event() -> EventChatMessage {
        EventChatMessage {
            channel: ChatChannel::Say,
            sender: Some("alice".into()),
            body: "hello world".into(),
            position: Some(TilePos::new(3, 4)),
        }
    }

    #[test]
    fn frame_round_trip() {
        let mut enc = FrameEncoder::new();
        enc.append_message(7, &sample_event()).unwrap();

        let mut dec = FrameDecoder::new();
        dec.queue_bytes(enc.take());

        let frame = dec.try_next_frame().unwrap().expect("one frame");
        assert_eq!(frame.kind, MessageKind::EventChatMessage as i32);
        assert_eq!(frame.correlation, 7);
        assert_eq!(frame.version, PROTOCOL_VERSION);

        let msg: EventChatMessage = frame.decode().unwrap();
        assert_eq!(msg, sample_event());

        assert!(dec.try_next_frame().unwrap().is_none());
    }

    #[test]
    fn partial_frames_need_more_data() {
        let mut enc = FrameEncoder::new();
        enc.append_event(&sample_event()).unwrap();
        let bytes = enc.take();

        let mut dec = FrameDecoder::new();
        for chunk in bytes.chunks(3) {
            dec.queue_slice(chunk);
        }
        // All bytes queued: exactly one frame comes out.
        assert!(dec.try_next_frame().unwrap().is_some());
        assert!(dec.try_next_frame().unwrap().is_none());

        let mut dec = FrameDecoder::new();
        dec.queue_slice(&bytes[..bytes.len() / 2]);
        assert!(dec.try_next_frame().unwrap().is_none());
        dec.queue_slice(&bytes[bytes.len() / 2..]);
        assert!(dec.try_next_frame().unwrap().is_some());
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let mut enc = FrameEncoder::new();
        enc.append_event(&sample_event()).unwrap();

        let mut dec = FrameDecoder::new();
        dec.queue_bytes(enc.take());
        let frame = dec.try_next_frame().unwrap().unwrap();

        assert!(frame.decode::<crate::messages::CmdMove>().is_err());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut dec = FrameDecoder::new();
        let mut prefix = vec![];
        VarInt(MAX_FRAME_SIZE + 1).encode(&mut prefix).unwrap();
        dec.queue_slice(&prefix);
        assert!(dec.try_next_frame().is_err());
    }

    #[test]
    fn back_to_back_frames() {
        let mut enc = FrameEncoder::new();
        enc.append_message(1, &sample_event()).unwrap();
        enc.append_message(2, &sample_event()).unwrap();

        let mut dec = FrameDecoder::new();
        dec.queue_bytes(enc.take());

        assert_eq!(dec.try_next_frame().unwrap().unwrap().correlation, 1);
        assert_eq!(dec.try_next_frame().unwrap().unwrap().correlation, 2);
        assert!(dec.try_next_frame().unwrap().is_none());
    }
}
