use byteorder::{ByteOrder, LittleEndian};
use quinn::{RecvStream, SendStream};
use rkyv::AlignedVec;

use super::{error::Error, Command, Event};

/// Frames larger than this are treated as a corrupt stream. Bodies in this
/// system are a few bytes; the limit only guards the allocation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Every frame on a link is `len (u32 LE) | archived Command or Event`.
const LEN_PREFIX: usize = 4;

impl Command {
    pub fn encode(&self) -> Result<AlignedVec, Error> {
        rkyv::to_bytes::<_, 256>(self).map_err(|_| Error::CouldNotEncodeFrame)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Command>(buf).map_err(|_| Error::CouldNotDecodeFrame)
    }
}

impl Event {
    pub fn encode(&self) -> Result<AlignedVec, Error> {
        rkyv::to_bytes::<_, 256>(self).map_err(|_| Error::CouldNotEncodeFrame)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Event>(buf).map_err(|_| Error::CouldNotDecodeFrame)
    }
}

/// Writes length-prefixed frames to a QUIC stream.
pub struct FrameSendStream(SendStream);

impl FrameSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    pub async fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        let len = u32::try_from(frame.len()).map_err(|_| Error::FrameLengthOverflowed)?;
        if len > MAX_FRAME_LEN {
            Err(Error::FrameLengthOverflowed)?
        }
        let mut buf = Vec::with_capacity(LEN_PREFIX + frame.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(frame);
        self.0.write_all(&buf).await?;
        Ok(())
    }

    /// Flushes what was written and ends the stream.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.0.finish().await.map_err(Error::WriteError)
    }
}

/// Reads length-prefixed frames from a QUIC stream.
pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    /// Reads one frame into an aligned buffer, ready for `decode`.
    pub async fn recv(&mut self) -> Result<AlignedVec, Error> {
        let mut len_buf = [0u8; LEN_PREFIX];
        self.0.read_exact(&mut len_buf).await?;
        let len = LittleEndian::read_u32(&len_buf);
        if len > MAX_FRAME_LEN {
            Err(Error::FrameLengthOverflowed)?
        }
        let mut buf = AlignedVec::with_capacity(len as usize);
        buf.resize(len as usize, 0);
        self.0.read_exact(&mut buf[..]).await?;
        Ok(buf)
    }
}
