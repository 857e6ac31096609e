use bytes::{Buf, BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead};

use crate::error::{Result, RibError};
use crate::message::{Frame, HEADER_LEN, MAX_FRAME_LEN};

/// Length-prefixed frame decoder for the client protocol. A frame whose
/// declared length is shorter than its own header or larger than
/// [`MAX_FRAME_LEN`] is a protocol violation and tears the client down.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RibError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len < HEADER_LEN || len > MAX_FRAME_LEN {
            return Err(RibError::frame(format!("frame length {len} out of bounds")));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(len);
        frame.advance(2);
        let command = frame.get_u8();
        Ok(Some(Frame::new(command, frame.freeze())))
    }
}

/// One client connection: framed reads, manually encoded writes.
pub struct ClientConn {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
}

impl ClientConn {
    pub fn new(stream: TcpStream) -> ClientConn {
        let (read, write) = stream.into_split();
        ClientConn {
            reader: FramedRead::new(read, FrameCodec),
            writer: write,
        }
    }

    /// Next inbound frame; `None` on EOF.
    pub async fn read_frame(&mut self) -> Option<Result<Frame>> {
        self.reader.next().await
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let len = HEADER_LEN + frame.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(RibError::frame("oversized outbound frame"));
        }
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u16(len as u16);
        buf.put_u8(frame.command);
        buf.put_slice(&frame.payload);
        self.writer.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::command;

    #[test]
    fn partial_header_waits_for_more_data() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0u8, 7][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn frame_is_cut_at_declared_length() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(7);
        buf.put_u8(command::REDISTRIBUTE_ADD);
        buf.put_slice(&[1, 2, 3, 4]);
        // Start of the next frame's header.
        buf.put_slice(&[0, 5]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, command::REDISTRIBUTE_ADD);
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn frame_arriving_in_pieces_decodes_once_complete() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(8);
        buf.put_u8(command::IPV4_ROUTE_ADD);
        buf.put_slice(&[9, 9]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&[9, 9, 9]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 5);
    }

    #[test]
    fn undersized_and_oversized_lengths_are_protocol_errors() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0u8, 2, 0][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u16(u16::MAX);
        buf.put_u8(0);
        assert!(codec.decode(&mut buf).is_err());
    }
}
