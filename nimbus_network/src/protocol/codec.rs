//! 协议编解码器
//!
//! 实现 `tokio_util::codec`，让异步客户端可以用 `Framed` 收发与服务端相同格式的帧。

use crate::protocol::frame::{FrameError, RawFrame};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// 协议编解码器
#[derive(Debug, Clone)]
pub struct ProtocolCodec {
    max_frame_size: u64,
}

impl ProtocolCodec {
    /// 创建新的编解码器
    pub fn new() -> Self {
        Self {
            max_frame_size: RawFrame::MAX_PAYLOAD_SIZE,
        }
    }

    /// 指定单帧负载上限
    pub fn with_max_frame_size(max_frame_size: u64) -> Self {
        Self { max_frame_size }
    }

    /// 单帧负载上限
    pub fn max_frame_size(&self) -> u64 {
        self.max_frame_size
    }
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<RawFrame> for ProtocolCodec {
    type Error = FrameError;

    fn encode(&mut self, item: RawFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.payload.len() as u64;
        if size > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for ProtocolCodec {
    type Item = RawFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        RawFrame::decode(src, self.max_frame_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_codec_multiple_frames() {
        let mut codec = ProtocolCodec::new();
        let mut dst = BytesMut::new();

        let frame1 = RawFrame::new(1, Bytes::from("first"));
        let frame2 = RawFrame::new(2, Bytes::from("second"));
        let frame3 = RawFrame::new(3, Bytes::new());

        codec.encode(frame1.clone(), &mut dst).unwrap();
        codec.encode(frame2.clone(), &mut dst).unwrap();
        codec.encode(frame3.clone(), &mut dst).unwrap();

        assert_eq!(codec.decode(&mut dst).unwrap().unwrap(), frame1);
        assert_eq!(codec.decode(&mut dst).unwrap().unwrap(), frame2);
        assert_eq!(codec.decode(&mut dst).unwrap().unwrap(), frame3);
        assert!(codec.decode(&mut dst).unwrap().is_none());
    }

    #[test]
    fn test_encoder_too_large_frame() {
        let mut codec = ProtocolCodec::with_max_frame_size(8);
        let mut dst = BytesMut::new();
        let result = codec.encode(RawFrame::new(1, Bytes::from(vec![0u8; 9])), &mut dst);
        assert!(result.is_err());
        assert!(dst.is_empty());
    }

    #[test]
    fn test_decoder_partial_frame() {
        let mut codec = ProtocolCodec::new();
        let frame = RawFrame::new(1, Bytes::from("hello world"));
        let mut encoded = BytesMut::new();
        frame.encode(&mut encoded);

        let partial_len = encoded.len() / 2;
        let mut src = BytesMut::from(&encoded[..partial_len]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&encoded[partial_len..]);
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        let (a, b) = tokio::io::duplex(64);
        let mut writer = Framed::new(a, ProtocolCodec::new());
        let mut reader = Framed::new(b, ProtocolCodec::new());

        let frame = RawFrame::new(300, Bytes::from(vec![7u8; 200]));
        let send = tokio::spawn(async move {
            writer.send(frame).await.unwrap();
            writer
        });
        let received = reader.next().await.unwrap().unwrap();
        assert_eq!(received.protocol_id, 300);
        assert_eq!(received.payload.len(), 200);
        drop(send.await.unwrap());
        assert!(reader.next().await.is_none());
    }
}
