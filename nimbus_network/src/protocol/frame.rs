//! 原始帧
//!
//! 不依赖协议注册表的帧表示，给基于 tokio 的客户端使用。

use crate::protocol::Protocol;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use nimbus_core::marshal::{MAX_VARINT_LEN, decode_varint, encode_varint};
use nimbus_core::{Marshal, MarshalError, OctetsStream};
use std::fmt;
use thiserror::Error;

/// 帧错误
#[derive(Error, Debug)]
pub enum FrameError {
    /// 帧过大
    #[error("帧过大: {size} 字节 (上限 {max})")]
    FrameTooLarge {
        /// 声明的负载长度
        size: u64,
        /// 上限
        max: u64,
    },

    /// 帧头 varint 非法
    #[error("帧头错误: {0}")]
    Header(#[from] MarshalError),

    /// 协议 ID 超出 u32
    #[error("无效的协议 ID: {0}")]
    InvalidProtocolId(u64),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 原始帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// 协议 ID
    pub protocol_id: u32,
    /// 负载
    pub payload: Bytes,
}

impl RawFrame {
    /// 最大负载（16MB）
    pub const MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

    /// 创建新的帧
    pub fn new(protocol_id: u32, payload: Bytes) -> Self {
        Self {
            protocol_id,
            payload,
        }
    }

    /// 序列化协议为帧
    pub fn from_protocol(protocol: &dyn Protocol) -> Self {
        let mut os = OctetsStream::with_capacity(protocol.size_hint());
        protocol.pack(&mut os);
        Self::new(
            protocol.protocol_id(),
            Bytes::copy_from_slice(os.data().as_slice()),
        )
    }

    /// 把负载反序列化到 `value`
    pub fn unpack_into<T: Marshal>(&self, value: &mut T) -> Result<(), MarshalError> {
        let mut os = OctetsStream::from(nimbus_core::Octets::from(self.payload.as_ref()));
        value.unpack(&mut os)
    }

    /// 完整帧大小
    pub fn frame_size(&self) -> usize {
        let mut buf = [0u8; MAX_VARINT_LEN];
        encode_varint(u64::from(self.protocol_id), &mut buf)
            + encode_varint(self.payload.len() as u64, &mut buf)
            + self.payload.len()
    }

    /// 编码到缓冲区末尾
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut buf = [0u8; MAX_VARINT_LEN];
        dst.reserve(self.frame_size());
        let len = encode_varint(u64::from(self.protocol_id), &mut buf);
        dst.put_slice(&buf[..len]);
        let len = encode_varint(self.payload.len() as u64, &mut buf);
        dst.put_slice(&buf[..len]);
        dst.put_slice(&self.payload);
    }

    /// 从缓冲区解码一帧，数据不足时不消耗任何字节
    pub fn decode(src: &mut BytesMut, max_size: u64) -> Result<Option<Self>, FrameError> {
        let Some((id, id_len)) = decode_varint(&src[..])? else {
            return Ok(None);
        };
        let Some((size, size_len)) = decode_varint(&src[id_len..])? else {
            return Ok(None);
        };
        let protocol_id = u32::try_from(id).map_err(|_| FrameError::InvalidProtocolId(id))?;
        if size > max_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: max_size,
            });
        }
        let header = id_len + size_len;
        let total = header as u64 + size;
        if (src.len() as u64) < total {
            src.reserve(total as usize - src.len());
            return Ok(None);
        }
        src.advance(header);
        let payload = src.split_to(size as usize).freeze();
        Ok(Some(Self {
            protocol_id,
            payload,
        }))
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame[protocol={}, payload_len={}]",
            self.protocol_id,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let frame = RawFrame::new(1, Bytes::from("hello"));
        // 1 (id) + 1 (size) + 5 (payload)
        assert_eq!(frame.frame_size(), 7);
        let frame = RawFrame::new(300, Bytes::from(vec![0u8; 200]));
        assert_eq!(frame.frame_size(), 2 + 2 + 200);
    }

    #[test]
    fn test_decode_incomplete_keeps_bytes() {
        let frame = RawFrame::new(42, Bytes::from("test data"));
        let mut encoded = BytesMut::new();
        frame.encode(&mut encoded);

        let mut partial = BytesMut::from(&encoded[..4]);
        assert!(RawFrame::decode(&mut partial, 1024).unwrap().is_none());
        assert_eq!(partial.len(), 4);

        partial.extend_from_slice(&encoded[4..]);
        let decoded = RawFrame::decode(&mut partial, 1024).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_too_large() {
        let frame = RawFrame::new(1, Bytes::from(vec![0u8; 100]));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let err = RawFrame::decode(&mut buf, 10).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 100, max: 10 }));
    }

    #[test]
    fn test_unpack_payload() {
        let mut os = OctetsStream::new();
        os.pack(&7u32).pack(&"hi".to_string());
        let frame = RawFrame::new(9, Bytes::copy_from_slice(os.data().as_slice()));
        let mut value = (0u32, String::new());
        frame.unpack_into(&mut value).unwrap();
        assert_eq!(value, (7, "hi".to_string()));
    }

    #[test]
    fn test_frame_display() {
        let frame = RawFrame::new(1, Bytes::from("hello"));
        let display = format!("{}", frame);
        assert!(display.contains("protocol=1"));
        assert!(display.contains("payload_len=5"));
    }
}
