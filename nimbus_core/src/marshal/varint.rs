//! 紧凑整数编码
//!
//! 无符号整数使用小端 base-128 varint（每字节最高位为延续位），
//! 有符号整数先做 zig-zag 变换再按无符号编码。

use super::MarshalError;

/// u64 varint 的最大编码长度
pub const MAX_VARINT_LEN: usize = 10;

/// zig-zag 编码 16 位有符号整数
pub fn encode_zigzag16(n: i16) -> u16 {
    ((n << 1) ^ (n >> 15)) as u16
}

/// zig-zag 解码 16 位有符号整数
pub fn decode_zigzag16(n: u16) -> i16 {
    ((n >> 1) as i16) ^ -((n & 1) as i16)
}

/// zig-zag 编码 32 位有符号整数
pub fn encode_zigzag32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// zig-zag 解码 32 位有符号整数
pub fn decode_zigzag32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// zig-zag 编码 64 位有符号整数
pub fn encode_zigzag64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// zig-zag 解码 64 位有符号整数
pub fn decode_zigzag64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// 编码 varint，返回写入的字节数
pub fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut len = 0;
    while value >= 0x80 {
        buf[len] = (value as u8) | 0x80;
        value >>= 7;
        len += 1;
    }
    buf[len] = value as u8;
    len + 1
}

/// 从字节切片解码 varint
///
/// 返回 `Ok(None)` 表示数据不足，`Ok(Some((value, len)))` 为值与消耗的字节数。
pub fn decode_varint(src: &[u8]) -> Result<Option<(u64, usize)>, MarshalError> {
    let mut value = 0u64;
    for (i, &byte) in src.iter().enumerate() {
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(MarshalError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        if i == MAX_VARINT_LEN - 1 {
            return Err(MarshalError::VarintOverflow);
        }
    }
    Ok(None)
}

/// 计算 varint 编码后的字节数
pub fn compact_size(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}
