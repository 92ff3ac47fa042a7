//! 基础类型的 Marshal 实现
//!
//! - `bool` / `u8` / `i8`：单字节
//! - 无符号整数：varint
//! - 有符号整数：zig-zag + varint
//! - 浮点数：定长网络字节序
//! - 字符串、字节串、容器：varint 长度前缀

use super::octets::Octets;
use super::stream::OctetsStream;
use super::varint::{
    decode_zigzag16, decode_zigzag32, decode_zigzag64, encode_zigzag16, encode_zigzag32,
    encode_zigzag64,
};
use super::{Marshal, MarshalError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

impl Marshal for bool {
    fn pack(&self, os: &mut OctetsStream) {
        os.push_u8(u8::from(*self));
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        *self = match os.pop_u8()? {
            0 => false,
            1 => true,
            other => return Err(MarshalError::InvalidBool(other)),
        };
        Ok(())
    }
}

impl Marshal for u8 {
    fn pack(&self, os: &mut OctetsStream) {
        os.push_u8(*self);
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        *self = os.pop_u8()?;
        Ok(())
    }
}

impl Marshal for i8 {
    fn pack(&self, os: &mut OctetsStream) {
        os.push_u8(*self as u8);
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        *self = os.pop_u8()? as i8;
        Ok(())
    }
}

macro_rules! impl_unsigned {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                fn pack(&self, os: &mut OctetsStream) {
                    os.push_varint(*self as u64);
                }

                fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
                    let value = os.pop_varint()?;
                    *self = <$ty>::try_from(value).map_err(|_| MarshalError::ValueOutOfRange {
                        ty: stringify!($ty),
                        value,
                    })?;
                    Ok(())
                }
            }
        )*
    };
}

impl_unsigned!(u16, u32, u64, usize);

macro_rules! impl_signed {
    ($($ty:ty => $raw:ty, $enc:ident, $dec:ident);* $(;)?) => {
        $(
            impl Marshal for $ty {
                fn pack(&self, os: &mut OctetsStream) {
                    os.push_varint(u64::from($enc(*self)));
                }

                fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
                    let value = os.pop_varint()?;
                    let raw = <$raw>::try_from(value).map_err(|_| MarshalError::ValueOutOfRange {
                        ty: stringify!($ty),
                        value,
                    })?;
                    *self = $dec(raw);
                    Ok(())
                }
            }
        )*
    };
}

impl_signed! {
    i16 => u16, encode_zigzag16, decode_zigzag16;
    i32 => u32, encode_zigzag32, decode_zigzag32;
    i64 => u64, encode_zigzag64, decode_zigzag64;
}

impl Marshal for f32 {
    fn pack(&self, os: &mut OctetsStream) {
        os.append(&self.to_be_bytes());
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(os.pop_raw(4)?);
        *self = f32::from_be_bytes(bytes);
        Ok(())
    }
}

impl Marshal for f64 {
    fn pack(&self, os: &mut OctetsStream) {
        os.append(&self.to_be_bytes());
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(os.pop_raw(8)?);
        *self = f64::from_be_bytes(bytes);
        Ok(())
    }
}

impl Marshal for String {
    fn pack(&self, os: &mut OctetsStream) {
        os.push_bytes(self.as_bytes());
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let bytes = os.pop_bytes()?;
        let text = std::str::from_utf8(bytes).map_err(|_| MarshalError::InvalidUtf8)?;
        self.clear();
        self.push_str(text);
        Ok(())
    }
}

impl Marshal for Octets {
    fn pack(&self, os: &mut OctetsStream) {
        os.push_bytes(self.as_slice());
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let bytes = os.pop_bytes()?;
        self.clear();
        self.append(bytes);
        Ok(())
    }
}

/// 读取容器元素个数，元素至少占 1 字节
fn pop_count(os: &mut OctetsStream) -> Result<usize, MarshalError> {
    let count = os.pop_varint()?;
    if count > os.remaining() as u64 {
        return Err(MarshalError::LengthOverflow(count));
    }
    Ok(count as usize)
}

impl<T: Marshal + Default> Marshal for Vec<T> {
    fn pack(&self, os: &mut OctetsStream) {
        os.push_varint(self.len() as u64);
        for item in self {
            item.pack(os);
        }
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let count = pop_count(os)?;
        self.clear();
        self.reserve(count);
        for _ in 0..count {
            self.push(os.unpack()?);
        }
        Ok(())
    }
}

impl<T: Marshal + Default> Marshal for VecDeque<T> {
    fn pack(&self, os: &mut OctetsStream) {
        os.push_varint(self.len() as u64);
        for item in self {
            item.pack(os);
        }
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let count = pop_count(os)?;
        self.clear();
        for _ in 0..count {
            self.push_back(os.unpack()?);
        }
        Ok(())
    }
}

impl<K, V> Marshal for BTreeMap<K, V>
where
    K: Marshal + Default + Ord,
    V: Marshal + Default,
{
    fn pack(&self, os: &mut OctetsStream) {
        os.push_varint(self.len() as u64);
        for (key, value) in self {
            key.pack(os);
            value.pack(os);
        }
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let count = pop_count(os)?;
        self.clear();
        for _ in 0..count {
            let key = os.unpack()?;
            let value = os.unpack()?;
            self.insert(key, value);
        }
        Ok(())
    }
}

impl<K, V> Marshal for HashMap<K, V>
where
    K: Marshal + Default + Eq + Hash,
    V: Marshal + Default,
{
    fn pack(&self, os: &mut OctetsStream) {
        os.push_varint(self.len() as u64);
        for (key, value) in self {
            key.pack(os);
            value.pack(os);
        }
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let count = pop_count(os)?;
        self.clear();
        self.reserve(count);
        for _ in 0..count {
            let key = os.unpack()?;
            let value = os.unpack()?;
            self.insert(key, value);
        }
        Ok(())
    }
}

impl<T: Marshal + Default> Marshal for Option<T> {
    fn pack(&self, os: &mut OctetsStream) {
        match self {
            Some(value) => {
                os.push_u8(1);
                value.pack(os);
            }
            None => {
                os.push_u8(0);
            }
        }
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        let mut present = false;
        present.unpack(os)?;
        *self = if present { Some(os.unpack()?) } else { None };
        Ok(())
    }
}

impl<A: Marshal, B: Marshal> Marshal for (A, B) {
    fn pack(&self, os: &mut OctetsStream) {
        self.0.pack(os);
        self.1.pack(os);
    }

    fn unpack(&mut self, os: &mut OctetsStream) -> Result<(), MarshalError> {
        self.0.unpack(os)?;
        self.1.unpack(os)
    }
}
