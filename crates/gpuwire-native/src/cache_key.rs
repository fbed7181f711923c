//! Deterministic byte keys for cache lookups.
//!
//! A key is built by recording values in a fixed order. Tuples record as
//! `{0:a,1:b,...}`, sequences as `[a,b,...]`, primitives in decimal ASCII,
//! floats with six fractional digits, and nested keys or blobs as raw bytes.
//! The same values recorded in the same order always produce the same bytes,
//! across runs and processes.

use std::fmt;
use std::io::Write;

use crate::Blob;

#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    bytes: Vec<u8>,
}

impl CacheKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key holding exactly the serialization of `value`.
    pub fn of<T: CacheKeySerializer + ?Sized>(value: &T) -> Self {
        let mut key = Self::new();
        key.record(value);
        key
    }

    pub fn record<T: CacheKeySerializer + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.serialize(self);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn write_fmt_args(&mut self, args: fmt::Arguments<'_>) {
        // Writing into a Vec cannot fail.
        let _ = self.bytes.write_fmt(args);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?})", String::from_utf8_lossy(&self.bytes))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

/// Appends a value's stable encoding to a [`CacheKey`].
pub trait CacheKeySerializer {
    fn serialize(&self, key: &mut CacheKey);
}

macro_rules! impl_decimal {
    ($($t:ty),*) => {
        $(
            impl CacheKeySerializer for $t {
                fn serialize(&self, key: &mut CacheKey) {
                    key.write_fmt_args(format_args!("{}", self));
                }
            }
        )*
    };
}

impl_decimal!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl CacheKeySerializer for f32 {
    fn serialize(&self, key: &mut CacheKey) {
        key.write_fmt_args(format_args!("{:.6}", self));
    }
}

impl CacheKeySerializer for f64 {
    fn serialize(&self, key: &mut CacheKey) {
        key.write_fmt_args(format_args!("{:.6}", self));
    }
}

impl CacheKeySerializer for bool {
    fn serialize(&self, key: &mut CacheKey) {
        u8::from(*self).serialize(key);
    }
}

impl CacheKeySerializer for str {
    fn serialize(&self, key: &mut CacheKey) {
        key.write_raw(self.as_bytes());
    }
}

impl CacheKeySerializer for String {
    fn serialize(&self, key: &mut CacheKey) {
        self.as_str().serialize(key);
    }
}

impl CacheKeySerializer for CacheKey {
    fn serialize(&self, key: &mut CacheKey) {
        key.write_raw(&self.bytes);
    }
}

impl CacheKeySerializer for Blob {
    fn serialize(&self, key: &mut CacheKey) {
        key.write_raw(self.data());
    }
}

impl<T: CacheKeySerializer + ?Sized> CacheKeySerializer for &T {
    fn serialize(&self, key: &mut CacheKey) {
        (**self).serialize(key);
    }
}

impl<T: CacheKeySerializer> CacheKeySerializer for Option<T> {
    fn serialize(&self, key: &mut CacheKey) {
        match self {
            Some(v) => {
                key.write_raw(b"1");
                v.serialize(key);
            }
            None => key.write_raw(b"0"),
        }
    }
}

impl<T: CacheKeySerializer> CacheKeySerializer for [T] {
    fn serialize(&self, key: &mut CacheKey) {
        key.write_raw(b"[");
        for (i, item) in self.iter().enumerate() {
            if i > 0 {
                key.write_raw(b",");
            }
            item.serialize(key);
        }
        key.write_raw(b"]");
    }
}

impl<T: CacheKeySerializer> CacheKeySerializer for Vec<T> {
    fn serialize(&self, key: &mut CacheKey) {
        self.as_slice().serialize(key);
    }
}

macro_rules! impl_tuple {
    ($($idx:tt $name:ident),+) => {
        impl<$($name: CacheKeySerializer),+> CacheKeySerializer for ($($name,)+) {
            fn serialize(&self, key: &mut CacheKey) {
                key.write_raw(b"{");
                $(
                    if $idx > 0 {
                        key.write_raw(b",");
                    }
                    key.write_fmt_args(format_args!("{}:", $idx));
                    self.$idx.serialize(key);
                )+
                key.write_raw(b"}");
            }
        }
    };
}

impl_tuple!(0 A);
impl_tuple!(0 A, 1 B);
impl_tuple!(0 A, 1 B, 2 C);
impl_tuple!(0 A, 1 B, 2 C, 3 D);
impl_tuple!(0 A, 1 B, 2 C, 3 D, 4 E);
impl_tuple!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F);
impl_tuple!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G);
impl_tuple!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H);
