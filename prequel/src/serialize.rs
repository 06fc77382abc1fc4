//! The binary serialization protocol.
//!
//! Every persisted type maps to a byte buffer with: a compile-time-constant
//! size, big-endian multi-byte integers and floats, and no padding between
//! fields. [`Serializable`] is the contract; `#[derive(Serializable)]`
//! (re-exported as [`crate::Serializable`]) implements it for ordinary
//! structs and fieldless enums by walking their fields in declaration
//! order. Composite helpers below cover fixed arrays, tuples, `Option<T>`,
//! and fixed-alternative-count variants.

use crate::error::{Error, Result};

/// A type that can be mapped to and from a canonical, fixed-size byte
/// buffer.
///
/// `SERIALIZED_SIZE` must be a genuine compile-time constant: it is used to
/// size node layouts, slot arrays, and nested field offsets without ever
/// constructing a value.
pub trait Serializable: Sized {
    /// The exact number of bytes [`Serializable::serialize`] writes and
    /// [`Serializable::deserialize`] reads.
    const SERIALIZED_SIZE: usize;

    /// Writes `self` into `buf`, which must be exactly `SERIALIZED_SIZE`
    /// bytes long.
    fn serialize(&self, buf: &mut [u8]);

    /// Reads a value from `buf`, which must be exactly `SERIALIZED_SIZE`
    /// bytes long.
    ///
    /// Succeeds for any byte pattern for fixed-width primitives; variant
    /// and enum decoders fail with [`Error::Io`] if the tag/discriminant is
    /// out of range.
    fn deserialize(buf: &[u8]) -> Result<Self>;
}

/// Returns a freshly allocated buffer containing the serialized form of
/// `value`.
pub fn serialized_value<T: Serializable>(value: &T) -> Vec<u8> {
    let mut buf = vec![0u8; T::SERIALIZED_SIZE];
    value.serialize(&mut buf);
    buf
}

/// Deserializes a `T` from exactly `T::SERIALIZED_SIZE` bytes.
pub fn deserialized_value<T: Serializable>(buf: &[u8]) -> Result<T> {
    T::deserialize(buf)
}

macro_rules! impl_primitive {
    ($ty:ty, $size:expr) => {
        impl Serializable for $ty {
            const SERIALIZED_SIZE: usize = $size;

            fn serialize(&self, buf: &mut [u8]) {
                buf.copy_from_slice(&self.to_be_bytes());
            }

            fn deserialize(buf: &[u8]) -> Result<Self> {
                let mut bytes = [0u8; $size];
                bytes.copy_from_slice(buf);
                Ok(<$ty>::from_be_bytes(bytes))
            }
        }
    };
}

impl_primitive!(u8, 1);
impl_primitive!(u16, 2);
impl_primitive!(u32, 4);
impl_primitive!(u64, 8);
impl_primitive!(i8, 1);
impl_primitive!(i16, 2);
impl_primitive!(i32, 4);
impl_primitive!(i64, 8);
impl_primitive!(f32, 4);
impl_primitive!(f64, 8);

impl Serializable for bool {
    const SERIALIZED_SIZE: usize = 1;

    fn serialize(&self, buf: &mut [u8]) {
        buf[0] = if *self { 1 } else { 0 };
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        Ok(buf[0] != 0)
    }
}

/// Fixed array encoding: `N` contiguous `T` encodings, memcpy'd directly
/// for byte arrays.
impl<T: Serializable, const N: usize> Serializable for [T; N] {
    const SERIALIZED_SIZE: usize = T::SERIALIZED_SIZE * N;

    fn serialize(&self, buf: &mut [u8]) {
        let item_size = T::SERIALIZED_SIZE;
        for (i, item) in self.iter().enumerate() {
            item.serialize(&mut buf[i * item_size..(i + 1) * item_size]);
        }
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        let item_size = T::SERIALIZED_SIZE;
        let mut items = Vec::with_capacity(N);
        for i in 0..N {
            items.push(T::deserialize(&buf[i * item_size..(i + 1) * item_size])?);
        }
        match items.try_into() {
            Ok(array) => Ok(array),
            Err(_) => unreachable!("exactly N items were pushed above"),
        }
    }
}

macro_rules! impl_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Serializable),+> Serializable for ($($name,)+) {
            const SERIALIZED_SIZE: usize = 0 $(+ $name::SERIALIZED_SIZE)+;

            fn serialize(&self, buf: &mut [u8]) {
                #[allow(unused_mut, unused_variables)]
                let mut offset = 0usize;
                $(
                    {
                        let size = $name::SERIALIZED_SIZE;
                        self.$idx.serialize(&mut buf[offset..offset + size]);
                        offset += size;
                    }
                )+
            }

            fn deserialize(buf: &[u8]) -> Result<Self> {
                #[allow(unused_mut, unused_variables)]
                let mut offset = 0usize;
                $(
                    let $name = {
                        let size = $name::SERIALIZED_SIZE;
                        let value = $name::deserialize(&buf[offset..offset + size])?;
                        offset += size;
                        value
                    };
                )+
                Ok(($($name,)+))
            }
        }
    };
}

impl_tuple!(A: 0);
impl_tuple!(A: 0, B: 1);
impl_tuple!(A: 0, B: 1, C: 2);
impl_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// `Option<T>` encoding: one presence byte followed by `T::SERIALIZED_SIZE`
/// payload bytes, zeroed when absent.
impl<T: Serializable> Serializable for Option<T> {
    const SERIALIZED_SIZE: usize = 1 + T::SERIALIZED_SIZE;

    fn serialize(&self, buf: &mut [u8]) {
        match self {
            Some(value) => {
                buf[0] = 1;
                value.serialize(&mut buf[1..]);
            }
            None => {
                buf[0] = 0;
                buf[1..].fill(0);
            }
        }
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        match buf[0] {
            0 => Ok(None),
            1 => Ok(Some(T::deserialize(&buf[1..])?)),
            other => Err(Error::Io(format!(
                "invalid presence byte {} for Option<T>",
                other
            ))),
        }
    }
}

/// The largest number of alternatives a [`Variant`]-family type may encode,
/// matching the source library's fixed ceiling (one tag byte, `0..16`).
pub const MAX_VARIANT_ALTERNATIVES: usize = 16;

const fn max2(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

macro_rules! impl_variant {
    ($name:ident < $($alt:ident),+ >, $count:expr, [$($idx:tt),+]) => {
        /// A tagged union of up to a handful of alternatives: one tag byte
        /// (the active variant's zero-based index) followed by
        /// `max(SERIALIZED_SIZE)` payload bytes; unused tail bytes are
        /// zeroed so the encoding stays a fixed width regardless of which
        /// alternative is stored.
        #[derive(Debug, Clone, PartialEq)]
        pub enum $name<$($alt),+> {
            $(
                #[allow(missing_docs)]
                $alt($alt),
            )+
        }

        impl<$($alt: Serializable),+> $name<$($alt),+> {
            const PAYLOAD_SIZE: usize = {
                let mut max = 0usize;
                $(max = max2(max, $alt::SERIALIZED_SIZE);)+
                max
            };
        }

        impl<$($alt: Serializable),+> Serializable for $name<$($alt),+> {
            const SERIALIZED_SIZE: usize = 1 + Self::PAYLOAD_SIZE;

            fn serialize(&self, buf: &mut [u8]) {
                buf[1..].fill(0);
                match self {
                    $(
                        $name::$alt(value) => {
                            buf[0] = $idx;
                            let size = $alt::SERIALIZED_SIZE;
                            value.serialize(&mut buf[1..1 + size]);
                        }
                    )+
                }
            }

            fn deserialize(buf: &[u8]) -> Result<Self> {
                match buf[0] {
                    $(
                        $idx => {
                            let size = $alt::SERIALIZED_SIZE;
                            Ok($name::$alt($alt::deserialize(&buf[1..1 + size])?))
                        }
                    )+
                    other => Err(Error::Io(format!(
                        "variant tag {} out of range (0..{})",
                        other, $count
                    ))),
                }
            }
        }
    };
}

impl_variant!(Variant2<A, B>, 2, [0, 1]);
impl_variant!(Variant3<A, B, C>, 3, [0, 1, 2]);
impl_variant!(Variant4<A, B, C, D>, 4, [0, 1, 2, 3]);
impl_variant!(Variant5<A, B, C, D, E>, 5, [0, 1, 2, 3, 4]);
impl_variant!(Variant6<A, B, C, D, E, F>, 6, [0, 1, 2, 3, 4, 5]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_u32() {
        let v: u32 = 0x7b7c7d7e;
        let mut buf = [0u8; 4];
        v.serialize(&mut buf);
        assert_eq!(buf, [0x7b, 0x7c, 0x7d, 0x7e]);
        assert_eq!(u32::deserialize(&buf).unwrap(), v);
    }

    #[test]
    fn round_trip_primitives() {
        macro_rules! check {
            ($v:expr, $ty:ty) => {{
                let v: $ty = $v;
                let buf = serialized_value(&v);
                assert_eq!(buf.len(), <$ty>::SERIALIZED_SIZE);
                assert_eq!(deserialized_value::<$ty>(&buf).unwrap(), v);
            }};
        }
        check!(true, bool);
        check!(42u8, u8);
        check!(-7i16, i16);
        check!(123456789u64, u64);
        check!(3.5f64, f64);
    }

    #[test]
    fn array_encoding() {
        let v: [u32; 3] = [1, 2, 3];
        let buf = serialized_value(&v);
        assert_eq!(buf.len(), 12);
        assert_eq!(deserialized_value::<[u32; 3]>(&buf).unwrap(), v);
    }

    #[test]
    fn option_encoding() {
        let some: Option<u32> = Some(7);
        let none: Option<u32> = None;
        assert_eq!(Option::<u32>::SERIALIZED_SIZE, 5);
        let buf = serialized_value(&some);
        assert_eq!(deserialized_value::<Option<u32>>(&buf).unwrap(), some);
        let buf = serialized_value(&none);
        assert_eq!(&buf[1..], &[0, 0, 0, 0]);
        assert_eq!(deserialized_value::<Option<u32>>(&buf).unwrap(), none);
    }

    #[test]
    fn variant_layout() {
        // variant<i32, f64, (u32, u8)> -> 1 + max(4, 8, 5) = 9? The spec's
        // example uses a 3-member struct ("Point") of 8 bytes; emulate with
        // a tuple alternative of equal size to check the fixed-width
        // discipline instead of a specific byte count.
        type V = Variant3<i32, f64, (u32, u32)>;
        assert_eq!(V::SERIALIZED_SIZE, 1 + 8);
        let v = V::A(7);
        let buf = serialized_value(&v);
        assert_eq!(buf[0], 0);
        assert_eq!(&buf[5..], &[0, 0, 0, 0]);
        assert_eq!(deserialized_value::<V>(&buf).unwrap(), v);
    }

    #[test]
    fn variant_tag_out_of_range() {
        type V = Variant2<u8, u8>;
        let mut buf = vec![0u8; V::SERIALIZED_SIZE];
        buf[0] = 2;
        assert!(deserialized_value::<V>(&buf).is_err());
    }

    #[test]
    fn tuple_round_trip() {
        let v = (1u32, 2u8, 3u32);
        let buf = serialized_value(&v);
        assert_eq!(buf.len(), 9);
        assert_eq!(deserialized_value::<(u32, u8, u32)>(&buf).unwrap(), v);
    }
}
