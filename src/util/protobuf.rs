// Braid
// Copyright (C) 2024-2026  Braid project contributors
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Helpers for encoding and decoding protobuf messages.
//!
//! The networking protocols only ever exchange a handful of small, flat protobuf messages, so
//! rather than relying on a code generator, each message is encoded by chaining the `*_encode`
//! functions of this module, and decoded with a loop that calls [`tag_decode`] then dispatches
//! on the field number and wire type. Per the protobuf specification, decoders must accept
//! fields in any order, silently skip unknown fields (see [`value_skip_decode`]), and treat a
//! duplicated non-repeated field as "last one wins".

use super::leb128;
use core::iter;

/// Encodes a field tag. `wire_ty` is `0` for varint fields and `2` for length-delimited fields.
pub(crate) fn tag_encode(field: u64, wire_ty: u8) -> impl Iterator<Item = u8> + Clone {
    leb128::encode((field << 3) | u64::from(wire_ty))
}

/// Encodes a tag and a varint-typed value (`uint32`, `uint64`, `enum`).
pub(crate) fn varint_tag_encode(field: u64, value: u64) -> impl Iterator<Item = u8> + Clone {
    tag_encode(field, 0).chain(leb128::encode(value))
}

/// Encodes a tag and a `bool` value.
pub(crate) fn bool_tag_encode(field: u64, value: bool) -> impl Iterator<Item = u8> + Clone {
    varint_tag_encode(field, if value { 1 } else { 0 })
}

/// Encodes a tag and a length-delimited value (`bytes`, `string`, or an embedded message whose
/// encoding is already available).
pub(crate) fn bytes_tag_encode<'a>(
    field: u64,
    data: impl AsRef<[u8]> + 'a,
) -> impl Iterator<Item = impl AsRef<[u8]> + 'a> + 'a {
    tag_encode(field, 2)
        .chain(leb128::encode_usize(data.as_ref().len()))
        .map(|b| either::Right([b]))
        .chain(iter::once(either::Left(data)))
}

/// Encodes a tag and a `string` value.
pub(crate) fn string_tag_encode<'a>(
    field: u64,
    data: impl AsRef<str> + 'a,
) -> impl Iterator<Item = impl AsRef<[u8]> + 'a> + 'a {
    struct Wrapper<T>(T);
    impl<T: AsRef<str>> AsRef<[u8]> for Wrapper<T> {
        fn as_ref(&self) -> &[u8] {
            self.0.as_ref().as_bytes()
        }
    }

    bytes_tag_encode(field, Wrapper(data))
}

/// Decodes a field tag. On success, returns the field number and wire type.
pub(crate) fn tag_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], (u64, u8), E> {
    nom::combinator::map(leb128::nom_leb128_u64, |num| {
        (num >> 3, u8::try_from(num & 0b111).unwrap())
    })(bytes)
}

/// Decodes the value of a varint-typed field (wire type 0).
pub(crate) fn varint_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], u64, E> {
    leb128::nom_leb128_u64(bytes)
}

/// Decodes the value of a length-delimited field (wire type 2).
pub(crate) fn delimited_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], &'a [u8], E> {
    nom::multi::length_data(leb128::nom_leb128_usize)(bytes)
}

/// Decodes the value of a `string` field (wire type 2, UTF-8 content).
pub(crate) fn string_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], &'a str, E> {
    nom::combinator::map_opt(delimited_decode, |bytes| core::str::from_utf8(bytes).ok())(bytes)
}

/// Decodes the value of a `bool` field (wire type 0). Values other than 0 and 1 are rejected.
pub(crate) fn bool_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], bool, E> {
    nom::combinator::map_opt(varint_decode, |num| match num {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    })(bytes)
}

/// Decodes and discards the value of a field of the given wire type. Used to skip over unknown
/// fields.
pub(crate) fn value_skip_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    wire_ty: u8,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], (), E> {
    move |bytes| match wire_ty {
        0 => nom::combinator::map(leb128::nom_leb128_u64, |_| ())(bytes),
        1 => nom::combinator::map(nom::bytes::complete::take(8u32), |_| ())(bytes),
        2 => nom::combinator::map(delimited_decode, |_| ())(bytes),
        5 => nom::combinator::map(nom::bytes::complete::take(4u32), |_| ())(bytes),
        _ => Err(nom::Err::Error(nom::error::make_error(
            bytes,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

#[cfg(test)]
mod tests {
    fn collect(iter: impl Iterator<Item = impl AsRef<[u8]>>) -> Vec<u8> {
        iter.fold(Vec::new(), |mut a, b| {
            a.extend_from_slice(b.as_ref());
            a
        })
    }

    #[test]
    fn bytes_field_encode() {
        assert_eq!(
            collect(super::bytes_tag_encode(1, [0xaa, 0xbb, 0xcc])),
            &[0x0a, 0x03, 0xaa, 0xbb, 0xcc]
        );
    }

    #[test]
    fn string_field_encode() {
        assert_eq!(
            collect(super::string_tag_encode(2, "hi")),
            &[0x12, 0x02, b'h', b'i']
        );
    }

    #[test]
    fn varint_field_encode() {
        assert_eq!(
            super::varint_tag_encode(3, 300).collect::<Vec<_>>(),
            &[0x18, 0xac, 0x02]
        );
    }

    #[test]
    fn tag_round_trip() {
        let encoded = super::tag_encode(5, 2).collect::<Vec<_>>();
        let (rest, (field, wire_ty)) =
            super::tag_decode::<nom::error::Error<&[u8]>>(&encoded).unwrap();
        assert!(rest.is_empty());
        assert_eq!((field, wire_ty), (5, 2));
    }

    #[test]
    fn skip_unknown_fields() {
        // Message with an unknown varint field 7 and an unknown delimited field 9.
        let encoded = {
            let mut buf = super::varint_tag_encode(7, 1234).collect::<Vec<_>>();
            buf.extend(collect(super::bytes_tag_encode(9, b"unknown")));
            buf
        };

        let mut input = &encoded[..];
        while !input.is_empty() {
            let (rest, (_, wire_ty)) =
                super::tag_decode::<nom::error::Error<&[u8]>>(input).unwrap();
            let (rest, ()) =
                super::value_skip_decode::<nom::error::Error<&[u8]>>(wire_ty)(rest).unwrap();
            input = rest;
        }
    }
}
