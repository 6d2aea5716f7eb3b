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

//! A multihash is a small data structure containing a code (an integer) and data. The format of
//! the data depends on the code.
//!
//! On the wire, a multihash is the LEB128-encoded code, followed by the LEB128-encoded length of
//! the data, followed by the data itself.
//!
//! See <https://github.com/multiformats/multihash>

use crate::util::leb128;

use alloc::vec::Vec;
use core::fmt;

/// A multihash made of a code and a slice of data.
///
/// This type is a *reference* to a multihash stored somewhere else, such as in a `Vec<u8>`. You
/// are not supposed to store a `MultihashRef` for long term usage; instead, store the underlying
/// buffer and construct a `MultihashRef` from it when needed.
#[derive(Clone, PartialEq, Eq)]
pub struct MultihashRef<'a>(u32, &'a [u8]);

impl<'a> MultihashRef<'a> {
    /// Builds a multihash from the "identity" hash algorithm code and the provided data.
    ///
    /// Calling [`MultihashRef::data`] on the returned value will always yield back the same data
    /// as was passed as parameter.
    pub fn identity(data: &'a [u8]) -> Self {
        MultihashRef(0, data)
    }

    /// Returns the code stored in this multihash.
    pub fn hash_algorithm_code(&self) -> u32 {
        self.0
    }

    /// Returns the data stored in this multihash.
    pub fn data(&self) -> &'a [u8] {
        self.1
    }

    /// Checks whether `input` is a valid multihash.
    pub fn from_bytes(input: &'a [u8]) -> Result<MultihashRef<'a>, FromBytesError> {
        match nom::combinator::all_consuming(multihash::<nom::error::Error<&[u8]>>)(input) {
            Ok((_rest, multihash)) => {
                debug_assert!(_rest.is_empty());
                Ok(multihash)
            }
            Err(_) => Err(FromBytesError::DecodeError),
        }
    }

    /// Returns the serialized version of this multihash.
    pub fn to_vec(&self) -> Vec<u8> {
        leb128::encode(self.0)
            .chain(leb128::encode_usize(self.1.len()))
            .chain(self.1.iter().copied())
            .collect()
    }
}

/// Error when turning bytes into a [`MultihashRef`].
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum FromBytesError {
    /// The multihash is invalid.
    DecodeError,
}

impl<'a> fmt::Debug for MultihashRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultihashRef({}, ", self.0)?;
        for byte in self.1 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Parses a multihash from `bytes`, in nom fashion.
pub(crate) fn multihash<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], MultihashRef<'a>, E> {
    nom::combinator::map(
        nom::sequence::tuple((
            nom::combinator::map_opt(leb128::nom_leb128_u64, |c| u32::try_from(c).ok()),
            nom::multi::length_data(leb128::nom_leb128_usize),
        )),
        |(code, data)| MultihashRef(code, data),
    )(bytes)
}

#[cfg(test)]
mod tests {
    use super::MultihashRef;

    #[test]
    fn round_trip() {
        let data = [1, 2, 3, 4];
        let encoded = MultihashRef::identity(&data).to_vec();
        assert_eq!(encoded, &[0x0, 0x4, 1, 2, 3, 4]);

        let decoded = MultihashRef::from_bytes(&encoded).unwrap();
        assert_eq!(decoded.hash_algorithm_code(), 0);
        assert_eq!(decoded.data(), &data);
    }

    #[test]
    fn sha256_example() {
        // 0x12 = sha2-256, 0x20 = 32 bytes of data.
        let mut encoded = vec![0x12, 0x20];
        encoded.extend_from_slice(&[0xab; 32]);

        let decoded = MultihashRef::from_bytes(&encoded).unwrap();
        assert_eq!(decoded.hash_algorithm_code(), 0x12);
        assert_eq!(decoded.data(), &[0xab; 32]);
        assert_eq!(decoded.to_vec(), encoded);
    }

    #[test]
    fn trailing_data_rejected() {
        let encoded = [0x0, 0x2, 1, 2, 3];
        assert!(MultihashRef::from_bytes(&encoded).is_err());
    }

    #[test]
    fn truncated_rejected() {
        let encoded = [0x12, 0x20, 1, 2, 3];
        assert!(MultihashRef::from_bytes(&encoded).is_err());
    }
}
