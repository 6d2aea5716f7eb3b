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

//! Little Endian Base 128
//!
//! The LEB128 encoding is used throughout the networking code: multiaddr components,
//! multistream-select frames, mplex headers, and floodsub RPCs all start with a LEB128-encoded
//! integer. This module provides utilities for encoding/decoding this format.
//!
//! Values are limited to 63 bits. A value whose encoding requires a tenth byte is rejected, as
//! are encodings that aren't the minimal representation of their value (e.g. `[0x81, 0x00]`).
//!
//! See <https://en.wikipedia.org/wiki/LEB128>.

use alloc::vec::Vec;
use core::cmp;

/// Maximum number of bytes the encoding of a value can occupy. Nine bytes of seven payload bits
/// each cover 63 bits.
const MAX_NUM_BYTES: usize = 9;

/// Returns an LEB128-encoded integer as a list of bytes.
///
/// This function accepts as parameter an `Into<u64>`. As such, one can also pass a `u8`, `u16`,
/// or `u32` for example. Use [`encode_usize`] for the `usize` equivalent.
pub fn encode(value: impl Into<u64>) -> impl ExactSizeIterator<Item = u8> + Clone {
    #[derive(Clone)]
    struct EncodeIter {
        value: u64,
        finished: bool,
    }

    impl Iterator for EncodeIter {
        type Item = u8;

        fn next(&mut self) -> Option<Self::Item> {
            if self.finished {
                return None;
            }

            if self.value < (1 << 7) {
                self.finished = true;
                return Some(u8::try_from(self.value).unwrap());
            }

            let ret = (1 << 7) | u8::try_from(self.value & 0b111_1111).unwrap();
            self.value >>= 7;
            Some(ret)
        }

        fn size_hint(&self) -> (usize, Option<usize>) {
            let len = self.clone().count();
            (len, Some(len))
        }
    }

    impl ExactSizeIterator for EncodeIter {}

    EncodeIter {
        value: value.into(),
        finished: false,
    }
}

/// Returns an LEB128-encoded `usize` as a list of bytes.
///
/// See also [`encode`].
pub fn encode_usize(value: usize) -> impl ExactSizeIterator<Item = u8> + Clone {
    encode(u64::try_from(value).unwrap())
}

/// Decodes an LEB128-encoded `u64`.
///
/// > **Note**: When using this function outside of a `nom` "context", you might have to explicit
/// >           the type of `E`. Use `nom::error::Error<&[u8]>`.
pub(crate) fn nom_leb128_u64<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], u64, E> {
    let mut out = 0u64;

    for (n, byte) in bytes.iter().enumerate() {
        if n >= MAX_NUM_BYTES {
            return Err(nom::Err::Error(nom::error::make_error(
                bytes,
                nom::error::ErrorKind::LengthValue,
            )));
        }

        out |= u64::from(*byte & 0b111_1111) << (7 * n);

        if (*byte & 0x80) == 0 {
            // Reject non-minimal encodings such as `[0x81, 0x0]`.
            if n >= 1 && *byte == 0x0 {
                return Err(nom::Err::Error(nom::error::make_error(
                    bytes,
                    nom::error::ErrorKind::Verify,
                )));
            }

            return Ok((&bytes[(n + 1)..], out));
        }
    }

    Err(nom::Err::Error(nom::error::make_error(
        bytes,
        nom::error::ErrorKind::Eof,
    )))
}

/// Decodes an LEB128-encoded `usize`.
///
/// Identical to [`nom_leb128_u64`], with an additional check that the value fits in a `usize`.
pub(crate) fn nom_leb128_usize<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], usize, E> {
    let (rest, value) = nom_leb128_u64(bytes)?;

    match usize::try_from(value) {
        Ok(value) => Ok((rest, value)),
        Err(_) => Err(nom::Err::Error(nom::error::make_error(
            bytes,
            nom::error::ErrorKind::LengthValue,
        ))),
    }
}

/// State of the reception of one LEB128-length-prefixed frame.
///
/// Frames consist of a LEB128-encoded length followed by that many bytes of content. Because
/// data arrives from the socket in chunks of arbitrary sizes, reception must be incremental,
/// which this enum implements: feed chunks to [`FramedInProgress::update`] until it returns
/// [`Framed::Finished`].
pub enum Framed {
    InProgress(FramedInProgress),
    Finished(Vec<u8>),
}

/// A frame whose reception hasn't finished yet.
pub struct FramedInProgress {
    max_len: usize,
    buffer: Vec<u8>,
    inner: FramedInner,
}

enum FramedInner {
    Length,
    Body { expected_len: usize },
}

impl FramedInProgress {
    /// Initializes the reception of a new frame.
    ///
    /// Must be passed the maximum allowed length of the frame, according to the protocol. This
    /// value is also used as the size to pre-allocate the buffer that is later returned in
    /// [`Framed::Finished`], and is consequently assumed to be reasonably small.
    pub fn new(max_len: usize) -> Self {
        FramedInProgress {
            max_len,
            buffer: Vec::with_capacity(cmp::min(max_len, 128)),
            inner: FramedInner::Length,
        }
    }

    /// Feeds data to the state machine. Returns the number of bytes consumed from `data` and the
    /// new state of the frame.
    pub fn update(mut self, mut data: &[u8]) -> Result<(usize, Framed), FramedError> {
        let mut total_read = 0;

        loop {
            match self.inner {
                FramedInner::Length => {
                    if data.is_empty() {
                        return Ok((total_read, Framed::InProgress(self)));
                    }

                    self.buffer.push(data[0]);
                    data = &data[1..];
                    total_read += 1;

                    match nom_leb128_usize::<nom::error::Error<&[u8]>>(&self.buffer) {
                        Ok((_, expected_len)) => {
                            if expected_len > self.max_len {
                                return Err(FramedError::MaxLengthExceeded {
                                    max_allowed: self.max_len,
                                });
                            }
                            self.buffer.clear();
                            self.buffer.reserve(expected_len);
                            self.inner = FramedInner::Body { expected_len };
                        }
                        // An `Eof` error indicates that the length prefix is still incomplete.
                        Err(nom::Err::Error(err))
                            if err.code == nom::error::ErrorKind::Eof
                                && self.buffer.len() < MAX_NUM_BYTES => {}
                        Err(_) => return Err(FramedError::InvalidLengthPrefix),
                    }
                }
                FramedInner::Body { expected_len } => {
                    debug_assert!(self.buffer.len() <= expected_len);
                    let missing = expected_len - self.buffer.len();
                    let available = cmp::min(missing, data.len());
                    self.buffer.extend_from_slice(&data[..available]);
                    debug_assert!(self.buffer.len() <= expected_len);
                    total_read += available;

                    if expected_len == self.buffer.len() {
                        return Ok((total_read, Framed::Finished(self.buffer)));
                    }
                    return Ok((total_read, Framed::InProgress(self)));
                }
            }
        }
    }
}

/// Error potentially returned by [`FramedInProgress::update`].
#[derive(Debug, Clone, derive_more::Display)]
pub enum FramedError {
    /// The length prefix is either too large to represent a valid size, or isn't the minimal
    /// LEB128 representation of its value.
    InvalidLengthPrefix,
    /// Maximum length of the frame has been exceeded.
    #[display(
        fmt = "Maximum length of the frame ({}) has been exceeded",
        max_allowed
    )]
    MaxLengthExceeded {
        /// Maximum number of bytes allowed.
        max_allowed: usize,
    },
}
