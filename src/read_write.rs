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

//! Buffers synchronization object.
//!
//! Every protocol state machine of this crate exposes a `read_write` method taking a
//! [`ReadWrite`] as parameter. The [`ReadWrite`] represents one round of synchronization with
//! the socket: it points to the data that has been received and not yet processed, and to the
//! (uninitialized) buffer space where outgoing data can be written. After the call, the API user
//! must remove [`ReadWrite::read_bytes`] bytes from its receive queue and send out the
//! [`ReadWrite::written_bytes`] bytes that have been written.
//!
//! The `TNow` generic parameter is the type of the current instant. State machines compare and
//! add `Duration`s to it but never construct one, which keeps the entire crate independent from
//! any clock.

use alloc::collections::VecDeque;
use core::{cmp, mem};

#[must_use]
pub struct ReadWrite<'a, TNow> {
    /// The moment at which this synchronization round happens.
    pub now: TNow,

    /// Data coming from the socket, ready to be processed.
    ///
    /// Contains `None` if the remote has closed their writing side of the socket.
    pub incoming_buffer: Option<&'a [u8]>,

    /// Two consecutive buffers of uninitialized data where outgoing data can be written.
    ///
    /// Two buffers rather than one so that ring buffers can be used by the API user without any
    /// copy. Contains `None` if the writing side of the socket has been closed or must be
    /// closed.
    pub outgoing_buffer: Option<(&'a mut [u8], &'a mut [u8])>,

    /// Total number of bytes that have been read from [`ReadWrite::incoming_buffer`] during this
    /// round. [`ReadWrite::incoming_buffer`] has been advanced past these bytes.
    pub read_bytes: usize,

    /// Total number of bytes that have been written to [`ReadWrite::outgoing_buffer`] during
    /// this round. [`ReadWrite::outgoing_buffer`] has been advanced past these bytes.
    pub written_bytes: usize,

    /// If `Some`, the state machine must be called again once the given `TNow` is reached, even
    /// if no socket activity happens in between.
    pub wake_up_after: Option<TNow>,
}

impl<'a, TNow> ReadWrite<'a, TNow> {
    /// Returns true if the connection should be considered dead, in other words if both the
    /// reading and writing sides are closed.
    pub fn is_dead(&self) -> bool {
        self.incoming_buffer.is_none() && self.outgoing_buffer.is_none()
    }

    /// Returns the number of bytes available in the incoming buffer.
    pub fn incoming_buffer_available(&self) -> usize {
        self.incoming_buffer.as_ref().map_or(0, |buf| buf.len())
    }

    /// Returns the number of bytes available in the outgoing buffer.
    pub fn outgoing_buffer_available(&self) -> usize {
        self.outgoing_buffer
            .as_ref()
            .map_or(0, |(a, b)| a.len() + b.len())
    }

    /// Discards the first `num` bytes of [`ReadWrite::incoming_buffer`] and accounts for them in
    /// [`ReadWrite::read_bytes`].
    ///
    /// # Panic
    ///
    /// Panics if `num` is larger than the size of the available incoming data.
    ///
    pub fn advance_read(&mut self, num: usize) {
        if let Some(ref mut incoming_buffer) = self.incoming_buffer {
            self.read_bytes += num;
            *incoming_buffer = &incoming_buffer[num..];
        } else {
            assert_eq!(num, 0);
        }
    }

    /// Shortcut to [`ReadWrite::advance_read`] that discards all the incoming data.
    pub fn discard_all_incoming(&mut self) {
        let len = self.incoming_buffer_available();
        self.advance_read(len);
    }

    /// Extracts `N` bytes from [`ReadWrite::incoming_buffer`] and updates
    /// [`ReadWrite::read_bytes`].
    ///
    /// # Panic
    ///
    /// Panics if fewer than `N` bytes are available.
    ///
    pub fn read_bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        match self.incoming_buffer {
            Some(buf) => {
                assert!(buf.len() >= N);
                out.copy_from_slice(&buf[..N]);
                self.advance_read(N);
            }
            None => assert_eq!(N, 0),
        }
        out
    }

    /// Returns an iterator that pops bytes from [`ReadWrite::incoming_buffer`]. Every byte the
    /// iterator produces increases [`ReadWrite::read_bytes`] by 1.
    pub fn incoming_bytes_iter<'b>(&'b mut self) -> IncomingBytes<'a, 'b, TNow> {
        IncomingBytes { me: self }
    }

    /// Discards the first `num` bytes of [`ReadWrite::outgoing_buffer`] and accounts for them in
    /// [`ReadWrite::written_bytes`].
    ///
    /// # Panic
    ///
    /// Panics if `num` is larger than the size of the available outgoing buffer.
    ///
    pub fn advance_write(&mut self, num: usize) {
        if let Some(ref mut outgoing_buffer) = self.outgoing_buffer {
            self.written_bytes += num;

            let in_first = cmp::min(num, outgoing_buffer.0.len());
            advance_buf(&mut outgoing_buffer.0, in_first);
            advance_buf(&mut outgoing_buffer.1, num - in_first);
            if outgoing_buffer.0.is_empty() && !outgoing_buffer.1.is_empty() {
                mem::swap::<&mut [u8]>(&mut outgoing_buffer.0, &mut outgoing_buffer.1);
            }
        } else {
            assert_eq!(num, 0);
        }
    }

    /// Copies the content of `data` to [`ReadWrite::outgoing_buffer`] and increases
    /// [`ReadWrite::written_bytes`].
    ///
    /// # Panic
    ///
    /// Panics if `data.len() > self.outgoing_buffer_available()`.
    ///
    pub fn write_out(&mut self, data: &[u8]) {
        let outgoing_buffer = match &mut self.outgoing_buffer {
            Some(b) => b,
            None => {
                assert!(data.is_empty());
                return;
            }
        };

        assert!(data.len() <= outgoing_buffer.0.len() + outgoing_buffer.1.len());

        let to_first = cmp::min(outgoing_buffer.0.len(), data.len());
        outgoing_buffer.0[..to_first].copy_from_slice(&data[..to_first]);
        outgoing_buffer.1[..data.len() - to_first].copy_from_slice(&data[to_first..]);

        self.advance_write(data.len());
    }

    /// Copies as much as possible from the front of `data` to
    /// [`ReadWrite::outgoing_buffer`], increases [`ReadWrite::written_bytes`], and removes the
    /// written bytes from `data`.
    pub fn write_from_vec_deque(&mut self, data: &mut VecDeque<u8>) {
        let (slice1, slice2) = data.as_slices();

        let outgoing_available = self.outgoing_buffer_available();
        let to_copy1 = cmp::min(slice1.len(), outgoing_available);
        let to_copy2 = if to_copy1 == slice1.len() {
            cmp::min(slice2.len(), outgoing_available - to_copy1)
        } else {
            0
        };

        self.write_out(&slice1[..to_copy1]);
        self.write_out(&slice2[..to_copy2]);

        for _ in 0..(to_copy1 + to_copy2) {
            data.pop_front();
        }
    }

    /// Sets [`ReadWrite::wake_up_after`] to `min(self.wake_up_after, after)`.
    pub fn wake_up_after(&mut self, after: &TNow)
    where
        TNow: Clone + Ord,
    {
        match self.wake_up_after {
            Some(ref t) if *t <= *after => {}
            ref mut t => *t = Some(after.clone()),
        }
    }
}

fn advance_buf(buf: &mut &mut [u8], n: usize) {
    let tmp = mem::take(buf);
    *buf = &mut tmp[n..];
}

/// See [`ReadWrite::incoming_bytes_iter`].
pub struct IncomingBytes<'a, 'b, TNow> {
    me: &'b mut ReadWrite<'a, TNow>,
}

impl<'a, 'b, TNow> Iterator for IncomingBytes<'a, 'b, TNow> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let buf = self.me.incoming_buffer.as_mut()?;
        let (byte, rest) = buf.split_first()?;
        *buf = rest;
        self.me.read_bytes += 1;
        Some(*byte)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.me.incoming_buffer_available();
        (len, Some(len))
    }
}

impl<'a, 'b, TNow> ExactSizeIterator for IncomingBytes<'a, 'b, TNow> {}
