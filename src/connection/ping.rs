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

//! Ping protocol.
//!
//! The ping protocol is the simplest of the libp2p protocols: the side that opened the
//! substream sends 32 bytes of random data, and the other side sends the same 32 bytes back.
//! It is typically used to measure round-trip times and to verify that a connection is still
//! alive.
//!
//! The name to negotiate with *multistream-select* is given by the [`PROTOCOL_NAME`]
//! constant.

use crate::read_write::ReadWrite;

use alloc::collections::VecDeque;
use core::cmp;

/// Name of the protocol, typically used when negotiating it with *multistream-select*.
pub const PROTOCOL_NAME: &str = "/ipfs/ping/1.0.0";

/// Size, in bytes, of a ping payload.
pub const PAYLOAD_SIZE: usize = 32;

/// State machine for one outbound ping on a substream the local node has opened.
pub struct OutboundPing {
    /// Payload sent out and expected to be mirrored back.
    payload: [u8; PAYLOAD_SIZE],
    /// Number of bytes of the payload already written out.
    num_written: usize,
    /// Number of bytes of the echo already received and verified.
    num_matched: usize,
}

impl OutboundPing {
    /// Initializes an outbound ping. The payload must be randomly generated, as the answer of
    /// the remote is only meaningful if it couldn't have been predicted.
    pub fn new(payload: [u8; PAYLOAD_SIZE]) -> Self {
        OutboundPing {
            payload,
            num_written: 0,
            num_matched: 0,
        }
    }

    /// Writes out the payload and verifies the echo. Returns `true` once the full echo has
    /// been received.
    ///
    /// An error is returned if the bytes sent back by the remote differ from the payload. The
    /// substream should then be reset.
    pub fn read_write<TNow>(
        &mut self,
        read_write: &mut ReadWrite<'_, TNow>,
    ) -> Result<bool, PingError> {
        let to_write = cmp::min(
            PAYLOAD_SIZE - self.num_written,
            read_write.outgoing_buffer_available(),
        );
        read_write.write_out(&self.payload[self.num_written..self.num_written + to_write]);
        self.num_written += to_write;

        let expecting = PAYLOAD_SIZE - self.num_matched;
        for byte in read_write.incoming_bytes_iter().take(expecting) {
            if byte != self.payload[self.num_matched] {
                return Err(PingError::PayloadMismatch);
            }
            self.num_matched += 1;
        }

        Ok(self.num_matched == PAYLOAD_SIZE)
    }
}

/// State machine answering pings on a substream the remote has opened.
///
/// Simply mirrors back every byte it receives, which answers any number of successive pings.
pub struct InboundPing {
    /// Bytes received and not yet mirrored back.
    pending: VecDeque<u8>,
}

impl InboundPing {
    /// Initializes the responder.
    pub fn new() -> Self {
        InboundPing {
            pending: VecDeque::new(),
        }
    }

    /// Copies incoming data back to the outgoing direction.
    pub fn read_write<TNow>(&mut self, read_write: &mut ReadWrite<'_, TNow>) {
        // The amount of buffered data is bounded in order to not let a remote that sends a
        // lot of data but never reads the answers consume memory.
        let budget = (4 * PAYLOAD_SIZE).saturating_sub(self.pending.len());
        let to_pull = cmp::min(budget, read_write.incoming_buffer_available());
        self.pending.extend(read_write.incoming_bytes_iter().take(to_pull));
        read_write.write_from_vec_deque(&mut self.pending);
    }
}

impl Default for InboundPing {
    fn default() -> Self {
        InboundPing::new()
    }
}

/// Error potentially returned by [`OutboundPing::read_write`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum PingError {
    /// The bytes sent back by the remote don't match the payload that was sent out.
    PayloadMismatch,
}

#[cfg(test)]
mod tests {
    use super::{InboundPing, OutboundPing, PingError, PAYLOAD_SIZE};
    use crate::read_write::ReadWrite;

    #[test]
    fn ping_loopback() {
        let payload: [u8; PAYLOAD_SIZE] = rand::random();
        let mut outbound = OutboundPing::new(payload);
        let mut inbound = InboundPing::new();

        let mut buf_out_to_in = Vec::new();
        let mut buf_in_to_out = Vec::new();

        for _ in 0..8 {
            // Drive the outbound side with a deliberately small buffer.
            {
                let mut out_buf = [0; 7];
                let mut rw = ReadWrite {
                    now: 0,
                    incoming_buffer: Some(&buf_in_to_out),
                    outgoing_buffer: Some((&mut out_buf, &mut [])),
                    read_bytes: 0,
                    written_bytes: 0,
                    wake_up_after: None,
                };
                let done = outbound.read_write(&mut rw).unwrap();
                let (read, written) = (rw.read_bytes, rw.written_bytes);
                buf_in_to_out.drain(..read);
                buf_out_to_in.extend_from_slice(&out_buf[..written]);
                if done {
                    return;
                }
            }

            // Drive the responder.
            {
                let mut out_buf = [0; 64];
                let mut rw = ReadWrite {
                    now: 0,
                    incoming_buffer: Some(&buf_out_to_in),
                    outgoing_buffer: Some((&mut out_buf, &mut [])),
                    read_bytes: 0,
                    written_bytes: 0,
                    wake_up_after: None,
                };
                inbound.read_write(&mut rw);
                let (read, written) = (rw.read_bytes, rw.written_bytes);
                buf_out_to_in.drain(..read);
                buf_in_to_out.extend_from_slice(&out_buf[..written]);
            }
        }

        panic!("ping never completed");
    }

    #[test]
    fn corrupted_echo_detected() {
        let payload: [u8; PAYLOAD_SIZE] = rand::random();
        let mut outbound = OutboundPing::new(payload);

        // Write the payload out.
        let mut out_buf = [0; PAYLOAD_SIZE];
        let mut rw = ReadWrite {
            now: 0,
            incoming_buffer: Some(&[]),
            outgoing_buffer: Some((&mut out_buf, &mut [])),
            read_bytes: 0,
            written_bytes: 0,
            wake_up_after: None,
        };
        assert!(!outbound.read_write(&mut rw).unwrap());
        drop(rw);

        // Echo back a corrupted payload.
        let mut echo = payload;
        echo[7] ^= 0xff;
        let mut rw = ReadWrite {
            now: 0,
            incoming_buffer: Some(&echo),
            outgoing_buffer: Some((&mut [], &mut [])),
            read_bytes: 0,
            written_bytes: 0,
            wake_up_after: None,
        };
        assert_eq!(
            outbound.read_write(&mut rw),
            Err(PingError::PayloadMismatch)
        );
    }
}
