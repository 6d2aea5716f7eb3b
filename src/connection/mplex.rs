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

//! Mplex multiplexing protocol.
//!
//! The mplex protocol is a multiplexing protocol. It allows dividing a single stream of data,
//! typically an encrypted connection, into multiple individual parallel substreams. The data
//! sent and received over that single stream is divided into frames, each of which belongs to
//! a specific substream. In other words, the data transmitted over the substreams is
//! interleaved.
//!
//! Specification available at <https://github.com/libp2p/specs/tree/master/mplex>.
//!
//! # Wire format
//!
//! Each frame starts with a LEB128-encoded header equal to `(stream_id << 3) | flag`, followed
//! by the LEB128-encoded length of the frame's data and that many bytes of data. The three
//! bits of flag encode both the meaning of the frame and the role, within the substream, of
//! the sender: `NewStream` (0), `MessageReceiver` (1), `MessageInitiator` (2),
//! `CloseReceiver` (3), `CloseInitiator` (4), `ResetReceiver` (5), `ResetInitiator` (6).
//!
//! Because each side numbers the substreams it opens independently, a substream is identified
//! by the pair of its numeric id and of which side opened it. The role encoded in the flag is
//! authoritative for dispatching: a `*Receiver` frame was sent by the non-opening side and
//! therefore concerns a substream opened locally, and vice versa.
//!
//! # Usage
//!
//! The [`Mplex`] object holds the state of all mplex-specific information, and the list of all
//! currently-open substreams.
//!
//! Call [`Mplex::incoming_data`] when data is available on the connection. This function
//! parses the received data, updates the internal state machine, and possibly returns an
//! [`IncomingDataDetail`]. Call [`Mplex::extract_out`] when the remote is ready to accept more
//! data.
//!
//! The generic parameter of [`Mplex`] is an opaque "user data" associated to each substream.
//!
//! Each substream buffers incoming data until the API user reads it. When the buffer of a
//! substream is full, [`Mplex::incoming_data`] stops consuming data from the connection, which
//! propagates the back-pressure to the remote.

use crate::util::{leb128, SipHasherBuild};

use alloc::{collections::VecDeque, vec::Vec};
use core::{cmp, fmt};
use rand::Rng as _;
use rand_chacha::{rand_core::SeedableRng as _, ChaCha20Rng};

/// Name of the protocol, typically used when negotiating it with *multistream-select*.
pub const PROTOCOL_NAME: &str = "/mplex/6.7.0";

/// Maximum number of bytes of data put in a single outgoing frame. Chunking bounds the time
/// during which the connection is monopolized by one substream.
const MAX_OUT_FRAME_DATA: usize = 8192;

/// Configuration for a new [`Mplex`].
#[derive(Debug)]
pub struct Config {
    /// `true` if the local machine has initiated the connection. Only used to decide the
    /// parity of the locally-allocated substream ids, as a debugging aid.
    pub is_initiator: bool,

    /// Expected number of substreams simultaneously open, both inbound and outbound combined.
    pub capacity: usize,

    /// Maximum size, in bytes, of the data of an incoming frame. Frames larger than this
    /// trigger a protocol error, as they would otherwise force unbounded buffering.
    pub max_frame_len: usize,

    /// Maximum number of bytes buffered per substream waiting to be read by the API user.
    /// When a substream reaches this limit, reading from the connection stops until the
    /// buffer is drained.
    pub max_buffered_per_substream: usize,

    /// Seed used for the randomness. Used to avoid HashDoS attacks on the substreams table.
    pub randomness_seed: [u8; 32],
}

/// Identifier of a substream in the context of a connection.
///
/// Contains both the numeric id and which side of the connection opened the substream, as the
/// two sides number their substreams independently.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubstreamId(u64, Opener);

/// Which side of the connection has opened a given substream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Opener {
    Local,
    Remote,
}

/// Frame flags. The values are the wire encoding.
const FLAG_NEW_STREAM: u64 = 0;
const FLAG_MESSAGE_RECEIVER: u64 = 1;
const FLAG_MESSAGE_INITIATOR: u64 = 2;
const FLAG_CLOSE_RECEIVER: u64 = 3;
const FLAG_CLOSE_INITIATOR: u64 = 4;
const FLAG_RESET_RECEIVER: u64 = 5;
const FLAG_RESET_INITIATOR: u64 = 6;

pub struct Mplex<T> {
    /// List of substreams currently open in the mplex state machine.
    ///
    /// A `SipHasher` is used in order to avoid hash collision attacks on substream ids.
    substreams: hashbrown::HashMap<SubstreamId, Substream<T>, SipHasherBuild>,

    /// What kind of data is expected on the connection next.
    incoming: Incoming,

    /// Frame currently being written out, if any.
    outgoing: Option<VecDeque<u8>>,

    /// Control frames waiting to be sent out, in order. Contains `NewStream` announcements and
    /// resets. Close frames are not in this queue because they must be emitted after the data
    /// already buffered on their substream; see [`Substream::close_pending`].
    pending_control: VecDeque<(SubstreamId, PendingControl)>,

    /// Id of the next outgoing substream to open. Incremented by two at each substream.
    next_outbound_id: u64,

    /// See [`Config::max_frame_len`].
    max_frame_len: usize,

    /// See [`Config::max_buffered_per_substream`].
    max_buffered_per_substream: usize,
}

enum PendingControl {
    /// Announce a locally-opened substream. Contains the name to send.
    NewStream(Vec<u8>),
    /// Abruptly destroy the substream.
    Reset,
}

struct Substream<T> {
    /// True if the writing side of the local node is closed for this substream, either because
    /// [`Mplex::close_substream`] has been called or because the substream was reset.
    local_write_closed: bool,
    /// True if a close frame must be sent out once the data in [`Substream::write_buffers`]
    /// has been flushed.
    close_pending: bool,
    /// True if the writing side of the remote is closed for this substream.
    remote_write_closed: bool,
    /// `true` if a reset of the substream has been performed, either locally or by the remote.
    was_reset: bool,
    /// Data received on this substream and not yet read by the API user.
    read_buffer: Vec<u8>,
    /// Buffers of data to be written out, in order.
    write_buffers: Vec<Vec<u8>>,
    /// Number of bytes of `write_buffers[0]` that have already been extracted.
    first_write_buffer_offset: usize,
    /// Data chosen by the user.
    user_data: T,
}

impl<T> Substream<T> {
    fn new(user_data: T) -> Self {
        Substream {
            local_write_closed: false,
            close_pending: false,
            remote_write_closed: false,
            was_reset: false,
            read_buffer: Vec::new(),
            write_buffers: Vec::new(),
            first_write_buffer_offset: 0,
            user_data,
        }
    }

    fn queued_write_bytes(&self) -> usize {
        self.write_buffers
            .iter()
            .fold(0, |total, buf| total + buf.len())
            - self.first_write_buffer_offset
    }

    fn reset(&mut self) {
        self.local_write_closed = true;
        self.remote_write_closed = true;
        self.close_pending = false;
        self.was_reset = true;
        self.write_buffers.clear();
        self.first_write_buffer_offset = 0;
    }
}

enum Incoming {
    /// Expecting the header of the next frame. The field contains the already-received bytes
    /// of the LEB128 header.
    Header(arrayvec::ArrayVec<u8, 9>),
    /// Header has been received; expecting the LEB128 length of the frame's data.
    Length {
        header: u64,
        buffer: arrayvec::ArrayVec<u8, 9>,
    },
    /// Receiving the name carried by a `NewStream` frame.
    NewStreamName {
        substream_id: SubstreamId,
        name: Vec<u8>,
        remaining_bytes: usize,
    },
    /// A `NewStream` frame has been fully received. The reception of any further data is
    /// blocked waiting for the API user to accept or reject this substream.
    PendingIncomingSubstream {
        substream_id: SubstreamId,
        name: Vec<u8>,
    },
    /// Receiving the data of a message frame, to be delivered to the given substream.
    DataFrame {
        substream_id: SubstreamId,
        remaining_bytes: usize,
    },
    /// Receiving data that must be thrown away, because it concerns an unknown or reset
    /// substream.
    SkipFrame { remaining_bytes: usize },
}

impl<T> Mplex<T> {
    /// Initializes a new mplex state machine.
    pub fn new(config: Config) -> Mplex<T> {
        let mut randomness = ChaCha20Rng::from_seed(config.randomness_seed);

        Mplex {
            substreams: hashbrown::HashMap::with_capacity_and_hasher(
                config.capacity,
                SipHasherBuild::new(randomness.gen()),
            ),
            incoming: Incoming::Header(arrayvec::ArrayVec::new()),
            outgoing: None,
            pending_control: VecDeque::new(),
            // By convention, the initiator of the connection allocates odd substream ids. The
            // wire protocol doesn't actually require this, as the opener of a substream is
            // encoded in the frame flags.
            next_outbound_id: if config.is_initiator { 1 } else { 2 },
            max_frame_len: config.max_frame_len,
            max_buffered_per_substream: config.max_buffered_per_substream,
        }
    }

    /// Opens a new locally-initiated substream.
    ///
    /// A `NewStream` frame is queued; it will be emitted by [`Mplex::extract_out`] before any
    /// data written on this substream.
    pub fn open_substream(&mut self, user_data: T) -> SubstreamId {
        let substream_id = SubstreamId(self.next_outbound_id, Opener::Local);
        self.next_outbound_id += 2;

        let _previous = self
            .substreams
            .insert(substream_id, Substream::new(user_data));
        debug_assert!(_previous.is_none());

        // An empty name; the remote identifies the substream by its id.
        self.pending_control
            .push_back((substream_id, PendingControl::NewStream(Vec::new())));

        substream_id
    }

    /// Accepts an incoming substream.
    ///
    /// Either [`Mplex::accept_pending_substream`] or [`Mplex::reject_pending_substream`] must
    /// be called after [`IncomingDataDetail::IncomingSubstream`] is returned. Reading from the
    /// connection is blocked until then.
    ///
    /// # Panic
    ///
    /// Panics if no incoming substream is currently pending.
    ///
    pub fn accept_pending_substream(&mut self, user_data: T) -> SubstreamId {
        match self.incoming {
            Incoming::PendingIncomingSubstream { substream_id, .. } => {
                let _previous = self
                    .substreams
                    .insert(substream_id, Substream::new(user_data));
                debug_assert!(_previous.is_none());
                self.incoming = Incoming::Header(arrayvec::ArrayVec::new());
                substream_id
            }
            _ => panic!(),
        }
    }

    /// Rejects an incoming substream. A reset frame is sent to the remote.
    ///
    /// # Panic
    ///
    /// Panics if no incoming substream is currently pending.
    ///
    pub fn reject_pending_substream(&mut self) {
        match self.incoming {
            Incoming::PendingIncomingSubstream { substream_id, .. } => {
                self.pending_control
                    .push_back((substream_id, PendingControl::Reset));
                self.incoming = Incoming::Header(arrayvec::ArrayVec::new());
            }
            _ => panic!(),
        }
    }

    /// Returns the name carried by the pending incoming substream, if any.
    pub fn pending_substream_name(&self) -> Option<&[u8]> {
        match &self.incoming {
            Incoming::PendingIncomingSubstream { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Appends data to the buffer of data to send out on this substream.
    ///
    /// An error is returned if the substream has been closed for writing or reset; in that
    /// case nothing reaches the wire.
    pub fn write(&mut self, id: SubstreamId, data: Vec<u8>) -> Result<(), WriteError> {
        let substream = self.substreams.get_mut(&id).ok_or(WriteError::Reset)?;
        if substream.was_reset {
            return Err(WriteError::Reset);
        }
        if substream.local_write_closed {
            return Err(WriteError::Closed);
        }
        if !data.is_empty() {
            substream.write_buffers.push(data);
        }
        Ok(())
    }

    /// Closes the writing side of a substream. The data already buffered is still sent out,
    /// followed by a close frame. The remote may still send data in the other direction.
    ///
    /// An error is returned if the substream is already closed for writing or reset.
    pub fn close_substream(&mut self, id: SubstreamId) -> Result<(), WriteError> {
        let substream = self.substreams.get_mut(&id).ok_or(WriteError::Reset)?;
        if substream.was_reset {
            return Err(WriteError::Reset);
        }
        if substream.local_write_closed {
            return Err(WriteError::Closed);
        }
        substream.local_write_closed = true;
        substream.close_pending = true;
        Ok(())
    }

    /// Abruptly shuts down the substream. Sends a reset frame to the remote and drops the
    /// buffered data. Any frame later received for this substream is silently discarded.
    ///
    /// Has no effect if the substream is unknown or was already reset.
    pub fn reset_substream(&mut self, id: SubstreamId) {
        let substream = match self.substreams.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        if substream.was_reset {
            return;
        }
        substream.reset();
        self.pending_control.push_back((id, PendingControl::Reset));
    }

    /// Returns the user data of a substream, if the substream exists.
    pub fn substream_user_data_mut(&mut self, id: SubstreamId) -> Option<&mut T> {
        self.substreams.get_mut(&id).map(|s| &mut s.user_data)
    }

    /// Returns the user data together with the buffer of data received on the substream and
    /// not yet consumed.
    pub fn substream_user_data_and_read_buffer(
        &mut self,
        id: SubstreamId,
    ) -> Option<(&mut T, &[u8])> {
        self.substreams
            .get_mut(&id)
            .map(|s| (&mut s.user_data, &s.read_buffer[..]))
    }

    /// Returns the buffer of data received on the substream and not yet consumed.
    pub fn substream_read_buffer(&self, id: SubstreamId) -> Option<&[u8]> {
        self.substreams.get(&id).map(|s| &s.read_buffer[..])
    }

    /// Discards the first `n` bytes of the read buffer of the substream.
    ///
    /// # Panic
    ///
    /// Panics if the substream doesn't exist or if `n` exceeds the size of its read buffer.
    ///
    pub fn advance_substream_read_buffer(&mut self, id: SubstreamId, n: usize) {
        let substream = self.substreams.get_mut(&id).unwrap();
        assert!(n <= substream.read_buffer.len());
        substream.read_buffer.drain(..n);
    }

    /// Returns `true` if the remote has closed their writing side of this substream.
    pub fn is_remote_write_closed(&self, id: SubstreamId) -> bool {
        self.substreams
            .get(&id)
            .map_or(true, |s| s.remote_write_closed)
    }

    /// Returns an iterator to the list of all substream user datas.
    pub fn user_datas_mut(&mut self) -> impl Iterator<Item = (SubstreamId, &mut T)> {
        self.substreams
            .iter_mut()
            .map(|(id, s)| (*id, &mut s.user_data))
    }

    /// Returns the number of substreams currently open.
    pub fn num_substreams(&self) -> usize {
        self.substreams.len()
    }

    /// Finds a substream that has been closed or reset, and removes it from the state machine.
    ///
    /// A substream is removed once both halves are closed and nothing remains to be written
    /// out for it.
    pub fn next_dead_substream(&mut self) -> Option<(SubstreamId, DeadSubstreamTy, T)> {
        let id = self
            .substreams
            .iter()
            .find(|(_, substream)| {
                substream.local_write_closed
                    && substream.remote_write_closed
                    && !substream.close_pending
                    && substream.queued_write_bytes() == 0
            })
            .map(|(id, _)| *id)?;

        let substream = self.substreams.remove(&id).unwrap();

        Some((
            id,
            if substream.was_reset {
                DeadSubstreamTy::Reset
            } else {
                DeadSubstreamTy::ClosedGracefully
            },
            substream.user_data,
        ))
    }

    /// Process some incoming data.
    ///
    /// This function takes ownership of `self` and yields it back on success. If a malformed
    /// frame is received, an error is yielded instead and `self` is destroyed; the connection
    /// must then be shut down altogether.
    ///
    /// This function might not process all the data available, for one of the following
    /// reasons: a substream's read buffer is full, in which case reading resumes once the
    /// buffer is drained; or the remote has opened a new substream, in which case
    /// [`Mplex::accept_pending_substream`] or [`Mplex::reject_pending_substream`] must be
    /// called. In order to avoid unnecessary copies, this method also returns as soon as an
    /// event is available, even if the input hasn't been fully processed.
    pub fn incoming_data(mut self, mut data: &[u8]) -> Result<IncomingDataOutcome<T>, Error> {
        let mut total_read = 0;

        while !data.is_empty() {
            match self.incoming {
                Incoming::PendingIncomingSubstream { .. } => break,

                Incoming::Header(ref mut buffer) => {
                    buffer.push(data[0]);
                    data = &data[1..];
                    total_read += 1;

                    match leb128::nom_leb128_u64::<nom::error::Error<&[u8]>>(buffer) {
                        Ok((_, header)) => {
                            self.incoming = Incoming::Length {
                                header,
                                buffer: arrayvec::ArrayVec::new(),
                            };
                        }
                        Err(nom::Err::Error(err))
                            if err.code == nom::error::ErrorKind::Eof && !buffer.is_full() => {}
                        Err(_) => return Err(Error::MalformedVarint),
                    }
                }

                Incoming::Length {
                    header,
                    ref mut buffer,
                } => {
                    buffer.push(data[0]);
                    data = &data[1..];
                    total_read += 1;

                    match leb128::nom_leb128_usize::<nom::error::Error<&[u8]>>(buffer) {
                        Ok((_, length)) => {
                            if length > self.max_frame_len {
                                return Err(Error::FrameTooLarge { length });
                            }

                            let detail = self.dispatch_frame(header, length)?;
                            if detail.is_some() {
                                return Ok(IncomingDataOutcome {
                                    mplex: self,
                                    bytes_read: total_read,
                                    detail,
                                });
                            }
                        }
                        Err(nom::Err::Error(err))
                            if err.code == nom::error::ErrorKind::Eof && !buffer.is_full() => {}
                        Err(_) => return Err(Error::MalformedVarint),
                    }
                }

                Incoming::NewStreamName {
                    substream_id,
                    ref mut name,
                    ref mut remaining_bytes,
                } => {
                    let to_copy = cmp::min(*remaining_bytes, data.len());
                    name.extend_from_slice(&data[..to_copy]);
                    *remaining_bytes -= to_copy;
                    data = &data[to_copy..];
                    total_read += to_copy;

                    if *remaining_bytes == 0 {
                        let name = core::mem::take(name);
                        self.incoming = Incoming::PendingIncomingSubstream { substream_id, name };
                        return Ok(IncomingDataOutcome {
                            mplex: self,
                            bytes_read: total_read,
                            detail: Some(IncomingDataDetail::IncomingSubstream),
                        });
                    }
                }

                Incoming::DataFrame {
                    substream_id,
                    ref mut remaining_bytes,
                } => {
                    let substream = match self.substreams.get_mut(&substream_id) {
                        Some(s) if !s.was_reset => s,
                        // The substream has disappeared or was reset after the frame header
                        // was received. The rest of the frame is discarded.
                        _ => {
                            let remaining_bytes = *remaining_bytes;
                            self.incoming = Incoming::SkipFrame { remaining_bytes };
                            continue;
                        }
                    };

                    let space = self
                        .max_buffered_per_substream
                        .saturating_sub(substream.read_buffer.len());
                    if space == 0 {
                        // Back-pressure: stop consuming from the connection until the API
                        // user drains the read buffer.
                        break;
                    }

                    let to_copy = cmp::min(cmp::min(*remaining_bytes, data.len()), space);
                    substream.read_buffer.extend_from_slice(&data[..to_copy]);
                    *remaining_bytes -= to_copy;
                    data = &data[to_copy..];
                    total_read += to_copy;

                    if *remaining_bytes == 0 {
                        self.incoming = Incoming::Header(arrayvec::ArrayVec::new());
                    }

                    return Ok(IncomingDataOutcome {
                        mplex: self,
                        bytes_read: total_read,
                        detail: Some(IncomingDataDetail::DataReceived { substream_id }),
                    });
                }

                Incoming::SkipFrame {
                    ref mut remaining_bytes,
                } => {
                    let to_skip = cmp::min(*remaining_bytes, data.len());
                    *remaining_bytes -= to_skip;
                    data = &data[to_skip..];
                    total_read += to_skip;

                    if *remaining_bytes == 0 {
                        self.incoming = Incoming::Header(arrayvec::ArrayVec::new());
                    }
                }
            }
        }

        Ok(IncomingDataOutcome {
            mplex: self,
            bytes_read: total_read,
            detail: None,
        })
    }

    /// Interprets a frame header and length. Returns an event to report, if any, and updates
    /// `self.incoming`.
    fn dispatch_frame(
        &mut self,
        header: u64,
        length: usize,
    ) -> Result<Option<IncomingDataDetail>, Error> {
        let flag = header & 0b111;
        let id = header >> 3;

        // Frames are dispatched on the role their flag encodes: a `*Receiver` frame was sent
        // by the side that did not open the substream, and thus concerns a locally-opened one.
        match flag {
            FLAG_NEW_STREAM => {
                let substream_id = SubstreamId(id, Opener::Remote);

                if self.substreams.contains_key(&substream_id) {
                    // Duplicate substream id. Reset the existing substream; the connection
                    // itself survives.
                    let substream = self.substreams.get_mut(&substream_id).unwrap();
                    if !substream.was_reset {
                        substream.reset();
                        self.pending_control
                            .push_back((substream_id, PendingControl::Reset));
                    }
                    self.incoming = Incoming::SkipFrame {
                        remaining_bytes: length,
                    };
                    return Ok(Some(IncomingDataDetail::StreamReset { substream_id }));
                }

                if length == 0 {
                    self.incoming = Incoming::PendingIncomingSubstream {
                        substream_id,
                        name: Vec::new(),
                    };
                    Ok(Some(IncomingDataDetail::IncomingSubstream))
                } else {
                    self.incoming = Incoming::NewStreamName {
                        substream_id,
                        name: Vec::with_capacity(length),
                        remaining_bytes: length,
                    };
                    Ok(None)
                }
            }

            FLAG_MESSAGE_RECEIVER | FLAG_MESSAGE_INITIATOR => {
                let opener = if flag == FLAG_MESSAGE_RECEIVER {
                    Opener::Local
                } else {
                    Opener::Remote
                };
                let substream_id = SubstreamId(id, opener);

                match self.substreams.get_mut(&substream_id) {
                    // Data on a substream whose remote writing side was closed is a protocol
                    // error that resets the substream, not the connection.
                    Some(substream) if !substream.was_reset && substream.remote_write_closed => {
                        substream.reset();
                        self.pending_control
                            .push_back((substream_id, PendingControl::Reset));
                        self.incoming = Incoming::SkipFrame {
                            remaining_bytes: length,
                        };
                        Ok(Some(IncomingDataDetail::StreamReset { substream_id }))
                    }
                    Some(substream) if !substream.was_reset => {
                        self.incoming = if length == 0 {
                            Incoming::Header(arrayvec::ArrayVec::new())
                        } else {
                            Incoming::DataFrame {
                                substream_id,
                                remaining_bytes: length,
                            }
                        };
                        Ok(None)
                    }
                    // Unknown or reset substream: the remote might legitimately not have seen
                    // our reset yet. Discard silently.
                    _ => {
                        self.incoming = Incoming::SkipFrame {
                            remaining_bytes: length,
                        };
                        Ok(None)
                    }
                }
            }

            FLAG_CLOSE_RECEIVER | FLAG_CLOSE_INITIATOR => {
                if length != 0 {
                    return Err(Error::DataOnControlFrame);
                }

                let opener = if flag == FLAG_CLOSE_RECEIVER {
                    Opener::Local
                } else {
                    Opener::Remote
                };
                let substream_id = SubstreamId(id, opener);

                self.incoming = Incoming::Header(arrayvec::ArrayVec::new());

                match self.substreams.get_mut(&substream_id) {
                    Some(substream) if !substream.was_reset && !substream.remote_write_closed => {
                        substream.remote_write_closed = true;
                        Ok(Some(IncomingDataDetail::RemoteClosed { substream_id }))
                    }
                    _ => Ok(None),
                }
            }

            FLAG_RESET_RECEIVER | FLAG_RESET_INITIATOR => {
                if length != 0 {
                    return Err(Error::DataOnControlFrame);
                }

                let opener = if flag == FLAG_RESET_RECEIVER {
                    Opener::Local
                } else {
                    Opener::Remote
                };
                let substream_id = SubstreamId(id, opener);

                self.incoming = Incoming::Header(arrayvec::ArrayVec::new());

                match self.substreams.get_mut(&substream_id) {
                    Some(substream) if !substream.was_reset => {
                        substream.reset();
                        Ok(Some(IncomingDataDetail::StreamReset { substream_id }))
                    }
                    _ => Ok(None),
                }
            }

            _ => Err(Error::InvalidFlag(u8::try_from(flag).unwrap())),
        }
    }

    /// Builds up to `max_bytes` of data to send out on the connection.
    ///
    /// The bytes returned are considered sent; they must be delivered to the remote, possibly
    /// over multiple writes.
    pub fn extract_out(&mut self, max_bytes: usize) -> Vec<u8> {
        let mut out = Vec::new();

        while out.len() < max_bytes {
            match &mut self.outgoing {
                Some(frame) if !frame.is_empty() => {
                    let to_take = cmp::min(max_bytes - out.len(), frame.len());
                    out.extend(frame.drain(..to_take));
                }
                _ => {
                    if !self.stage_next_frame() {
                        break;
                    }
                }
            }
        }

        out
    }

    /// Returns `true` if data is waiting (or became available) to be sent out.
    pub fn has_pending_output(&self) -> bool {
        if matches!(&self.outgoing, Some(frame) if !frame.is_empty()) {
            return true;
        }
        if !self.pending_control.is_empty() {
            return true;
        }
        self.substreams
            .values()
            .any(|s| s.queued_write_bytes() != 0 || s.close_pending)
    }

    /// Encodes the next frame into `self.outgoing`. Returns `false` if there is nothing to
    /// send.
    fn stage_next_frame(&mut self) -> bool {
        // Control frames first: `NewStream` announcements must precede the data of the
        // substream they announce, and resets take priority since they discard data anyway.
        if let Some((SubstreamId(id, opener), control)) = self.pending_control.pop_front() {
            let mut frame = VecDeque::new();
            match control {
                PendingControl::NewStream(name) => {
                    debug_assert!(matches!(opener, Opener::Local));
                    frame.extend(leb128::encode((id << 3) | FLAG_NEW_STREAM));
                    frame.extend(leb128::encode_usize(name.len()));
                    frame.extend(name);
                }
                PendingControl::Reset => {
                    let flag = match opener {
                        Opener::Local => FLAG_RESET_INITIATOR,
                        Opener::Remote => FLAG_RESET_RECEIVER,
                    };
                    frame.extend(leb128::encode((id << 3) | flag));
                    frame.extend(leb128::encode_usize(0));
                }
            }
            self.outgoing = Some(frame);
            return true;
        }

        // Data frames next.
        // TODO: O(n) and always picks the first substream; round-robin would be fairer
        if let Some((&SubstreamId(id, opener), substream)) = self
            .substreams
            .iter_mut()
            .find(|(_, s)| s.queued_write_bytes() != 0)
        {
            let to_send = cmp::min(substream.queued_write_bytes(), MAX_OUT_FRAME_DATA);

            let flag = match opener {
                Opener::Local => FLAG_MESSAGE_INITIATOR,
                Opener::Remote => FLAG_MESSAGE_RECEIVER,
            };

            let mut frame = VecDeque::with_capacity(to_send + 12);
            frame.extend(leb128::encode((id << 3) | flag));
            frame.extend(leb128::encode_usize(to_send));

            let mut remaining = to_send;
            while remaining != 0 {
                let first = &mut substream.write_buffers[0];
                let available = first.len() - substream.first_write_buffer_offset;
                let to_copy = cmp::min(available, remaining);
                frame.extend(
                    first[substream.first_write_buffer_offset..][..to_copy]
                        .iter()
                        .copied(),
                );
                substream.first_write_buffer_offset += to_copy;
                remaining -= to_copy;
                if substream.first_write_buffer_offset == first.len() {
                    substream.write_buffers.remove(0);
                    substream.first_write_buffer_offset = 0;
                }
            }

            self.outgoing = Some(frame);
            return true;
        }

        // Finally, deferred close frames of substreams whose data has been flushed.
        if let Some((&SubstreamId(id, opener), substream)) = self
            .substreams
            .iter_mut()
            .find(|(_, s)| s.close_pending && s.queued_write_bytes() == 0)
        {
            substream.close_pending = false;

            let flag = match opener {
                Opener::Local => FLAG_CLOSE_INITIATOR,
                Opener::Remote => FLAG_CLOSE_RECEIVER,
            };

            let mut frame = VecDeque::new();
            frame.extend(leb128::encode((id << 3) | flag));
            frame.extend(leb128::encode_usize(0));
            self.outgoing = Some(frame);
            return true;
        }

        false
    }
}

impl<T> fmt::Debug for Mplex<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.substreams.iter().map(|(id, s)| (id, &s.user_data)))
            .finish()
    }
}

#[must_use]
#[derive(Debug)]
pub struct IncomingDataOutcome<T> {
    /// Mplex object on which [`Mplex::incoming_data`] has been called.
    pub mplex: Mplex<T>,
    /// Number of bytes read from the incoming buffer. These bytes should no longer be present
    /// the next time [`Mplex::incoming_data`] is called.
    pub bytes_read: usize,
    /// Detail about the incoming data. `None` if nothing of interest has happened.
    pub detail: Option<IncomingDataDetail>,
}

/// Event that happened as a consequence of incoming data.
#[must_use]
#[derive(Debug)]
pub enum IncomingDataDetail {
    /// The remote has opened a new substream. Call either
    /// [`Mplex::accept_pending_substream`] or [`Mplex::reject_pending_substream`] before
    /// calling [`Mplex::incoming_data`] again.
    IncomingSubstream,
    /// Data has been appended to the read buffer of this substream.
    DataReceived { substream_id: SubstreamId },
    /// The remote has closed its writing side of the substream. Data previously received
    /// remains readable, but no more will arrive.
    RemoteClosed { substream_id: SubstreamId },
    /// The substream has been reset, either by an explicit reset frame or following a
    /// protocol error by the remote on this substream. The substream is now dead.
    StreamReset { substream_id: SubstreamId },
}

/// Error potentially returned by [`Mplex::write`] and [`Mplex::close_substream`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum WriteError {
    /// The writing side of the substream has been closed by [`Mplex::close_substream`].
    Closed,
    /// The substream has been reset, or doesn't exist anymore.
    Reset,
}

/// Error while decoding the mplex stream. The connection must be shut down.
#[derive(Debug, derive_more::Display)]
pub enum Error {
    /// One of the frame header varints is malformed.
    MalformedVarint,
    /// Frame data length exceeds the maximum allowed.
    #[display(fmt = "Frame of length {} exceeds the maximum allowed", length)]
    FrameTooLarge { length: usize },
    /// A close or reset frame carries data.
    DataOnControlFrame,
    /// Unknown value in the flag bits of a frame header.
    #[display(fmt = "Invalid flag in frame header: {}", _0)]
    InvalidFlag(u8),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeadSubstreamTy {
    ClosedGracefully,
    Reset,
}

#[cfg(test)]
mod tests {
    use super::{Config, DeadSubstreamTy, IncomingDataDetail, Mplex, WriteError};

    fn config(is_initiator: bool) -> Config {
        Config {
            is_initiator,
            capacity: 8,
            max_frame_len: 1024 * 1024,
            max_buffered_per_substream: 1024,
            randomness_seed: [0; 32],
        }
    }

    #[test]
    fn new_stream_frame_encoding() {
        let mut mplex = Mplex::new(config(true));
        let _id = mplex.open_substream(());

        // Substream 1, `NewStream` flag, empty name.
        assert_eq!(mplex.extract_out(usize::MAX), vec![0x08, 0x00]);
    }

    #[test]
    fn message_frame_encoding() {
        let mut mplex = Mplex::new(config(true));
        let id = mplex.open_substream(());
        let _ = mplex.extract_out(usize::MAX);

        mplex.write(id, b"hello".to_vec()).unwrap();
        // Substream 1, `MessageInitiator` flag, 5 bytes of data.
        assert_eq!(
            mplex.extract_out(usize::MAX),
            vec![0x0a, 0x05, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[test]
    fn message_receiver_decoding() {
        // A `MessageReceiver` frame concerns a substream that the local side has opened.
        let mut mplex = Mplex::new(config(false));
        let id = mplex.open_substream(());
        let _ = mplex.extract_out(usize::MAX);

        // Substream 2, `MessageReceiver` flag, "hello".
        let frame = [0x11, 0x05, b'h', b'e', b'l', b'l', b'o'];
        let outcome = mplex.incoming_data(&frame).unwrap();
        assert_eq!(outcome.bytes_read, frame.len());
        assert!(matches!(
            outcome.detail,
            Some(IncomingDataDetail::DataReceived { substream_id }) if substream_id == id
        ));
        assert_eq!(outcome.mplex.substream_read_buffer(id).unwrap(), b"hello");
    }

    #[test]
    fn frame_round_trip_all_flags_and_ids() {
        // Every id crosses from one machine to its peer and back out, exercising both the
        // encoding and the decoding of headers for ids of various varint lengths.
        for id_base in [0u64, 1, 127, 128, 1 << 53] {
            let mut sender = Mplex::new(config(true));
            let mut receiver = Mplex::new(config(false));

            // Skew the sender's id allocation so that the substream gets an interesting id.
            sender.next_outbound_id = id_base | 1;

            let id = sender.open_substream(());
            let mut wire = sender.extract_out(usize::MAX);
            sender.write(id, b"payload".to_vec()).unwrap();
            wire.extend(sender.extract_out(usize::MAX));

            // `NewStream` then the message.
            let outcome = receiver.incoming_data(&wire).unwrap();
            assert!(matches!(
                outcome.detail,
                Some(IncomingDataDetail::IncomingSubstream)
            ));
            receiver = outcome.mplex;
            let rx_id = receiver.accept_pending_substream(());
            let outcome = receiver
                .incoming_data(&wire[outcome.bytes_read..])
                .unwrap();
            assert!(matches!(
                outcome.detail,
                Some(IncomingDataDetail::DataReceived { .. })
            ));
            receiver = outcome.mplex;
            assert_eq!(
                receiver.substream_read_buffer(rx_id).unwrap(),
                b"payload"
            );

            // Answer on the same substream; the answer must come back with the
            // `MessageReceiver` flag and be routed to the sender's substream.
            receiver.write(rx_id, b"answer".to_vec()).unwrap();
            let back_wire = receiver.extract_out(usize::MAX);
            let outcome = sender.incoming_data(&back_wire).unwrap();
            assert!(matches!(
                outcome.detail,
                Some(IncomingDataDetail::DataReceived { substream_id }) if substream_id == id
            ));
            sender = outcome.mplex;
            assert_eq!(sender.substream_read_buffer(id).unwrap(), b"answer");
        }
    }

    #[test]
    fn close_then_write_fails_locally() {
        let mut mplex = Mplex::new(config(true));
        let id = mplex.open_substream(());

        mplex.write(id, b"first".to_vec()).unwrap();
        mplex.write(id, b"second".to_vec()).unwrap();
        mplex.close_substream(id).unwrap();
        assert_eq!(
            mplex.write(id, b"third".to_vec()),
            Err(WriteError::Closed)
        );

        let wire = mplex.extract_out(usize::MAX);
        // NewStream, one data frame with both messages coalesced, then the close frame;
        // nothing of the rejected third write.
        let expected = {
            let mut v = vec![0x08, 0x00];
            v.extend_from_slice(&[0x0a, 0x0b]);
            v.extend_from_slice(b"firstsecond");
            v.extend_from_slice(&[0x0c, 0x00]); // CloseInitiator
            v
        };
        assert_eq!(wire, expected);
    }

    #[test]
    fn duplicate_new_stream_resets_substream() {
        let mut mplex = Mplex::<()>::new(config(false));

        let outcome = mplex.incoming_data(&[0x08, 0x00]).unwrap();
        assert!(matches!(
            outcome.detail,
            Some(IncomingDataDetail::IncomingSubstream)
        ));
        mplex = outcome.mplex;
        let id = mplex.accept_pending_substream(());

        // Second `NewStream` with the same id.
        let outcome = mplex.incoming_data(&[0x08, 0x00]).unwrap();
        assert!(matches!(
            outcome.detail,
            Some(IncomingDataDetail::StreamReset { substream_id }) if substream_id == id
        ));
        mplex = outcome.mplex;

        // A reset frame for the substream must go out. We are the receiver side.
        assert_eq!(mplex.extract_out(usize::MAX), vec![0x0d, 0x00]); // ResetReceiver
    }

    #[test]
    fn message_after_remote_close_resets_substream() {
        let mut mplex = Mplex::<()>::new(config(false));

        let outcome = mplex.incoming_data(&[0x08, 0x00]).unwrap();
        mplex = outcome.mplex;
        let id = mplex.accept_pending_substream(());

        // CloseInitiator then MessageInitiator on the same substream.
        let outcome = mplex.incoming_data(&[0x0c, 0x00]).unwrap();
        assert!(matches!(
            outcome.detail,
            Some(IncomingDataDetail::RemoteClosed { .. })
        ));
        mplex = outcome.mplex;

        let outcome = mplex.incoming_data(&[0x0a, 0x03, 1, 2, 3]).unwrap();
        assert!(matches!(
            outcome.detail,
            Some(IncomingDataDetail::StreamReset { substream_id }) if substream_id == id
        ));
        mplex = outcome.mplex;

        // Frames concerning the now-reset substream are silently skipped.
        let outcome = mplex.incoming_data(&[0x0a, 0x02, 9, 9]).unwrap();
        assert!(outcome.detail.is_none());
        assert_eq!(outcome.bytes_read, 4);
    }

    #[test]
    fn reset_discards_queued_data() {
        let mut mplex = Mplex::new(config(true));
        let id = mplex.open_substream(());
        mplex.write(id, b"never sent".to_vec()).unwrap();
        mplex.reset_substream(id);

        let wire = mplex.extract_out(usize::MAX);
        // NewStream announcement, then ResetInitiator; the queued data is gone.
        assert_eq!(wire, vec![0x08, 0x00, 0x0e, 0x00]);

        assert_eq!(mplex.write(id, b"more".to_vec()), Err(WriteError::Reset));

        // The substream is harvested as dead.
        let (dead_id, ty, ()) = mplex.next_dead_substream().unwrap();
        assert_eq!(dead_id, id);
        assert_eq!(ty, DeadSubstreamTy::Reset);
        assert!(mplex.next_dead_substream().is_none());
    }

    #[test]
    fn back_pressure_stops_reading() {
        let mut mplex = Mplex::<()>::new(super::Config {
            max_buffered_per_substream: 4,
            ..config(false)
        });

        let outcome = mplex.incoming_data(&[0x08, 0x00]).unwrap();
        mplex = outcome.mplex;
        let id = mplex.accept_pending_substream(());

        // 10 bytes of data, but only 4 fit in the substream buffer.
        let frame = [0x0a, 0x0a, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let outcome = mplex.incoming_data(&frame).unwrap();
        assert_eq!(outcome.bytes_read, 2 + 4);
        mplex = outcome.mplex;

        // No further bytes are consumed while the buffer is full.
        let outcome = mplex.incoming_data(&frame[6..]).unwrap();
        assert_eq!(outcome.bytes_read, 0);
        mplex = outcome.mplex;

        // Draining the buffer resumes the reading, four bytes at a time.
        mplex.advance_substream_read_buffer(id, 4);
        let outcome = mplex.incoming_data(&frame[6..]).unwrap();
        assert_eq!(outcome.bytes_read, 4);
        mplex = outcome.mplex;

        mplex.advance_substream_read_buffer(id, 4);
        let outcome = mplex.incoming_data(&frame[10..]).unwrap();
        assert_eq!(outcome.bytes_read, 2);
        assert_eq!(outcome.mplex.substream_read_buffer(id).unwrap(), &[8, 9]);
    }

    #[test]
    fn extract_out_respects_budget() {
        let mut mplex = Mplex::new(config(true));
        let id = mplex.open_substream(());
        mplex.write(id, vec![0xaa; 100]).unwrap();

        let mut wire = Vec::new();
        loop {
            let chunk = mplex.extract_out(7);
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 7);
            wire.extend(chunk);
        }

        // NewStream (2 bytes) + header (1) + length (1) + 100 bytes of data.
        assert_eq!(wire.len(), 2 + 2 + 100);
    }

    #[test]
    fn malformed_header_is_fatal() {
        let mplex = Mplex::<()>::new(config(false));
        // Ten continuation bytes can never be a valid header varint.
        let bad = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80];
        assert!(mplex.incoming_data(&bad).is_err());
    }

    #[test]
    fn invalid_flag_is_fatal() {
        let mplex = Mplex::<()>::new(config(false));
        // Header with flag 7.
        assert!(mplex.incoming_data(&[0x0f, 0x00]).is_err());
    }
}
