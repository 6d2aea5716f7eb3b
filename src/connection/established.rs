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

//! State machine handling a single fully-established libp2p connection.
//!
//! A connection reaches the established state once the [`handshake`](super::handshake) has
//! completed. From this point on, all the data sent and received on the socket goes through
//! the negotiated encryption layer, and the [`mplex`](super::mplex) multiplexer divides the
//! connection into substreams.
//!
//! Each substream starts with a *multistream-select* negotiation of the protocol to use on
//! it. Outbound substreams are opened with [`Established::open_substream`], which takes the
//! list of candidate protocol names. Inbound substreams are reported with
//! [`Event::InboundSubstream`] and must be either accepted (after which the negotiation runs
//! against the list of supported protocols passed in the [`Config`]) or rejected.
//!
//! All the mutations of the connection state happen through [`Established::read_write`],
//! which the API user must call repeatedly, in a loop, as long as events are returned or
//! bytes are read or written.

use crate::{
    connection::{mplex, multistream_select, noise, secio},
    read_write::ReadWrite,
};

use alloc::{string::String, vec::IntoIter as VecIntoIter, vec::Vec};
use core::{fmt, iter, mem};

pub use mplex::SubstreamId;

/// Size of the temporary buffer used for the protocol negotiation of one substream. Larger
/// than any legitimate negotiation message.
const NEGOTIATION_OUT_BUFFER: usize = 512;

/// Encryption layer negotiated during the handshake. Abstracts the differences between the
/// supported secure channels.
pub enum Encryption {
    Noise(noise::Noise),
    Secio(secio::SecioConnection),
}

impl Encryption {
    /// Feeds data received from the wire. See [`noise::Noise::inject_inbound_data`].
    pub fn inject_inbound_data(&mut self, payload: &[u8]) -> Result<usize, CipherError> {
        match self {
            Encryption::Noise(inner) => {
                inner.inject_inbound_data(payload).map_err(CipherError::Noise)
            }
            Encryption::Secio(inner) => {
                inner.inject_inbound_data(payload).map_err(CipherError::Secio)
            }
        }
    }

    /// Returns the data that has been decrypted but not consumed yet.
    pub fn decoded_inbound_data(&self) -> &[u8] {
        match self {
            Encryption::Noise(inner) => inner.decoded_inbound_data(),
            Encryption::Secio(inner) => inner.decoded_inbound_data(),
        }
    }

    /// Discards the first `n` bytes of [`Encryption::decoded_inbound_data`].
    pub fn consume_inbound_data(&mut self, n: usize) {
        match self {
            Encryption::Noise(inner) => inner.consume_inbound_data(n),
            Encryption::Secio(inner) => inner.consume_inbound_data(n),
        }
    }

    /// Encrypts data and writes it to the destination buffers. Returns the number of bytes
    /// read and written.
    pub fn encrypt<'a>(
        &mut self,
        payload: impl Iterator<Item = impl AsRef<[u8]>>,
        destination: (&'a mut [u8], &'a mut [u8]),
    ) -> (usize, usize) {
        match self {
            Encryption::Noise(inner) => inner.encrypt(payload, destination),
            Encryption::Secio(inner) => inner.encrypt(payload, destination),
        }
    }

    /// Returns the maximum size of unencrypted data whose encrypted form fits in an output
    /// buffer of `out_size` bytes.
    pub fn encrypt_size_conv(&self, out_size: usize) -> usize {
        match self {
            Encryption::Noise(inner) => inner.encrypt_size_conv(out_size),
            Encryption::Secio(inner) => inner.encrypt_size_conv(out_size),
        }
    }
}

impl fmt::Debug for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encryption::Noise(_) => f.debug_tuple("Noise").finish(),
            Encryption::Secio(_) => f.debug_tuple("Secio").finish(),
        }
    }
}

/// Error in the encryption layer of an established connection.
#[derive(Debug, derive_more::Display)]
pub enum CipherError {
    #[display(fmt = "{}", _0)]
    Noise(noise::CipherError),
    #[display(fmt = "{}", _0)]
    Secio(secio::CipherError),
}

/// Prototype for an [`Established`] connection, as produced by a successful handshake.
pub struct ConnectionPrototype {
    encryption: Encryption,
    is_initiator: bool,
}

impl ConnectionPrototype {
    pub(crate) fn new(encryption: Encryption, is_initiator: bool) -> Self {
        ConnectionPrototype {
            encryption,
            is_initiator,
        }
    }

    /// Turns the prototype into an actual connection state machine.
    pub fn into_connection<TNow, TSub>(self, config: Config) -> Established<TNow, TSub> {
        let mplex = mplex::Mplex::new(mplex::Config {
            is_initiator: self.is_initiator,
            capacity: config.substreams_capacity,
            max_frame_len: config.max_frame_len,
            max_buffered_per_substream: config.max_buffered_per_substream,
            randomness_seed: config.randomness_seed,
        });

        Established {
            encryption: self.encryption,
            mplex,
            inbound_protocols: config.inbound_protocols,
        }
    }
}

impl fmt::Debug for ConnectionPrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPrototype").finish()
    }
}

/// Configuration for an [`Established`] connection.
#[derive(Debug)]
pub struct Config {
    /// List of protocol names accepted on inbound substreams.
    pub inbound_protocols: Vec<String>,
    /// Expected number of substreams simultaneously open.
    pub substreams_capacity: usize,
    /// See [`mplex::Config::max_frame_len`].
    pub max_frame_len: usize,
    /// See [`mplex::Config::max_buffered_per_substream`].
    pub max_buffered_per_substream: usize,
    /// Seed used to avoid HashDoS attacks.
    pub randomness_seed: [u8; 32],
}

/// State machine of a fully-established connection.
pub struct Established<TNow, TSub> {
    /// Encryption layer applied directly on top of the socket data.
    encryption: Encryption,

    /// Multiplexer. Each substream's user data holds its negotiation state.
    mplex: mplex::Mplex<Substream<TNow, TSub>>,

    /// Protocols accepted on inbound substreams.
    inbound_protocols: Vec<String>,
}

/// State of a single substream.
enum Substream<TNow, TSub> {
    /// Temporary transition state.
    Poisoned,

    /// The negotiation of this substream has failed or was abandoned; the API user has
    /// already been notified, and the substream only remains until its removal is complete.
    NegotiationFailed,

    /// Protocol negotiation in progress on an inbound substream.
    InboundNegotiating(
        multistream_select::InProgress<VecIntoIter<String>, String>,
        TSub,
    ),

    /// Protocol negotiation in progress on an outbound substream.
    OutboundNegotiating {
        /// Moment after which the negotiation is considered failed.
        timeout: TNow,
        negotiation: multistream_select::InProgress<VecIntoIter<String>, String>,
        user_data: TSub,
    },

    /// The substream has successfully negotiated a protocol and is open for application data.
    Open {
        /// Name of the negotiated protocol.
        protocol: String,
        user_data: TSub,
    },
}

impl<TNow, TSub> Established<TNow, TSub>
where
    TNow: Clone + Ord,
{
    /// Reads data coming from the socket, updates the internal state machine, and writes data
    /// destined to the socket.
    ///
    /// In order to avoid unnecessary memory allocations, only one [`Event`] is returned at a
    /// time. Consequently, this method should be called in a loop as long as an event is
    /// returned or bytes are read or written.
    ///
    /// If an error is returned, the connection must be shut down altogether; all substreams
    /// are implicitly reset.
    pub fn read_write(
        mut self,
        read_write: &mut ReadWrite<'_, TNow>,
    ) -> Result<(Self, Option<Event<TSub>>), Error> {
        if read_write.incoming_buffer.is_none() {
            return Err(Error::ReadClosed);
        }

        let mut event = None;

        // Fail outbound negotiations whose timeout has expired.
        if event.is_none() {
            let timed_out = self
                .mplex
                .user_datas_mut()
                .find(|(_, state)| {
                    matches!(state, Substream::OutboundNegotiating { timeout, .. }
                        if *timeout <= read_write.now)
                })
                .map(|(id, _)| id);
            if let Some(id) = timed_out {
                let state = self.mplex.substream_user_data_mut(id).unwrap();
                let user_data = match mem::replace(state, Substream::NegotiationFailed) {
                    Substream::OutboundNegotiating { user_data, .. } => user_data,
                    _ => unreachable!(),
                };
                self.mplex.reset_substream(id);
                event = Some(Event::NegotiationFailed { id, user_data });
            }
        }

        // Pump the incoming direction: socket → encryption → multiplexer.
        'pump: while event.is_none() {
            // Report substreams that are finished first, so that their id can be reused.
            while let Some((id, ty, state)) = self.mplex.next_dead_substream() {
                let user_data = match state {
                    // The user has already been notified of the failure.
                    Substream::NegotiationFailed => continue,
                    Substream::Open { user_data, .. } => user_data,
                    Substream::OutboundNegotiating { user_data, .. } => user_data,
                    Substream::InboundNegotiating(_, user_data) => user_data,
                    Substream::Poisoned => unreachable!(),
                };
                event = Some(match ty {
                    mplex::DeadSubstreamTy::Reset => Event::SubstreamReset { id, user_data },
                    mplex::DeadSubstreamTy::ClosedGracefully => {
                        Event::SubstreamClosed { id, user_data }
                    }
                });
                break 'pump;
            }

            let mut progressed = false;

            // Decrypted data waiting to be dispatched by the multiplexer.
            if !self.encryption.decoded_inbound_data().is_empty() {
                let outcome = self
                    .mplex
                    .incoming_data(self.encryption.decoded_inbound_data())
                    .map_err(Error::Mplex)?;
                self.mplex = outcome.mplex;
                if outcome.bytes_read != 0 {
                    self.encryption.consume_inbound_data(outcome.bytes_read);
                    progressed = true;
                }

                match outcome.detail {
                    None => {}
                    Some(mplex::IncomingDataDetail::IncomingSubstream) => {
                        event = Some(Event::InboundSubstream);
                        break;
                    }
                    Some(mplex::IncomingDataDetail::DataReceived { substream_id }) => {
                        match self.mplex.substream_user_data_mut(substream_id) {
                            Some(Substream::Open { .. }) => {
                                event = Some(Event::DataReceived { id: substream_id });
                                break;
                            }
                            // Data for a substream still negotiating is consumed by the
                            // negotiation below.
                            _ => progressed = true,
                        }
                    }
                    Some(mplex::IncomingDataDetail::RemoteClosed { substream_id }) => {
                        if let Some(Substream::Open { .. }) =
                            self.mplex.substream_user_data_mut(substream_id)
                        {
                            event = Some(Event::RemoteClosed { id: substream_id });
                            break;
                        }
                        progressed = true;
                    }
                    Some(mplex::IncomingDataDetail::StreamReset { .. }) => {
                        // The corresponding event is generated when the substream is removed,
                        // at the next iteration.
                        progressed = true;
                    }
                }
            }

            // Encrypted data waiting on the socket.
            if !progressed && read_write.incoming_buffer_available() != 0 {
                let num_read = self
                    .encryption
                    .inject_inbound_data(read_write.incoming_buffer.unwrap_or(&[]))
                    .map_err(Error::Cipher)?;
                read_write.advance_read(num_read);
                progressed = num_read != 0;
            }

            if !progressed {
                break;
            }
        }

        // Advance the protocol negotiations of the substreams.
        if event.is_none() {
            event = self.drive_negotiations(read_write)?;
        }

        // Outgoing direction: multiplexer → encryption → socket.
        loop {
            let max_plaintext = self
                .encryption
                .encrypt_size_conv(read_write.outgoing_buffer_available());
            if max_plaintext == 0 {
                break;
            }
            let plaintext = self.mplex.extract_out(max_plaintext);
            if plaintext.is_empty() {
                break;
            }

            if let Some((buf_a, buf_b)) = read_write.outgoing_buffer.as_mut() {
                let (_read, written) = self
                    .encryption
                    .encrypt(iter::once(&plaintext), (&mut **buf_a, &mut **buf_b));
                debug_assert_eq!(_read, plaintext.len());
                read_write.advance_write(written);
            }
        }

        // Register the negotiation timeouts as wake-up points.
        for (_, state) in self.mplex.user_datas_mut() {
            if let Substream::OutboundNegotiating { timeout, .. } = state {
                read_write.wake_up_after(timeout);
            }
        }

        Ok((self, event))
    }

    /// Runs one round of protocol negotiation on every substream that is still negotiating.
    fn drive_negotiations(
        &mut self,
        read_write: &mut ReadWrite<'_, TNow>,
    ) -> Result<Option<Event<TSub>>, Error> {
        let negotiating = self
            .mplex
            .user_datas_mut()
            .filter(|(_, state)| {
                matches!(
                    state,
                    Substream::InboundNegotiating(..) | Substream::OutboundNegotiating { .. }
                )
            })
            .map(|(id, _)| id)
            .collect::<Vec<_>>();

        for id in negotiating {
            let mut temp_out = vec![0; NEGOTIATION_OUT_BUFFER];
            let (num_read, num_written, outcome_event) = {
                let (state, read_buffer) = match self.mplex.substream_user_data_and_read_buffer(id)
                {
                    Some(v) => v,
                    None => continue,
                };

                let (negotiation, user_data, timeout) =
                    match mem::replace(state, Substream::Poisoned) {
                        Substream::InboundNegotiating(negotiation, user_data) => {
                            (negotiation, user_data, None)
                        }
                        Substream::OutboundNegotiating {
                            negotiation,
                            user_data,
                            timeout,
                        } => (negotiation, user_data, Some(timeout)),
                        _ => unreachable!(),
                    };

                let mut inner_rw = ReadWrite {
                    now: read_write.now.clone(),
                    incoming_buffer: Some(read_buffer),
                    outgoing_buffer: Some((&mut temp_out, &mut [])),
                    read_bytes: 0,
                    written_bytes: 0,
                    wake_up_after: None,
                };

                match negotiation.read_write(&mut inner_rw) {
                    Ok(multistream_select::Negotiation::InProgress(negotiation)) => {
                        *state = match timeout {
                            Some(timeout) => Substream::OutboundNegotiating {
                                timeout,
                                negotiation,
                                user_data,
                            },
                            None => Substream::InboundNegotiating(negotiation, user_data),
                        };
                        (inner_rw.read_bytes, inner_rw.written_bytes, None)
                    }
                    Ok(multistream_select::Negotiation::Success(protocol)) => {
                        let is_outbound = timeout.is_some();
                        *state = Substream::Open {
                            protocol: protocol.clone(),
                            user_data,
                        };
                        let event = if is_outbound {
                            Event::OutboundNegotiated { id, protocol }
                        } else {
                            Event::InboundNegotiated { id, protocol }
                        };
                        (inner_rw.read_bytes, inner_rw.written_bytes, Some(Ok(event)))
                    }
                    Ok(multistream_select::Negotiation::NotAvailable) => {
                        *state = Substream::NegotiationFailed;
                        (
                            inner_rw.read_bytes,
                            inner_rw.written_bytes,
                            Some(Err(user_data)),
                        )
                    }
                    Err(_) => {
                        *state = Substream::NegotiationFailed;
                        (
                            inner_rw.read_bytes,
                            inner_rw.written_bytes,
                            Some(Err(user_data)),
                        )
                    }
                }
            };

            self.mplex.advance_substream_read_buffer(id, num_read);
            if num_written != 0 {
                temp_out.truncate(num_written);
                // Writing on a substream in negotiation can only fail if it was concurrently
                // reset, in which case the bytes are correctly lost.
                let _ = self.mplex.write(id, temp_out);
            }

            match outcome_event {
                None => {}
                Some(Ok(event)) => return Ok(Some(event)),
                Some(Err(user_data)) => {
                    self.mplex.reset_substream(id);
                    return Ok(Some(Event::NegotiationFailed { id, user_data }));
                }
            }
        }

        Ok(None)
    }

    /// Opens an outbound substream and starts negotiating one of the given protocols on it,
    /// by order of preference.
    ///
    /// The negotiation fails with [`Event::NegotiationFailed`] if the remote accepts none of
    /// the protocols or if `timeout` is reached.
    pub fn open_substream(
        &mut self,
        user_data: TSub,
        protocols: Vec<String>,
        timeout: TNow,
    ) -> SubstreamId {
        let negotiation =
            multistream_select::InProgress::new(multistream_select::Config::Dialer {
                candidate_protocols: protocols.into_iter(),
            });

        self.mplex.open_substream(Substream::OutboundNegotiating {
            timeout,
            negotiation,
            user_data,
        })
    }

    /// Accepts the inbound substream reported by [`Event::InboundSubstream`]. The protocols
    /// passed in [`Config::inbound_protocols`] are then negotiated on it.
    ///
    /// # Panic
    ///
    /// Panics if no inbound substream is currently pending.
    ///
    pub fn accept_in_substream(&mut self, user_data: TSub) -> SubstreamId {
        let negotiation =
            multistream_select::InProgress::new(multistream_select::Config::Listener {
                supported_protocols: self.inbound_protocols.clone().into_iter(),
                match_mode: multistream_select::MatchMode::Strict,
            });

        self.mplex
            .accept_pending_substream(Substream::InboundNegotiating(negotiation, user_data))
    }

    /// Rejects the inbound substream reported by [`Event::InboundSubstream`]. The remote sees
    /// the substream as reset.
    ///
    /// # Panic
    ///
    /// Panics if no inbound substream is currently pending.
    ///
    pub fn reject_in_substream(&mut self) {
        self.mplex.reject_pending_substream();
    }

    /// Appends data to the send queue of an open substream.
    pub fn write(&mut self, id: SubstreamId, data: Vec<u8>) -> Result<(), WriteError> {
        match self.mplex.substream_user_data_mut(id) {
            Some(Substream::Open { .. }) => self.mplex.write(id, data).map_err(WriteError::Mplex),
            Some(_) => Err(WriteError::NotNegotiated),
            None => Err(WriteError::Mplex(mplex::WriteError::Reset)),
        }
    }

    /// Returns the data received on a substream and not consumed yet.
    ///
    /// During the negotiation of a substream, the negotiation itself consumes the buffer;
    /// once [`Event::InboundNegotiated`] or [`Event::OutboundNegotiated`] has been reported,
    /// the buffer content belongs to the application.
    pub fn read_buffer(&self, id: SubstreamId) -> &[u8] {
        self.mplex.substream_read_buffer(id).unwrap_or(&[])
    }

    /// Discards the first `n` bytes of [`Established::read_buffer`].
    pub fn advance_read_buffer(&mut self, id: SubstreamId, n: usize) {
        self.mplex.advance_substream_read_buffer(id, n);
    }

    /// Closes the writing side of a substream. See [`mplex::Mplex::close_substream`].
    pub fn close_substream(&mut self, id: SubstreamId) -> Result<(), WriteError> {
        self.mplex.close_substream(id).map_err(WriteError::Mplex)
    }

    /// Abruptly resets a substream. See [`mplex::Mplex::reset_substream`].
    pub fn reset_substream(&mut self, id: SubstreamId) {
        // The user data is reported with the `SubstreamReset` event when the substream is
        // removed; marking the negotiation as failed here would lose it.
        self.mplex.reset_substream(id);
    }

    /// Returns the user data of a substream, if it exists.
    pub fn substream_user_data_mut(&mut self, id: SubstreamId) -> Option<&mut TSub> {
        match self.mplex.substream_user_data_mut(id) {
            Some(Substream::Open { user_data, .. }) => Some(user_data),
            Some(Substream::OutboundNegotiating { user_data, .. }) => Some(user_data),
            Some(Substream::InboundNegotiating(_, user_data)) => Some(user_data),
            _ => None,
        }
    }
}

impl<TNow, TSub> fmt::Debug for Established<TNow, TSub> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("num_substreams", &self.mplex.num_substreams())
            .finish()
    }
}

/// Event that happened on an [`Established`] connection.
#[must_use]
#[derive(Debug)]
pub enum Event<TSub> {
    /// The remote has opened a new substream. Call [`Established::accept_in_substream`] or
    /// [`Established::reject_in_substream`] before the next call to
    /// [`Established::read_write`].
    InboundSubstream,
    /// An inbound substream has successfully negotiated a protocol. Data might already be
    /// available in [`Established::read_buffer`].
    InboundNegotiated {
        id: SubstreamId,
        protocol: String,
    },
    /// An outbound substream has successfully negotiated a protocol. Data might already be
    /// available in [`Established::read_buffer`].
    OutboundNegotiated {
        id: SubstreamId,
        protocol: String,
    },
    /// The protocol negotiation of a substream has failed, either because no protocol was
    /// supported by both sides, because the remote violated the negotiation protocol, or
    /// because the timeout was reached. The substream has been reset.
    NegotiationFailed { id: SubstreamId, user_data: TSub },
    /// Data has been received on an open substream and is available in
    /// [`Established::read_buffer`].
    DataReceived { id: SubstreamId },
    /// The remote has closed its writing side of an open substream. Data already received
    /// remains readable.
    RemoteClosed { id: SubstreamId },
    /// A substream has been closed in both directions and has been removed.
    SubstreamClosed { id: SubstreamId, user_data: TSub },
    /// A substream has been reset, either locally or by the remote, and has been removed.
    SubstreamReset { id: SubstreamId, user_data: TSub },
}

/// Error potentially returned by [`Established::write`] and
/// [`Established::close_substream`].
#[derive(Debug, derive_more::Display)]
pub enum WriteError {
    /// The substream hasn't finished negotiating its protocol yet.
    NotNegotiated,
    /// Error at the multiplexing layer.
    #[display(fmt = "{}", _0)]
    Mplex(mplex::WriteError),
}

/// Error on an established connection. The socket must be shut down; all the substreams are
/// implicitly reset.
#[derive(Debug, derive_more::Display)]
pub enum Error {
    /// Reading side of the connection is closed.
    ReadClosed,
    /// Error in the encryption layer. Data has most likely been corrupted.
    #[display(fmt = "{}", _0)]
    Cipher(CipherError),
    /// Error in the multiplexing layer.
    #[display(fmt = "{}", _0)]
    Mplex(mplex::Error),
}

#[cfg(test)]
mod tests {
    use super::{Config, ConnectionPrototype, Encryption, Established, Event};
    use crate::connection::noise;
    use crate::read_write::ReadWrite;

    /// Runs a noise handshake in memory and returns two connected [`Established`] objects.
    fn connected_pair() -> (Established<u64, u32>, Established<u64, u32>) {
        let key1 = noise::NoiseKey::new(&rand::random());
        let key2 = noise::NoiseKey::new(&rand::random());

        let mut handshake1 = noise::NoiseHandshake::new(noise::Config {
            key: &key1,
            is_initiator: true,
            prologue: &[],
        });
        let mut handshake2 = noise::NoiseHandshake::new(noise::Config {
            key: &key2,
            is_initiator: false,
            prologue: &[],
        });

        let mut buf_1_to_2 = Vec::new();
        let mut buf_2_to_1 = Vec::new();

        fn drive_handshake(
            handshake: noise::NoiseHandshake,
            incoming: &mut Vec<u8>,
            outgoing: &mut Vec<u8>,
        ) -> noise::NoiseHandshake {
            match handshake {
                noise::NoiseHandshake::InProgress(nego) => {
                    let mut out_buf = vec![0; 1024];
                    let mut rw = ReadWrite {
                        now: 0u64,
                        incoming_buffer: Some(incoming),
                        outgoing_buffer: Some((&mut out_buf, &mut [])),
                        read_bytes: 0,
                        written_bytes: 0,
                        wake_up_after: None,
                    };
                    let outcome = nego.read_write(&mut rw).unwrap();
                    let (read, written) = (rw.read_bytes, rw.written_bytes);
                    incoming.drain(..read);
                    outgoing.extend_from_slice(&out_buf[..written]);
                    outcome
                }
                done => done,
            }
        }

        loop {
            if matches!(
                (&handshake1, &handshake2),
                (
                    noise::NoiseHandshake::Success { .. },
                    noise::NoiseHandshake::Success { .. }
                )
            ) {
                break;
            }

            handshake1 = drive_handshake(handshake1, &mut buf_2_to_1, &mut buf_1_to_2);
            handshake2 = drive_handshake(handshake2, &mut buf_1_to_2, &mut buf_2_to_1);
        }

        let cipher1 = match handshake1 {
            noise::NoiseHandshake::Success { cipher, .. } => cipher,
            _ => unreachable!(),
        };
        let cipher2 = match handshake2 {
            noise::NoiseHandshake::Success { cipher, .. } => cipher,
            _ => unreachable!(),
        };

        let config = |seed| Config {
            inbound_protocols: vec!["/test-echo/1.0.0".to_string()],
            substreams_capacity: 4,
            max_frame_len: 1024 * 1024,
            max_buffered_per_substream: 1024 * 1024,
            randomness_seed: seed,
        };

        let conn1 = ConnectionPrototype::new(Encryption::Noise(cipher1), true)
            .into_connection::<u64, u32>(config([1; 32]));
        let conn2 = ConnectionPrototype::new(Encryption::Noise(cipher2), false)
            .into_connection::<u64, u32>(config([2; 32]));

        (conn1, conn2)
    }

    fn drive(
        conn: Established<u64, u32>,
        incoming: &mut Vec<u8>,
        outgoing: &mut Vec<u8>,
    ) -> (Established<u64, u32>, Option<Event<u32>>) {
        let mut out_buf = vec![0; 16384];
        let mut rw = ReadWrite {
            now: 0u64,
            incoming_buffer: Some(incoming),
            outgoing_buffer: Some((&mut out_buf, &mut [])),
            read_bytes: 0,
            written_bytes: 0,
            wake_up_after: None,
        };
        let (conn, event) = conn.read_write(&mut rw).unwrap();
        let (read, written) = (rw.read_bytes, rw.written_bytes);
        incoming.drain(..read);
        outgoing.extend_from_slice(&out_buf[..written]);
        (conn, event)
    }

    #[test]
    fn substream_lifecycle() {
        let (mut conn1, mut conn2) = connected_pair();

        let mut buf_1_to_2 = Vec::new();
        let mut buf_2_to_1 = Vec::new();

        let out_id = conn1.open_substream(77, vec!["/test-echo/1.0.0".to_string()], u64::MAX);

        let mut outbound_negotiated = false;
        let mut inbound_negotiated = false;
        let mut data_echoed = false;
        let mut in_id = None;

        for _ in 0..200 {
            let (new_conn1, event) = drive(conn1, &mut buf_2_to_1, &mut buf_1_to_2);
            conn1 = new_conn1;
            match event {
                Some(Event::OutboundNegotiated { id, protocol }) => {
                    assert_eq!(id, out_id);
                    assert_eq!(protocol, "/test-echo/1.0.0");
                    outbound_negotiated = true;
                    conn1.write(out_id, b"hello there".to_vec()).unwrap();
                }
                Some(Event::DataReceived { id }) => {
                    assert_eq!(id, out_id);
                    if conn1.read_buffer(id) == b"hello there" {
                        let n = conn1.read_buffer(id).len();
                        conn1.advance_read_buffer(id, n);
                        data_echoed = true;
                        conn1.close_substream(out_id).unwrap();
                    }
                }
                Some(Event::RemoteClosed { id }) => {
                    assert_eq!(id, out_id);
                }
                Some(Event::SubstreamClosed { id, user_data }) => {
                    assert_eq!(id, out_id);
                    assert_eq!(user_data, 77);
                    assert!(outbound_negotiated && inbound_negotiated && data_echoed);
                    return;
                }
                Some(other) => panic!("unexpected event on conn1: {:?}", other),
                None => {}
            }

            let (new_conn2, event) = drive(conn2, &mut buf_1_to_2, &mut buf_2_to_1);
            conn2 = new_conn2;
            match event {
                Some(Event::InboundSubstream) => {
                    in_id = Some(conn2.accept_in_substream(88));
                }
                Some(Event::InboundNegotiated { id, protocol }) => {
                    assert_eq!(Some(id), in_id);
                    assert_eq!(protocol, "/test-echo/1.0.0");
                    inbound_negotiated = true;
                }
                Some(Event::DataReceived { id }) => {
                    // Echo the data back.
                    let data = conn2.read_buffer(id).to_vec();
                    conn2.advance_read_buffer(id, data.len());
                    conn2.write(id, data).unwrap();
                }
                Some(Event::RemoteClosed { id }) => {
                    // Close our side as well so that the substream dies on both ends.
                    let _ = conn2.close_substream(id);
                }
                Some(Event::SubstreamClosed { user_data, .. }) => {
                    assert_eq!(user_data, 88);
                }
                Some(other) => panic!("unexpected event on conn2: {:?}", other),
                None => {}
            }
        }

        panic!("substream lifecycle did not complete");
    }

    #[test]
    fn unsupported_protocol_fails_negotiation() {
        let (mut conn1, mut conn2) = connected_pair();

        let mut buf_1_to_2 = Vec::new();
        let mut buf_2_to_1 = Vec::new();

        let out_id = conn1.open_substream(5, vec!["/not-supported/1.0.0".to_string()], u64::MAX);

        for _ in 0..200 {
            let (new_conn1, event) = drive(conn1, &mut buf_2_to_1, &mut buf_1_to_2);
            conn1 = new_conn1;
            if let Some(Event::NegotiationFailed { id, user_data }) = event {
                assert_eq!(id, out_id);
                assert_eq!(user_data, 5);
                return;
            }

            let (new_conn2, event) = drive(conn2, &mut buf_1_to_2, &mut buf_2_to_1);
            conn2 = new_conn2;
            if let Some(Event::InboundSubstream) = event {
                let _ = conn2.accept_in_substream(0);
            }
        }

        panic!("negotiation failure never reported");
    }

    #[test]
    fn negotiation_timeout() {
        let (mut conn1, _conn2) = connected_pair();

        // The timeout is in the past, so the first `read_write` must fail the negotiation.
        let out_id = conn1.open_substream(9, vec!["/echo/1.0.0".to_string()], 0);

        let mut buf = Vec::new();
        let mut out = Vec::new();
        let (_, event) = drive(conn1, &mut buf, &mut out);
        match event {
            Some(Event::NegotiationFailed { id, user_data }) => {
                assert_eq!(id, out_id);
                assert_eq!(user_data, 9);
            }
            other => panic!("expected negotiation failure, got {:?}", other),
        }
    }
}
