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

//! Multistream-select is a protocol whose purpose is to negotiate protocols.
//!
//! # Context
//!
//! The multistream-select protocol makes it possible for two parties to agree on a protocol
//! by name.
//!
//! When a connection opens, it is used in order to negotiate which encryption protocol to use,
//! then, after the encryption handshake, to negotiate which multiplexing protocol to use. It is
//! also used every time a substream opens in order to negotiate which protocol to use for this
//! substream in particular.
//!
//! Once a protocol has been negotiated, the connection or substream immediately starts speaking
//! this protocol.
//!
//! The multistream-select protocol is asymmetric: one side is the dialer and the other side the
//! listener. In the context of a connection, the dialer and listener correspond to the dialer
//! and listener of the connection. In the context of a substream, the dialer is the side that
//! initiated the opening of the substream.
//!
//! Both sides start by sending the handshake line. The dialer then proposes its preferred
//! protocol and waits for the line to be echoed back (acceptance) or for `na` (rejection), in
//! which case it moves on to its next candidate. The negotiation as a whole fails only once the
//! dialer has exhausted its candidate list.
//!
//! The listener can compare protocol names either strictly ([`MatchMode::Strict`]), accepting
//! exactly the names it announces, or by prefix ([`MatchMode::Prefix`]), accepting any proposed
//! name that starts with one of the announced entries.
//!
//! # About protocol names
//!
//! Due to flaws in the wire protocol design, a protocol named `ls` or `na` causes an ambiguity
//! in the exchange. Because protocol names are normally decided ahead of time, this situation is
//! expected to never arise, except in the presence of a malicious remote. The decision has been
//! taken that such a protocol will always fail to negotiate, but will also not produce any error
//! or panic. Similarly, this implementation answers a `ls` query with `na` rather than with a
//! protocol list.
//!
//! # See also
//!
//! - [Official repository](https://github.com/multiformats/multistream-select)
//!

use crate::read_write::ReadWrite;
use crate::util::leb128;

use alloc::{string::String, vec::Vec};
use core::{cmp, fmt};

/// Configuration of a multistream-select negotiation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Config<I> {
    /// Local node is the dialing side.
    Dialer {
        /// Ordered list of protocol names to propose, most preferred first. The negotiation
        /// succeeds with the first of these protocols that the remote accepts.
        candidate_protocols: I,
    },
    /// Local node is the listening side.
    Listener {
        /// List of protocol names (or name prefixes, see [`MatchMode`]) that are supported. In
        /// case of success, the negotiated protocol is one of the entries in this list.
        supported_protocols: I,
        /// How proposed names are compared against the supported list.
        match_mode: MatchMode,
    },
}

/// How a listener compares a protocol name proposed by the dialer against its supported list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MatchMode {
    /// A proposal is accepted if it is byte-for-byte equal to a supported entry.
    Strict,
    /// A proposal is accepted if it starts with a supported entry.
    Prefix,
}

/// Current state of a multistream-select negotiation.
#[derive(Debug)]
pub enum Negotiation<I, P> {
    /// Negotiation is still in progress. Use the provided [`InProgress`] object to inject and
    /// extract more data from/to the remote.
    InProgress(InProgress<I, P>),
    /// Negotiation has ended successfully. A protocol has been negotiated. For a listener in
    /// [`MatchMode::Prefix`], the value is the supported entry that matched, not the full name
    /// proposed by the dialer.
    Success(P),
    /// Negotiation has ended, but there isn't any protocol in common between the two parties.
    NotAvailable,
}

impl<I, P> Negotiation<I, P>
where
    I: Iterator<Item = P> + Clone,
    P: AsRef<str>,
{
    /// Shortcut method for [`InProgress::new`] and wrapping the [`InProgress`] in a
    /// [`Negotiation`].
    pub fn new(config: Config<I>) -> Self {
        Negotiation::InProgress(InProgress::new(config))
    }
}

/// Negotiation in progress.
pub struct InProgress<I, P> {
    /// Role-specific state. Always `Some` except right before destruction.
    role: Option<Role<I, P>>,
    /// Current state of the negotiation.
    state: InProgressState<P>,
    /// `true` once the handshake line of the remote has been received. A dialer proposes
    /// several protocols in sequence but must wait for the handshake only once.
    remote_handshake_received: bool,
    /// Maximum allowed size of an incoming frame.
    max_frame_len: usize,
    /// Incoming data is buffered in this `recv_buffer` before being decoded.
    recv_buffer: leb128::Framed,
}

enum Role<I, P> {
    Dialer {
        /// Candidate currently proposed to the remote. `None` before the first proposal is sent.
        current: Option<P>,
        /// Candidates not proposed yet.
        remaining: I,
    },
    Listener {
        supported_protocols: I,
        match_mode: MatchMode,
    },
}

enum InProgressState<P> {
    SendHandshake {
        /// Number of bytes of the handshake already written out.
        num_bytes_written: usize,
    },
    SendProtocolRequest {
        /// Number of bytes of the request already written out.
        num_bytes_written: usize,
    },
    SendProtocolOk {
        /// Number of bytes of the response already written out.
        num_bytes_written: usize,
        /// Which protocol entry has been accepted.
        protocol: P,
        /// Full name to echo back, as proposed by the dialer. Differs from `protocol` in prefix
        /// matching mode.
        echo: String,
    },
    SendProtocolNa {
        /// Number of bytes of the response already written out.
        num_bytes_written: usize,
    },
    HandshakeExpected,
    CommandExpected,
    ProtocolRequestAnswerExpected,
}

/// Handshake line sent by both parties at the beginning of each multistream-select negotiation.
const HANDSHAKE: &[u8] = b"/multistream/1.0.0\n";

impl<I, P> InProgress<I, P>
where
    I: Iterator<Item = P> + Clone,
    P: AsRef<str>,
{
    /// Initializes a new negotiation state machine.
    pub fn new(config: Config<I>) -> Self {
        // Length, in bytes, of the longest protocol name that can legitimately be received.
        let max_proto_name_len = match &config {
            Config::Dialer {
                candidate_protocols,
            } => candidate_protocols
                .clone()
                .map(|p| p.as_ref().len())
                .max()
                .unwrap_or(0),
            Config::Listener {
                supported_protocols,
                ..
            } => supported_protocols
                .clone()
                .map(|p| p.as_ref().len())
                .max()
                .unwrap_or(0),
        };

        // Any incoming frame larger than `max_frame_len` will trigger a protocol error. This
        // means that a protocol error might be reported in situations where the dialer
        // legitimately proposes a protocol that the listener doesn't support. In order to
        // prevent confusion, a minimum is applied to the frame length: any protocol name
        // smaller than this will never trigger a protocol error, even if it isn't supported.
        const MIN_PROTO_LEN_NO_ERR: usize = 48;
        let max_frame_len = cmp::max(
            cmp::max(max_proto_name_len, MIN_PROTO_LEN_NO_ERR),
            HANDSHAKE.len(),
        ) + 1;

        let role = match config {
            Config::Dialer {
                candidate_protocols,
            } => Role::Dialer {
                current: None,
                remaining: candidate_protocols,
            },
            Config::Listener {
                supported_protocols,
                match_mode,
            } => Role::Listener {
                supported_protocols,
                match_mode,
            },
        };

        InProgress {
            role: Some(role),
            // Note that the listener theoretically doesn't necessarily have to immediately send
            // a handshake, and could instead wait for a command from the dialer. In practice,
            // however, the specification doesn't mention anything about this, and some libraries
            // such as js-libp2p wait for the listener to send a handshake before emitting a
            // command.
            state: InProgressState::SendHandshake {
                num_bytes_written: 0,
            },
            remote_handshake_received: false,
            max_frame_len,
            recv_buffer: leb128::Framed::InProgress(leb128::FramedInProgress::new(max_frame_len)),
        }
    }

    /// Feeds data coming from a socket, updates the internal state machine, and writes data
    /// destined to the socket.
    ///
    /// On success, returns the new state of the negotiation.
    ///
    /// An error is returned if the reading or writing side is closed, or if the protocol is
    /// being violated by the remote. When that happens, the connection should be closed
    /// altogether.
    pub fn read_write<TNow>(
        mut self,
        read_write: &mut ReadWrite<'_, TNow>,
    ) -> Result<Negotiation<I, P>, Error> {
        loop {
            // `self.recv_buffer` serves as a helper to delimit `data` into frames. The first
            // step is to inject the received data into `recv_buffer`.
            if let leb128::Framed::InProgress(recv_buffer) = self.recv_buffer {
                let (num_read, framed_result) = recv_buffer
                    .update(read_write.incoming_buffer.unwrap_or(&[]))
                    .map_err(Error::Frame)?;
                self.recv_buffer = framed_result;
                read_write.advance_read(num_read);
            }

            match (self.state, &mut self.role) {
                (
                    InProgressState::SendHandshake {
                        mut num_bytes_written,
                    },
                    Some(role),
                ) => {
                    if read_write.outgoing_buffer.is_none() {
                        return Err(Error::WriteClosed);
                    }

                    let message = encode_message(HANDSHAKE);
                    let done = write_out_partial(read_write, &mut num_bytes_written, &message);

                    match (done, &*role) {
                        (false, _) => {
                            self.state = InProgressState::SendHandshake { num_bytes_written };
                            break;
                        }
                        (true, Role::Dialer { .. }) => {
                            self.state = InProgressState::SendProtocolRequest {
                                num_bytes_written: 0,
                            };
                        }
                        (true, Role::Listener { .. }) => {
                            self.state = InProgressState::HandshakeExpected;
                        }
                    }
                }

                (
                    InProgressState::SendProtocolRequest {
                        mut num_bytes_written,
                    },
                    Some(Role::Dialer { current, remaining }),
                ) => {
                    if read_write.outgoing_buffer.is_none() {
                        return Err(Error::WriteClosed);
                    }

                    // Pick the next candidate if none is currently being proposed. Running out
                    // of candidates ends the negotiation.
                    if current.is_none() {
                        match remaining.next() {
                            Some(c) => *current = Some(c),
                            None => return Ok(Negotiation::NotAvailable),
                        }
                    }

                    let message = {
                        let mut name = current.as_ref().unwrap().as_ref().as_bytes().to_vec();
                        name.push(b'\n');
                        encode_message(&name)
                    };

                    let done = write_out_partial(read_write, &mut num_bytes_written, &message);
                    if done {
                        // The dialer sends its proposal before waiting for the handshake of
                        // the listener. The handshake line therefore arrives before the
                        // answer, except when re-proposing after a rejection.
                        self.state = if self.remote_handshake_received {
                            InProgressState::ProtocolRequestAnswerExpected
                        } else {
                            InProgressState::HandshakeExpected
                        };
                    } else {
                        self.state = InProgressState::SendProtocolRequest { num_bytes_written };
                        break;
                    }
                }

                (
                    InProgressState::SendProtocolNa {
                        mut num_bytes_written,
                    },
                    _,
                ) => {
                    if read_write.outgoing_buffer.is_none() {
                        return Err(Error::WriteClosed);
                    }

                    let message = encode_message(b"na\n");
                    let done = write_out_partial(read_write, &mut num_bytes_written, &message);
                    if done {
                        self.state = InProgressState::CommandExpected;
                    } else {
                        self.state = InProgressState::SendProtocolNa { num_bytes_written };
                        break;
                    }
                }

                (
                    InProgressState::SendProtocolOk {
                        mut num_bytes_written,
                        protocol,
                        echo,
                    },
                    _,
                ) => {
                    if read_write.outgoing_buffer.is_none() {
                        return Err(Error::WriteClosed);
                    }

                    let message = {
                        let mut line = echo.clone().into_bytes();
                        line.push(b'\n');
                        encode_message(&line)
                    };

                    let done = write_out_partial(read_write, &mut num_bytes_written, &message);
                    if done {
                        return Ok(Negotiation::Success(protocol));
                    }
                    self.state = InProgressState::SendProtocolOk {
                        num_bytes_written,
                        protocol,
                        echo,
                    };
                    break;
                }

                (InProgressState::HandshakeExpected, Some(role)) => {
                    if read_write.incoming_buffer.is_none() {
                        return Err(Error::ReadClosed);
                    }

                    let frame = match self.recv_buffer {
                        leb128::Framed::Finished(frame) => {
                            self.recv_buffer = leb128::Framed::InProgress(
                                leb128::FramedInProgress::new(self.max_frame_len),
                            );
                            frame
                        }
                        leb128::Framed::InProgress(f) => {
                            // No frame is available yet.
                            debug_assert_eq!(read_write.incoming_buffer_available(), 0);
                            self.recv_buffer = leb128::Framed::InProgress(f);
                            self.state = InProgressState::HandshakeExpected;
                            break;
                        }
                    };

                    if frame != HANDSHAKE {
                        return Err(Error::BadHandshake);
                    }

                    self.remote_handshake_received = true;
                    self.state = match role {
                        // The dialer immediately sends its proposal after the handshake,
                        // without waiting for the handshake of the listener. As such, after
                        // receiving the handshake, the next step is to wait for the answer.
                        Role::Dialer { .. } => InProgressState::ProtocolRequestAnswerExpected,
                        // The listener sent its handshake at initialization; it has already
                        // been sent when this is reached.
                        Role::Listener { .. } => InProgressState::CommandExpected,
                    };
                }

                (
                    InProgressState::CommandExpected,
                    Some(Role::Listener {
                        supported_protocols,
                        match_mode,
                    }),
                ) => {
                    if read_write.incoming_buffer.is_none() {
                        return Err(Error::ReadClosed);
                    }

                    let frame = match self.recv_buffer {
                        leb128::Framed::Finished(frame) => {
                            self.recv_buffer = leb128::Framed::InProgress(
                                leb128::FramedInProgress::new(self.max_frame_len),
                            );
                            frame
                        }
                        leb128::Framed::InProgress(f) => {
                            // No frame is available yet.
                            debug_assert_eq!(read_write.incoming_buffer_available(), 0);
                            self.recv_buffer = leb128::Framed::InProgress(f);
                            self.state = InProgressState::CommandExpected;
                            break;
                        }
                    };

                    if frame.is_empty() || *frame.last().unwrap() != b'\n' {
                        return Err(Error::InvalidCommand);
                    }

                    let name = &frame[..frame.len() - 1];

                    // Because `ls` and `na` are checked first, a protocol bearing one of these
                    // names will never successfully negotiate. Debugging is expected to be less
                    // confusing if the negotiation always fails.
                    let accepted = if name == b"ls" || name == b"na" {
                        None
                    } else {
                        supported_protocols.clone().find(|p| match match_mode {
                            MatchMode::Strict => p.as_ref().as_bytes() == name,
                            MatchMode::Prefix => name.starts_with(p.as_ref().as_bytes()),
                        })
                    };

                    match accepted {
                        Some(protocol) => {
                            // The full proposed name is echoed back; it has been validated to
                            // be the supported entry or to start with it, which guarantees
                            // nothing about it being UTF-8, hence the fallible conversion.
                            let echo = String::from_utf8(name.to_vec())
                                .map_err(|_| Error::InvalidCommand)?;
                            self.state = InProgressState::SendProtocolOk {
                                num_bytes_written: 0,
                                protocol,
                                echo,
                            };
                        }
                        None => {
                            self.state = InProgressState::SendProtocolNa {
                                num_bytes_written: 0,
                            };
                        }
                    }
                }

                (
                    InProgressState::ProtocolRequestAnswerExpected,
                    Some(Role::Dialer { current, .. }),
                ) => {
                    if read_write.incoming_buffer.is_none() {
                        return Err(Error::ReadClosed);
                    }

                    let frame = match self.recv_buffer {
                        leb128::Framed::Finished(f) => {
                            self.recv_buffer = leb128::Framed::InProgress(
                                leb128::FramedInProgress::new(self.max_frame_len),
                            );
                            f
                        }
                        leb128::Framed::InProgress(f) => {
                            // No frame is available yet.
                            debug_assert_eq!(read_write.incoming_buffer_available(), 0);
                            self.recv_buffer = leb128::Framed::InProgress(f);
                            self.state = InProgressState::ProtocolRequestAnswerExpected;
                            break;
                        }
                    };

                    if frame.last().map_or(true, |c| *c != b'\n') {
                        return Err(Error::UnexpectedProtocolRequestAnswer);
                    }

                    if &*frame == b"na\n" {
                        // Proposal rejected. Move on to the next candidate, if any.
                        *current = None;
                        self.state = InProgressState::SendProtocolRequest {
                            num_bytes_written: 0,
                        };
                        continue;
                    }

                    let requested = current.take().unwrap();
                    if &frame[..frame.len() - 1] != requested.as_ref().as_bytes() {
                        return Err(Error::UnexpectedProtocolRequestAnswer);
                    }
                    return Ok(Negotiation::Success(requested));
                }

                // Invalid states.
                (InProgressState::SendProtocolRequest { .. }, Some(Role::Listener { .. })) => {
                    unreachable!()
                }
                (InProgressState::CommandExpected, Some(Role::Dialer { .. })) => unreachable!(),
                (InProgressState::ProtocolRequestAnswerExpected, Some(Role::Listener { .. })) => {
                    unreachable!()
                }
                (_, None) => unreachable!(),
            }
        }

        // This point should be reached only if data is lacking in order to proceed.
        Ok(Negotiation::InProgress(self))
    }
}

impl<I, P> fmt::Debug for InProgress<I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InProgress").finish()
    }
}

/// Prepends the length prefix to a message.
fn encode_message(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 2);
    out.extend(leb128::encode_usize(content.len()));
    out.extend_from_slice(content);
    out
}

/// Writes to `read_write` as many bytes of `message` as possible, starting at `*offset`.
/// Updates `*offset` and returns `true` if the end of the message has been reached.
fn write_out_partial<TNow>(
    read_write: &mut ReadWrite<'_, TNow>,
    offset: &mut usize,
    message: &[u8],
) -> bool {
    debug_assert!(*offset <= message.len());
    let to_write = cmp::min(
        message.len() - *offset,
        read_write.outgoing_buffer_available(),
    );
    read_write.write_out(&message[*offset..*offset + to_write]);
    *offset += to_write;
    *offset == message.len()
}

/// Error that can happen during the negotiation.
#[derive(Debug, Clone, derive_more::Display)]
pub enum Error {
    /// Reading side of the connection is closed. The handshake can't proceed further.
    ReadClosed,
    /// Writing side of the connection is closed. The handshake can't proceed further.
    WriteClosed,
    /// Error while decoding a frame length, or frame size limit reached.
    #[display(fmt = "Frame error: {}", _0)]
    Frame(leb128::FramedError),
    /// Unknown handshake or unknown multistream-select protocol version.
    BadHandshake,
    /// Received empty or malformed command.
    InvalidCommand,
    /// Received answer to protocol request that doesn't match the requested protocol.
    UnexpectedProtocolRequestAnswer,
}

#[cfg(test)]
mod tests {
    use super::{encode_message, Config, MatchMode, Negotiation};
    use crate::read_write::ReadWrite;
    use core::iter;

    /// Drives two negotiation state machines against each other until both have finished,
    /// with the given buffer capacity for each direction.
    fn run_to_completion<IA, IB, P>(
        mut negotiation1: Negotiation<IA, P>,
        mut negotiation2: Negotiation<IB, P>,
        size1: usize,
        size2: usize,
    ) -> (Negotiation<IA, P>, Negotiation<IB, P>)
    where
        IA: Iterator<Item = P> + Clone,
        IB: Iterator<Item = P> + Clone,
        P: AsRef<str>,
    {
        let mut buf_1_to_2 = Vec::new();
        let mut buf_2_to_1 = Vec::new();

        // The listener side legitimately never finishes when the dialer runs out of
        // candidates, hence the bounded number of rounds rather than a wait for both sides.
        for _ in 0..10_000 {
            let finished = !matches!(negotiation1, Negotiation::InProgress(_))
                && !matches!(negotiation2, Negotiation::InProgress(_));
            if finished {
                break;
            }

            negotiation1 = match negotiation1 {
                Negotiation::InProgress(nego) => {
                    // Only write out if the previous batch of data has been fully delivered.
                    let outcome = if buf_1_to_2.is_empty() {
                        buf_1_to_2.resize(size1, 0);
                        let mut read_write = ReadWrite {
                            now: 0,
                            incoming_buffer: Some(&buf_2_to_1),
                            outgoing_buffer: Some((&mut buf_1_to_2, &mut [])),
                            read_bytes: 0,
                            written_bytes: 0,
                            wake_up_after: None,
                        };
                        let outcome = nego.read_write(&mut read_write).unwrap();
                        let (read_bytes, written_bytes) =
                            (read_write.read_bytes, read_write.written_bytes);
                        for _ in 0..read_bytes {
                            buf_2_to_1.remove(0);
                        }
                        buf_1_to_2.truncate(written_bytes);
                        outcome
                    } else {
                        let mut read_write = ReadWrite {
                            now: 0,
                            incoming_buffer: Some(&buf_2_to_1),
                            outgoing_buffer: Some((&mut [], &mut [])),
                            read_bytes: 0,
                            written_bytes: 0,
                            wake_up_after: None,
                        };
                        let outcome = nego.read_write(&mut read_write).unwrap();
                        for _ in 0..read_write.read_bytes {
                            buf_2_to_1.remove(0);
                        }
                        outcome
                    };
                    outcome
                }
                other => other,
            };

            negotiation2 = match negotiation2 {
                Negotiation::InProgress(nego) => {
                    let outcome = if buf_2_to_1.is_empty() {
                        buf_2_to_1.resize(size2, 0);
                        let mut read_write = ReadWrite {
                            now: 0,
                            incoming_buffer: Some(&buf_1_to_2),
                            outgoing_buffer: Some((&mut buf_2_to_1, &mut [])),
                            read_bytes: 0,
                            written_bytes: 0,
                            wake_up_after: None,
                        };
                        let outcome = nego.read_write(&mut read_write).unwrap();
                        let (read_bytes, written_bytes) =
                            (read_write.read_bytes, read_write.written_bytes);
                        for _ in 0..read_bytes {
                            buf_1_to_2.remove(0);
                        }
                        buf_2_to_1.truncate(written_bytes);
                        outcome
                    } else {
                        let mut read_write = ReadWrite {
                            now: 0,
                            incoming_buffer: Some(&buf_1_to_2),
                            outgoing_buffer: Some((&mut [], &mut [])),
                            read_bytes: 0,
                            written_bytes: 0,
                            wake_up_after: None,
                        };
                        let outcome = nego.read_write(&mut read_write).unwrap();
                        for _ in 0..read_write.read_bytes {
                            buf_1_to_2.remove(0);
                        }
                        outcome
                    };
                    outcome
                }
                other => other,
            };
        }

        (negotiation1, negotiation2)
    }

    #[test]
    fn encode_handshake() {
        assert_eq!(
            encode_message(b"/multistream/1.0.0\n"),
            b"\x13/multistream/1.0.0\n".to_vec()
        );
        assert_eq!(encode_message(b"na\n"), b"\x03na\n".to_vec());
        assert_eq!(encode_message(b"/hello\n"), b"\x07/hello\n".to_vec());
    }

    #[test]
    fn negotiation_basic_works() {
        for (size1, size2) in [(256, 256), (1, 1), (1, 2048), (2048, 1)] {
            let negotiation1 = Negotiation::new(Config::<iter::Once<_>>::Dialer {
                candidate_protocols: iter::once("/foo"),
            });
            let negotiation2 = Negotiation::new(Config::Listener {
                supported_protocols: iter::once("/foo"),
                match_mode: MatchMode::Strict,
            });

            let (outcome1, outcome2) = run_to_completion(negotiation1, negotiation2, size1, size2);
            assert!(matches!(outcome1, Negotiation::Success("/foo")));
            assert!(matches!(outcome2, Negotiation::Success("/foo")));
        }
    }

    #[test]
    fn dialer_falls_back_through_candidates() {
        let negotiation1 = Negotiation::new(Config::Dialer {
            candidate_protocols: ["/first", "/second", "/third"].into_iter(),
        });
        let negotiation2 = Negotiation::new(Config::Listener {
            supported_protocols: ["/third", "/unrelated"].into_iter(),
            match_mode: MatchMode::Strict,
        });

        let (outcome1, outcome2) = run_to_completion(negotiation1, negotiation2, 256, 256);
        assert!(matches!(outcome1, Negotiation::Success("/third")));
        assert!(matches!(outcome2, Negotiation::Success("/third")));
    }

    #[test]
    fn no_protocol_in_common() {
        let negotiation1 = Negotiation::new(Config::Dialer {
            candidate_protocols: ["/a", "/b"].into_iter(),
        });
        let negotiation2 = Negotiation::new(Config::Listener {
            supported_protocols: ["/c"].into_iter(),
            match_mode: MatchMode::Strict,
        });

        let (outcome1, _) = run_to_completion(negotiation1, negotiation2, 256, 256);
        assert!(matches!(outcome1, Negotiation::NotAvailable));
    }

    #[test]
    fn prefix_matching() {
        let negotiation1 = Negotiation::new(Config::<iter::Once<_>>::Dialer {
            candidate_protocols: iter::once("/echo/1.2.0"),
        });
        let negotiation2 = Negotiation::new(Config::Listener {
            supported_protocols: iter::once("/echo/1."),
            match_mode: MatchMode::Prefix,
        });

        let (outcome1, outcome2) = run_to_completion(negotiation1, negotiation2, 256, 256);
        // The dialer sees its full candidate accepted; the listener reports the prefix entry
        // that matched.
        assert!(matches!(outcome1, Negotiation::Success("/echo/1.2.0")));
        assert!(matches!(outcome2, Negotiation::Success("/echo/1.")));
    }

    #[test]
    fn strict_does_not_prefix_match() {
        let negotiation1 = Negotiation::new(Config::<iter::Once<_>>::Dialer {
            candidate_protocols: iter::once("/echo/1.2.0"),
        });
        let negotiation2 = Negotiation::new(Config::Listener {
            supported_protocols: iter::once("/echo/1."),
            match_mode: MatchMode::Strict,
        });

        let (outcome1, _) = run_to_completion(negotiation1, negotiation2, 256, 256);
        assert!(matches!(outcome1, Negotiation::NotAvailable));
    }
}
