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

//! State machine handling the handshake of a libp2p connection.
//!
//! A connection handshake consists of three steps:
//!
//! - A multistream-select negotiation to agree on the encryption protocol. Both the
//! [`noise`](super::noise) and the legacy [`secio`](super::secio) protocols are supported; the
//! dialing side proposes them in the order given in the [`Config`].
//! - The chosen encryption handshake, during which public keys are exchanged and the symmetric
//! encryption is initialized.
//! - A multistream-select negotiation to agree on the multiplexing protocol, performed on top
//! of the encryption. Only [`mplex`](super::mplex) is supported.
//!
//! A handshake that hasn't finished within the configured budget fails with
//! [`HandshakeError::Timeout`].

use crate::{
    connection::{
        established::{CipherError, ConnectionPrototype, Encryption},
        mplex, multistream_select, noise, secio,
    },
    peer_id::PeerId,
    read_write::ReadWrite,
};

use alloc::{boxed::Box, vec::Vec};
use core::{fmt, iter, ops::Add, time::Duration};

/// Security protocols that can be negotiated during the first step of the handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecurityProtocol {
    Noise,
    Secio,
}

impl SecurityProtocol {
    /// Name of the protocol on the wire.
    pub fn protocol_name(&self) -> &'static str {
        match self {
            SecurityProtocol::Noise => noise::PROTOCOL_NAME,
            SecurityProtocol::Secio => secio::PROTOCOL_NAME,
        }
    }
}

/// Timeout applied to the handshake in the absence of a more specific configuration.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of a connection handshake.
#[derive(Debug, Clone)]
pub struct Config {
    /// `true` if the connection has been opened by the local machine.
    pub is_initiator: bool,

    /// Security protocols to propose (for the dialing side, in order of preference) or to
    /// accept (for the listening side).
    pub security_protocols: Vec<SecurityProtocol>,

    /// Maximum duration of the entire handshake, measured from the first call to
    /// [`HealthyHandshake::read_write`]. Use [`DEFAULT_TIMEOUT`] when in doubt.
    pub timeout: Duration,
}

/// Current state of a connection handshake.
#[derive(Debug, derive_more::From)]
pub enum Handshake<TNow> {
    /// Connection handshake in progress.
    Healthy(HealthyHandshake<TNow>),
    /// Connection handshake has reached the security handshake, and the key material of the
    /// chosen protocol is required in order to proceed.
    #[from(ignore)]
    SecurityKeyRequired(SecurityKeyRequired<TNow>),
    /// Handshake has succeeded. Connection is now open.
    #[from(ignore)]
    Success {
        /// Network identity of the remote.
        remote_peer_id: PeerId,
        /// Prototype for the connection.
        connection: ConnectionPrototype,
    },
}

impl<TNow> Handshake<TNow> {
    /// Shortcut for [`HealthyHandshake::new`] wrapped in a [`Handshake`].
    pub fn new(config: Config) -> Self {
        HealthyHandshake::new(config).into()
    }
}

/// Connection handshake in progress.
pub struct HealthyHandshake<TNow> {
    /// `true` if the local machine opened the connection.
    is_initiator: bool,
    /// Moment after which the handshake fails. `None` until the first call to
    /// [`HealthyHandshake::read_write`].
    deadline: Option<TNow>,
    /// Budget for the whole handshake.
    timeout: Duration,
    /// Step-specific state.
    state: NegotiationState,
}

enum NegotiationState {
    /// Negotiating the encryption protocol.
    EncryptionProtocol {
        negotiation:
            multistream_select::InProgress<alloc::vec::IntoIter<&'static str>, &'static str>,
    },
    /// The chosen encryption handshake is running.
    Encryption { handshake: SecurityHandshake },
    /// Negotiating the multiplexing protocol on top of the encryption.
    Multiplexing {
        peer_id: PeerId,
        encryption: Encryption,
        negotiation: multistream_select::InProgress<iter::Once<&'static str>, &'static str>,
    },
}

enum SecurityHandshake {
    Noise(Box<noise::HandshakeInProgress>),
    Secio(Box<secio::HandshakeInProgress>),
}

impl<TNow> HealthyHandshake<TNow> {
    /// Initializes a new handshake state machine.
    pub fn new(config: Config) -> Self {
        let names = config
            .security_protocols
            .iter()
            .map(|p| p.protocol_name())
            .collect::<Vec<_>>();

        let negotiation = multistream_select::InProgress::new(if config.is_initiator {
            multistream_select::Config::Dialer {
                candidate_protocols: names.into_iter(),
            }
        } else {
            multistream_select::Config::Listener {
                supported_protocols: names.into_iter(),
                match_mode: multistream_select::MatchMode::Strict,
            }
        });

        HealthyHandshake {
            is_initiator: config.is_initiator,
            deadline: None,
            timeout: config.timeout,
            state: NegotiationState::EncryptionProtocol { negotiation },
        }
    }
}

impl<TNow> HealthyHandshake<TNow>
where
    TNow: Clone + Ord + Add<Duration, Output = TNow>,
{
    /// Feeds data coming from a socket and writes back data to send out.
    ///
    /// On success, returns the new state of the negotiation.
    ///
    /// An error is returned if the protocol is being violated by the remote, if the keys
    /// don't check out, or if the handshake took too long. When that happens, the connection
    /// should be closed altogether.
    pub fn read_write(
        mut self,
        read_write: &mut ReadWrite<'_, TNow>,
    ) -> Result<Handshake<TNow>, HandshakeError> {
        // The budget starts running at the first synchronization with the socket.
        let deadline = match self.deadline.take() {
            Some(deadline) => deadline,
            None => read_write.now.clone() + self.timeout,
        };
        if deadline <= read_write.now {
            return Err(HandshakeError::Timeout);
        }
        read_write.wake_up_after(&deadline);
        self.deadline = Some(deadline);

        loop {
            match self.state {
                NegotiationState::EncryptionProtocol { negotiation } => {
                    // Delegating read/write to the negotiation.
                    let updated = negotiation
                        .read_write(read_write)
                        .map_err(HandshakeError::MultistreamSelect)?;

                    return match updated {
                        multistream_select::Negotiation::InProgress(updated) => {
                            self.state = NegotiationState::EncryptionProtocol {
                                negotiation: updated,
                            };
                            Ok(Handshake::Healthy(self))
                        }
                        multistream_select::Negotiation::Success(name) => {
                            // The key material is required in order to continue; it is
                            // requested from the user.
                            let chosen = if name == noise::PROTOCOL_NAME {
                                SecurityProtocol::Noise
                            } else {
                                debug_assert_eq!(name, secio::PROTOCOL_NAME);
                                SecurityProtocol::Secio
                            };
                            Ok(Handshake::SecurityKeyRequired(SecurityKeyRequired {
                                chosen,
                                is_initiator: self.is_initiator,
                                deadline: self.deadline,
                                timeout: self.timeout,
                            }))
                        }
                        multistream_select::Negotiation::NotAvailable => {
                            Err(HandshakeError::NoEncryptionProtocol)
                        }
                    };
                }

                NegotiationState::Encryption {
                    handshake: SecurityHandshake::Noise(handshake),
                } => {
                    let updated = handshake
                        .read_write(read_write)
                        .map_err(HandshakeError::NoiseHandshake)?;

                    match updated {
                        noise::NoiseHandshake::Success {
                            cipher,
                            remote_peer_id,
                        } => {
                            self.state = multiplexing_state(
                                self.is_initiator,
                                remote_peer_id,
                                Encryption::Noise(cipher),
                            );
                            continue;
                        }
                        noise::NoiseHandshake::InProgress(updated) => {
                            self.state = NegotiationState::Encryption {
                                handshake: SecurityHandshake::Noise(Box::new(updated)),
                            };
                            return Ok(Handshake::Healthy(self));
                        }
                    }
                }

                NegotiationState::Encryption {
                    handshake: SecurityHandshake::Secio(handshake),
                } => {
                    let updated = handshake
                        .read_write(read_write)
                        .map_err(HandshakeError::SecioHandshake)?;

                    match updated {
                        secio::SecioHandshake::Success {
                            cipher,
                            remote_peer_id,
                        } => {
                            self.state = multiplexing_state(
                                self.is_initiator,
                                remote_peer_id,
                                Encryption::Secio(cipher),
                            );
                            continue;
                        }
                        secio::SecioHandshake::InProgress(updated) => {
                            self.state = NegotiationState::Encryption {
                                handshake: SecurityHandshake::Secio(Box::new(updated)),
                            };
                            return Ok(Handshake::Healthy(self));
                        }
                    }
                }

                NegotiationState::Multiplexing {
                    peer_id,
                    mut encryption,
                    negotiation,
                } => {
                    // During the multiplexing protocol negotiation, all exchanges have to go
                    // through the cipher.

                    if read_write.incoming_buffer.is_none() {
                        return Err(HandshakeError::MultistreamSelect(
                            multistream_select::Error::ReadClosed,
                        ));
                    }
                    if read_write.outgoing_buffer.is_none() {
                        return Err(HandshakeError::MultistreamSelect(
                            multistream_select::Error::WriteClosed,
                        ));
                    }

                    let num_read = encryption
                        .inject_inbound_data(read_write.incoming_buffer.unwrap_or(&[]))
                        .map_err(HandshakeError::Cipher)?;
                    read_write.advance_read(num_read);

                    // Allocate a temporary buffer where to put the unencrypted data that
                    // should later be encrypted and written out. Its size is the maximum
                    // amount of unencrypted data that can lead to
                    // `outgoing_buffer_available()` encrypted bytes.
                    let mut out_intermediary = vec![
                        0;
                        encryption
                            .encrypt_size_conv(read_write.outgoing_buffer_available())
                    ];

                    // Continue the negotiation, writing to `out_intermediary`.
                    let (updated, decrypted_read_num, written_interm) = {
                        let mut interm_read_write = ReadWrite {
                            now: read_write.now.clone(),
                            incoming_buffer: Some(encryption.decoded_inbound_data()),
                            outgoing_buffer: Some((&mut out_intermediary, &mut [])),
                            read_bytes: 0,
                            written_bytes: 0,
                            wake_up_after: None,
                        };
                        let updated = negotiation
                            .read_write(&mut interm_read_write)
                            .map_err(HandshakeError::MultistreamSelect)?;
                        (
                            updated,
                            interm_read_write.read_bytes,
                            interm_read_write.written_bytes,
                        )
                    };

                    encryption.consume_inbound_data(decrypted_read_num);

                    // Encrypt the content of `out_intermediary` and write it out. The whole
                    // intermediary buffer always fits, by construction of its size.
                    if let Some((buf_a, buf_b)) = read_write.outgoing_buffer.as_mut() {
                        let (_unencrypted_read, encrypted_written) = encryption.encrypt(
                            iter::once(&out_intermediary[..written_interm]),
                            (&mut **buf_a, &mut **buf_b),
                        );
                        debug_assert_eq!(_unencrypted_read, written_interm);
                        read_write.advance_write(encrypted_written);
                    }

                    return match updated {
                        multistream_select::Negotiation::InProgress(updated) => {
                            self.state = NegotiationState::Multiplexing {
                                negotiation: updated,
                                encryption,
                                peer_id,
                            };
                            Ok(Handshake::Healthy(self))
                        }
                        multistream_select::Negotiation::Success(_) => Ok(Handshake::Success {
                            connection: ConnectionPrototype::new(encryption, self.is_initiator),
                            remote_peer_id: peer_id,
                        }),
                        multistream_select::Negotiation::NotAvailable => {
                            Err(HandshakeError::NoMultiplexingProtocol)
                        }
                    };
                }
            }
        }
    }

}

/// Builds the state for the multiplexing negotiation step.
fn multiplexing_state(
    is_initiator: bool,
    peer_id: PeerId,
    encryption: Encryption,
) -> NegotiationState {
    let negotiation = multistream_select::InProgress::new(if is_initiator {
        multistream_select::Config::Dialer {
            candidate_protocols: iter::once(mplex::PROTOCOL_NAME),
        }
    } else {
        multistream_select::Config::Listener {
            supported_protocols: iter::once(mplex::PROTOCOL_NAME),
            match_mode: multistream_select::MatchMode::Strict,
        }
    });

    NegotiationState::Multiplexing {
        peer_id,
        encryption,
        negotiation,
    }
}

impl<TNow> fmt::Debug for HealthyHandshake<TNow> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthyHandshake").finish()
    }
}

/// Connection handshake has reached the security handshake, and the key material is necessary
/// in order to proceed.
pub struct SecurityKeyRequired<TNow> {
    chosen: SecurityProtocol,
    is_initiator: bool,
    deadline: Option<TNow>,
    timeout: Duration,
}

impl<TNow> SecurityKeyRequired<TNow> {
    /// Returns which security protocol has been negotiated, and therefore which of the
    /// `resume_*` methods must be called.
    pub fn chosen_protocol(&self) -> SecurityProtocol {
        self.chosen
    }

    /// Turns this pause back into a [`HealthyHandshake`] by providing the noise key.
    ///
    /// # Panic
    ///
    /// Panics if the negotiated protocol isn't [`SecurityProtocol::Noise`].
    ///
    pub fn resume_noise(self, key: &noise::NoiseKey) -> HealthyHandshake<TNow> {
        assert!(matches!(self.chosen, SecurityProtocol::Noise));

        HealthyHandshake {
            is_initiator: self.is_initiator,
            deadline: self.deadline,
            timeout: self.timeout,
            state: NegotiationState::Encryption {
                handshake: SecurityHandshake::Noise(Box::new(noise::HandshakeInProgress::new(
                    noise::Config {
                        key,
                        is_initiator: self.is_initiator,
                        prologue: &[],
                    },
                ))),
            },
        }
    }

    /// Turns this pause back into a [`HealthyHandshake`] by providing the SECIO
    /// configuration.
    ///
    /// # Panic
    ///
    /// Panics if the negotiated protocol isn't [`SecurityProtocol::Secio`].
    ///
    pub fn resume_secio(self, config: secio::Config) -> HealthyHandshake<TNow> {
        assert!(matches!(self.chosen, SecurityProtocol::Secio));

        HealthyHandshake {
            is_initiator: self.is_initiator,
            deadline: self.deadline,
            timeout: self.timeout,
            state: NegotiationState::Encryption {
                handshake: SecurityHandshake::Secio(Box::new(secio::HandshakeInProgress::new(
                    config,
                ))),
            },
        }
    }
}

impl<TNow> fmt::Debug for SecurityKeyRequired<TNow> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityKeyRequired")
            .field("chosen", &self.chosen)
            .finish()
    }
}

/// Error during a connection handshake. The connection should be shut down.
#[derive(Debug, derive_more::Display)]
pub enum HandshakeError {
    /// The handshake didn't finish within the allotted time.
    Timeout,
    /// Protocol error during a multistream-select negotiation.
    #[display(fmt = "Multistream-select error: {}", _0)]
    MultistreamSelect(multistream_select::Error),
    /// Protocol error during the noise handshake.
    #[display(fmt = "Noise handshake error: {}", _0)]
    NoiseHandshake(noise::HandshakeError),
    /// Protocol error during the SECIO handshake.
    #[display(fmt = "SECIO handshake error: {}", _0)]
    SecioHandshake(secio::HandshakeError),
    /// No encryption protocol in common with the remote.
    ///
    /// The remote is behaving correctly but isn't compatible with the local node.
    NoEncryptionProtocol,
    /// No multiplexing protocol in common with the remote.
    ///
    /// The remote is behaving correctly but isn't compatible with the local node.
    NoMultiplexingProtocol,
    /// Error in the cipher of the negotiated encryption. Data has most likely been corrupted.
    #[display(fmt = "Cipher error: {}", _0)]
    Cipher(CipherError),
}

#[cfg(test)]
mod tests {
    use super::{Config, Handshake, SecurityProtocol, DEFAULT_TIMEOUT};
    use crate::connection::{noise, secio};
    use crate::read_write::ReadWrite;
    use core::time::Duration;

    fn drive(
        handshake: Handshake<Duration>,
        now: Duration,
        incoming: &mut Vec<u8>,
        outgoing: &mut Vec<u8>,
        noise_key: &noise::NoiseKey,
        secio_identity: &[u8; 32],
    ) -> Handshake<Duration> {
        let healthy = match handshake {
            Handshake::Healthy(h) => h,
            Handshake::SecurityKeyRequired(pause) => match pause.chosen_protocol() {
                SecurityProtocol::Noise => pause.resume_noise(noise_key),
                SecurityProtocol::Secio => pause.resume_secio(secio::Config {
                    identity_private_key: secio_identity,
                    randomness_seed: rand::random(),
                }),
            },
            done @ Handshake::Success { .. } => return done,
        };

        let mut out_buf = vec![0; 4096];
        let mut rw = ReadWrite {
            now,
            incoming_buffer: Some(incoming),
            outgoing_buffer: Some((&mut out_buf, &mut [])),
            read_bytes: 0,
            written_bytes: 0,
            wake_up_after: None,
        };
        let outcome = healthy.read_write(&mut rw).unwrap();
        let (read, written) = (rw.read_bytes, rw.written_bytes);
        incoming.drain(..read);
        outgoing.extend_from_slice(&out_buf[..written]);
        outcome
    }

    fn run_handshake(dialer_protocols: Vec<SecurityProtocol>) {
        let noise_key1 = noise::NoiseKey::new(&rand::random());
        let noise_key2 = noise::NoiseKey::new(&rand::random());
        let secio_identity1: [u8; 32] = rand::random();
        let secio_identity2: [u8; 32] = rand::random();

        let mut handshake1 = Handshake::new(Config {
            is_initiator: true,
            security_protocols: dialer_protocols,
            timeout: DEFAULT_TIMEOUT,
        });
        let mut handshake2 = Handshake::new(Config {
            is_initiator: false,
            security_protocols: vec![SecurityProtocol::Noise, SecurityProtocol::Secio],
            timeout: DEFAULT_TIMEOUT,
        });

        let mut buf_1_to_2 = Vec::new();
        let mut buf_2_to_1 = Vec::new();

        for _ in 0..256 {
            if matches!(
                (&handshake1, &handshake2),
                (Handshake::Success { .. }, Handshake::Success { .. })
            ) {
                break;
            }

            handshake1 = drive(
                handshake1,
                Duration::from_secs(1),
                &mut buf_2_to_1,
                &mut buf_1_to_2,
                &noise_key1,
                &secio_identity1,
            );
            handshake2 = drive(
                handshake2,
                Duration::from_secs(1),
                &mut buf_1_to_2,
                &mut buf_2_to_1,
                &noise_key2,
                &secio_identity2,
            );
        }

        match (handshake1, handshake2) {
            (
                Handshake::Success {
                    remote_peer_id: peer1_sees,
                    ..
                },
                Handshake::Success {
                    remote_peer_id: peer2_sees,
                    ..
                },
            ) => {
                assert_ne!(peer1_sees, peer2_sees);
            }
            _ => panic!("handshake did not finish"),
        }
    }

    #[test]
    fn handshake_over_noise() {
        run_handshake(vec![SecurityProtocol::Noise, SecurityProtocol::Secio]);
    }

    #[test]
    fn handshake_over_secio() {
        run_handshake(vec![SecurityProtocol::Secio]);
    }

    #[test]
    fn handshake_times_out() {
        let mut handshake = Handshake::new(Config {
            is_initiator: true,
            security_protocols: vec![SecurityProtocol::Noise],
            timeout: Duration::from_secs(30),
        });

        // First round arms the deadline.
        let mut buf = Vec::new();
        let mut out = Vec::new();
        handshake = drive(
            handshake,
            Duration::from_secs(0),
            &mut buf,
            &mut out,
            &noise::NoiseKey::new(&rand::random()),
            &rand::random(),
        );

        // A later round past the deadline must fail.
        let healthy = match handshake {
            Handshake::Healthy(h) => h,
            _ => panic!(),
        };
        let mut out_buf = vec![0; 1024];
        let mut rw = ReadWrite {
            now: Duration::from_secs(31),
            incoming_buffer: Some(&[]),
            outgoing_buffer: Some((&mut out_buf, &mut [])),
            read_bytes: 0,
            written_bytes: 0,
            wake_up_after: None,
        };
        assert!(matches!(
            healthy.read_write(&mut rw),
            Err(super::HandshakeError::Timeout)
        ));
    }
}
