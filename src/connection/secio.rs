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

//! SECIO protocol libp2p layer.
//!
//! SECIO is the legacy secure-channel protocol of libp2p, superseded by noise but still spoken
//! by older nodes. It provides an encrypted and authenticated layer on top of which data is
//! exchanged.
//!
//! # Protocol details
//!
//! Contrary to noise, SECIO has no initiator or responder: the exchange is fully symmetric.
//! Every message, both during and after the handshake, is prefixed by its length as a 32-bit
//! big-endian integer.
//!
//! - Both sides start by sending a `Propose` protobuf containing a 16-byte random nonce, their
//! identity public key, and their comma-separated preference lists for the key agreement curve,
//! the symmetric cipher, and the hash function.
//! - Upon receiving the remote's `Propose`, each side hashes the two `(public key, nonce)`
//! combinations in order to determine, without further communication, whose preference lists
//! win. A node connecting to itself is detected at this step. The first entry of the winning
//! lists that both sides support is selected, in each category.
//! - Both sides then generate an ephemeral key on the selected curve and send an `Exchange`
//! protobuf containing the ephemeral public key and a signature, made with their identity key,
//! covering the two `Propose` messages and the ephemeral key. Verifying this signature proves
//! that the remote owns the private key of the identity it announced.
//! - A Diffie-Hellman exchange combines the ephemeral keys into a shared secret, which is
//! stretched into two `(iv, cipher key, MAC key)` triples, one per direction. The winning side
//! of the ordering uses the first triple for its outgoing direction. Each frame from this point
//! on is the ciphertext followed by an HMAC of the ciphertext.
//! - Finally, each side sends, over the now-encrypted channel, the nonce the *remote* announced
//! in its `Propose`, and verifies that the nonce it receives back is its own. This closes the
//! loop and proves that the encryption keys are consistent in both directions.
//!
//! # Usage
//!
//! The SECIO protocol must typically first be negotiated using the *multistream-select*
//! protocol. The name to negotiate is given by the [`PROTOCOL_NAME`] constant.
//!
//! Create a [`SecioHandshake`] with a [`Config`], then call
//! [`HandshakeInProgress::read_write`] every time data is received from the wire or the remote
//! is ready to accept more data. If the handshake is finished, a [`SecioHandshake::Success`] is
//! returned, containing the [`PeerId`] of the remote, which is known to be legitimate, and a
//! [`SecioConnection`] object through which all further communications should go.

use crate::{
    peer_id::{PeerId, PublicKey},
    read_write::ReadWrite,
    util::protobuf,
};

use alloc::{collections::VecDeque, vec::Vec};
use core::{cmp, fmt, mem};
use hmac::Mac as _;
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use rand::Rng as _;
use rand_chacha::{rand_core::SeedableRng as _, ChaCha20Rng};
use sha2::Digest as _;
use zeroize::Zeroize as _;

/// Name of the protocol, typically used when negotiating it with *multistream-select*.
pub const PROTOCOL_NAME: &str = "/secio/1.0.0";

/// Size, in bytes, of the random nonce exchanged in the proposals.
const NONCE_SIZE: usize = 16;

/// Size, in bytes, of the MAC keys produced by the key stretcher. Fixed by the protocol no
/// matter the hash function in use.
const MAC_KEY_SIZE: usize = 20;

/// Seed of the key stretcher. Fixed by the protocol.
const KEY_STRETCH_SEED: &[u8] = b"key expansion";

/// Maximum allowed size of a handshake frame.
const MAX_HANDSHAKE_FRAME_LEN: usize = 64 * 1024;

/// Maximum allowed size of a post-handshake frame, as found in the reference implementations.
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Maximum size of the plaintext put in a single outgoing frame. Chunking bounds the latency
/// cost of a partially-transmitted frame.
const MAX_OUT_FRAME_PLAINTEXT: usize = 8192;

/// Local preference list for the key agreement curve, most preferred first. The iteration order
/// is part of the protocol: the winning side's list is scanned in order.
const KEY_AGREEMENTS: [(KeyAgreement, &str); 3] = [
    (KeyAgreement::P256, "P-256"),
    (KeyAgreement::P384, "P-384"),
    (KeyAgreement::P521, "P-521"),
];

/// Local preference list for the symmetric cipher, most preferred first.
const CIPHERS: [(CipherAlgorithm, &str); 2] = [
    (CipherAlgorithm::Aes128, "AES-128"),
    (CipherAlgorithm::Aes256, "AES-256"),
];

/// Local preference list for the hash function, most preferred first.
const HASHES: [(HashAlgorithm, &str); 2] = [
    (HashAlgorithm::Sha256, "SHA256"),
    (HashAlgorithm::Sha512, "SHA512"),
];

/// Key agreement curve negotiated during the handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyAgreement {
    P256,
    P384,
    P521,
}

/// Symmetric cipher negotiated during the handshake. Always used in CTR mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128,
    Aes256,
}

impl CipherAlgorithm {
    fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128 => 16,
            CipherAlgorithm::Aes256 => 32,
        }
    }

    fn iv_size(&self) -> usize {
        16
    }
}

/// Hash function negotiated during the handshake. Used for the HMAC of every frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

/// Set of algorithms that the two sides have agreed upon.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Algorithms {
    pub key_agreement: KeyAgreement,
    pub cipher: CipherAlgorithm,
    pub hash: HashAlgorithm,
}

/// Configuration for a SECIO handshake.
pub struct Config<'a> {
    /// Ed25519 private key of the local node's identity. The remote will see the connection as
    /// coming from the corresponding [`PeerId`].
    pub identity_private_key: &'a [u8; 32],

    /// Seed used for the nonce and the ephemeral key. Must be randomly generated anew for every
    /// handshake; reusing a seed compromises the secrecy of the session.
    pub randomness_seed: [u8; 32],
}

/// State of a SECIO handshake.
#[derive(Debug)]
pub enum SecioHandshake {
    /// Handshake still in progress. More data needs to be sent or received.
    InProgress(HandshakeInProgress),
    /// SECIO handshake has successfully completed.
    Success {
        /// Object to use to encrypt and decrypt all further communications.
        cipher: SecioConnection,
        /// [`PeerId`] of the remote.
        remote_peer_id: PeerId,
    },
}

impl SecioHandshake {
    /// Shortcut function that calls [`HandshakeInProgress::new`] and wraps it into a
    /// [`SecioHandshake`].
    pub fn new(config: Config) -> Self {
        SecioHandshake::InProgress(HandshakeInProgress::new(config))
    }
}

/// Handshake still in progress. More data needs to be sent or received.
pub struct HandshakeInProgress {
    /// Key used to sign the `Exchange` message.
    identity_key: ed25519_zebra::SigningKey,

    /// Exact bytes of the local `Propose` message. Kept around because the `Exchange` signature
    /// covers them.
    local_propose: Vec<u8>,

    /// Nonce announced in the local `Propose`. The remote must echo it over the encrypted
    /// channel at the end of the handshake.
    local_nonce: [u8; NONCE_SIZE],

    /// Randomness used for the ephemeral key.
    randomness: ChaCha20Rng,

    /// Phase-specific state. `Poisoned` is a temporary value while transitioning.
    state: State,

    /// Buffer of data received on the wire and not yet dispatched. During the plaintext phases,
    /// contains a partial frame, including the four bytes of length prefix.
    rx_buffer: Vec<u8>,

    /// Data waiting to be sent on the wire, already framed.
    tx_buffer: VecDeque<u8>,
}

enum State {
    /// Local `Propose` is queued; waiting for the remote's.
    WaitingPropose,

    /// Algorithms are agreed upon and the local `Exchange` is queued; waiting for the remote's.
    WaitingExchange {
        /// Exact bytes of the remote `Propose`, covered by the remote's signature.
        remote_propose: Vec<u8>,
        /// Nonce announced by the remote; sent back over the encrypted channel once the keys
        /// are derived.
        remote_nonce: Vec<u8>,
        /// Identity announced by the remote. The `Exchange` signature proves its ownership.
        remote_public_key: PublicKey,
        /// Selected algorithms.
        algorithms: Algorithms,
        /// `true` if the local side won the preference ordering. Decides which half of the
        /// stretched keys is ours.
        local_is_higher: bool,
        /// Ephemeral secret for the Diffie-Hellman exchange.
        ephemeral_secret: EphemeralSecret,
        /// SEC1 uncompressed encoding of the local ephemeral public key, covered by the local
        /// signature.
        local_ephemeral_public: Vec<u8>,
    },

    /// Keys are derived and the encrypted echo of the remote's nonce is queued; waiting for the
    /// remote to echo ours.
    WaitingNonce {
        /// Fully-initialized transport. Incoming data is already decrypted through it.
        connection: SecioConnection,
        /// Identity of the remote, pending the final nonce check.
        remote_public_key: PublicKey,
        /// `true` once the remote's echo has been received and checked. The handshake then
        /// only waits for the local echo to be flushed out.
        nonce_verified: bool,
    },

    /// Temporary state while transitioning.
    Poisoned,
}

impl HandshakeInProgress {
    /// Initializes a new SECIO handshake state machine.
    pub fn new(config: Config) -> Self {
        let identity_key = ed25519_zebra::SigningKey::from(*config.identity_private_key);
        let mut randomness = ChaCha20Rng::from_seed(config.randomness_seed);

        let local_nonce: [u8; NONCE_SIZE] = randomness.gen();

        let local_propose = {
            let pubkey_protobuf =
                PublicKey::Ed25519(ed25519_zebra::VerificationKey::from(&identity_key).into())
                    .to_protobuf_encoding();
            encode_propose(
                &local_nonce,
                &pubkey_protobuf,
                &join_names(&KEY_AGREEMENTS),
                &join_names(&CIPHERS),
                &join_names(&HASHES),
            )
        };

        let mut handshake = HandshakeInProgress {
            identity_key,
            local_propose: local_propose.clone(),
            local_nonce,
            randomness,
            state: State::WaitingPropose,
            rx_buffer: Vec::with_capacity(512),
            tx_buffer: VecDeque::new(),
        };

        handshake.queue_frame(&local_propose);
        handshake
    }

    /// Appends a length-prefixed frame to `tx_buffer`.
    fn queue_frame(&mut self, payload: &[u8]) {
        self.tx_buffer
            .extend(u32::try_from(payload.len()).unwrap().to_be_bytes());
        self.tx_buffer.extend(payload.iter().copied());
    }

    /// Extracts one complete plaintext frame from `read_write`, if available.
    ///
    /// Maintains `self.rx_buffer` across calls. The length prefix is not part of the returned
    /// frame.
    fn next_frame<TNow>(
        &mut self,
        read_write: &mut ReadWrite<'_, TNow>,
    ) -> Result<Option<Vec<u8>>, HandshakeError> {
        // Accumulate the four bytes of length prefix.
        while self.rx_buffer.len() < 4 {
            if read_write.incoming_buffer_available() == 0 {
                return Ok(None);
            }
            self.rx_buffer.push(read_write.read_bytes::<1>()[0]);
        }

        let expected_len = usize::try_from(u32::from_be_bytes(
            <[u8; 4]>::try_from(&self.rx_buffer[..4]).unwrap(),
        ))
        .unwrap();
        if expected_len > MAX_HANDSHAKE_FRAME_LEN {
            return Err(HandshakeError::FrameTooLarge);
        }

        let to_copy = cmp::min(
            expected_len + 4 - self.rx_buffer.len(),
            read_write.incoming_buffer_available(),
        );
        self.rx_buffer
            .extend(read_write.incoming_bytes_iter().take(to_copy));

        if self.rx_buffer.len() < expected_len + 4 {
            return Ok(None);
        }

        let mut frame = mem::replace(&mut self.rx_buffer, Vec::with_capacity(512));
        frame.drain(..4);
        Ok(Some(frame))
    }

    /// Feeds data coming from a socket and outputs data to write to the socket.
    ///
    /// On success, returns the new state of the negotiation.
    ///
    /// An error is returned if the protocol is being violated by the remote or if the keys
    /// don't check out. When that happens, the connection must be closed altogether, and
    /// retrying on the same transport is futile.
    pub fn read_write<TNow>(
        mut self,
        read_write: &mut ReadWrite<'_, TNow>,
    ) -> Result<SecioHandshake, HandshakeError> {
        loop {
            // Flush `tx_buffer`.
            if !self.tx_buffer.is_empty() {
                if read_write.outgoing_buffer.is_none() {
                    return Err(HandshakeError::WriteClosed);
                }
                read_write.write_from_vec_deque(&mut self.tx_buffer);
            }

            match mem::replace(&mut self.state, State::Poisoned) {
                State::WaitingPropose => {
                    if read_write.incoming_buffer.is_none() {
                        return Err(HandshakeError::ReadClosed);
                    }

                    let frame = match self.next_frame(read_write)? {
                        Some(frame) => frame,
                        None => {
                            self.state = State::WaitingPropose;
                            break;
                        }
                    };

                    self.state = self.on_remote_propose(frame)?;
                }

                State::WaitingExchange {
                    remote_propose,
                    remote_nonce,
                    remote_public_key,
                    algorithms,
                    local_is_higher,
                    ephemeral_secret,
                    local_ephemeral_public,
                } => {
                    if read_write.incoming_buffer.is_none() {
                        return Err(HandshakeError::ReadClosed);
                    }

                    let frame = match self.next_frame(read_write)? {
                        Some(frame) => frame,
                        None => {
                            self.state = State::WaitingExchange {
                                remote_propose,
                                remote_nonce,
                                remote_public_key,
                                algorithms,
                                local_is_higher,
                                ephemeral_secret,
                                local_ephemeral_public,
                            };
                            break;
                        }
                    };

                    self.state = self.on_remote_exchange(
                        frame,
                        remote_propose,
                        remote_nonce,
                        remote_public_key,
                        algorithms,
                        local_is_higher,
                        ephemeral_secret,
                        local_ephemeral_public,
                    )?;
                }

                State::WaitingNonce {
                    mut connection,
                    remote_public_key,
                    mut nonce_verified,
                } => {
                    if !nonce_verified {
                        if read_write.incoming_buffer.is_none() {
                            return Err(HandshakeError::ReadClosed);
                        }

                        // From this point on, incoming data goes through the cipher.
                        let available = read_write.incoming_buffer.unwrap_or(&[]);
                        let num_read = connection
                            .inject_inbound_data(available)
                            .map_err(HandshakeError::Cipher)?;
                        read_write.advance_read(num_read);

                        if connection.decoded_inbound_data().len() >= NONCE_SIZE {
                            if connection.decoded_inbound_data()[..NONCE_SIZE]
                                != self.local_nonce
                            {
                                return Err(HandshakeError::InvalidInitialPacket);
                            }
                            connection.consume_inbound_data(NONCE_SIZE);
                            nonce_verified = true;
                        }
                    }

                    // Hold off reporting success until the remote's echo has been checked and
                    // our own echo is fully written out.
                    if !nonce_verified || !self.tx_buffer.is_empty() {
                        self.state = State::WaitingNonce {
                            connection,
                            remote_public_key,
                            nonce_verified,
                        };
                        break;
                    }

                    return Ok(SecioHandshake::Success {
                        cipher: connection,
                        remote_peer_id: remote_public_key.into_peer_id(),
                    });
                }

                State::Poisoned => unreachable!(),
            }
        }

        Ok(SecioHandshake::InProgress(self))
    }

    /// Processes the remote's `Propose` message and moves to the `Exchange` phase.
    fn on_remote_propose(&mut self, frame: Vec<u8>) -> Result<State, HandshakeError> {
        let remote = decode_propose(&frame).ok_or(HandshakeError::PayloadDecode)?;

        let remote_public_key = PublicKey::from_protobuf_encoding(remote.pubkey)
            .map_err(|_| HandshakeError::InvalidRemotePubKey)?;

        // Hash the two (public key, nonce) combinations to decide whose preference lists win.
        // The comparison is the same on both sides, so no further communication is needed.
        let local_is_higher = {
            let oh1: [u8; 32] = {
                let mut hasher = sha2::Sha256::new();
                hasher.update(remote.pubkey);
                hasher.update(self.local_nonce);
                hasher.finalize().into()
            };
            let oh2: [u8; 32] = {
                let mut hasher = sha2::Sha256::new();
                let local_pubkey_protobuf = PublicKey::Ed25519(
                    ed25519_zebra::VerificationKey::from(&self.identity_key).into(),
                )
                .to_protobuf_encoding();
                hasher.update(&local_pubkey_protobuf);
                hasher.update(remote.rand);
                hasher.finalize().into()
            };

            match oh1.cmp(&oh2) {
                cmp::Ordering::Greater => true,
                cmp::Ordering::Less => false,
                cmp::Ordering::Equal => return Err(HandshakeError::SelfConnecting),
            }
        };

        let algorithms = Algorithms {
            key_agreement: select_algorithm(local_is_higher, &KEY_AGREEMENTS, remote.exchanges)
                .ok_or(HandshakeError::NoCommonAlgos)?,
            cipher: select_algorithm(local_is_higher, &CIPHERS, remote.ciphers)
                .ok_or(HandshakeError::NoCommonAlgos)?,
            hash: select_algorithm(local_is_higher, &HASHES, remote.hashes)
                .ok_or(HandshakeError::NoCommonAlgos)?,
        };

        // Generate the ephemeral key and sign `local_propose ‖ remote_propose ‖ eph_pub` with
        // the identity key.
        let (ephemeral_secret, local_ephemeral_public) =
            EphemeralSecret::generate(algorithms.key_agreement, &mut self.randomness);

        let signature: [u8; 64] = {
            let mut corpus = Vec::with_capacity(
                self.local_propose.len() + frame.len() + local_ephemeral_public.len(),
            );
            corpus.extend_from_slice(&self.local_propose);
            corpus.extend_from_slice(&frame);
            corpus.extend_from_slice(&local_ephemeral_public);
            self.identity_key.sign(&corpus).into()
        };

        let exchange = encode_exchange(&local_ephemeral_public, &signature);
        self.queue_frame(&exchange);

        let remote_nonce = remote.rand.to_vec();
        Ok(State::WaitingExchange {
            remote_propose: frame,
            remote_nonce,
            remote_public_key,
            algorithms,
            local_is_higher,
            ephemeral_secret,
            local_ephemeral_public,
        })
    }

    /// Processes the remote's `Exchange` message, derives the keys, and moves to the nonce-echo
    /// phase.
    #[allow(clippy::too_many_arguments)]
    fn on_remote_exchange(
        &mut self,
        frame: Vec<u8>,
        remote_propose: Vec<u8>,
        remote_nonce: Vec<u8>,
        remote_public_key: PublicKey,
        algorithms: Algorithms,
        local_is_higher: bool,
        ephemeral_secret: EphemeralSecret,
        _local_ephemeral_public: Vec<u8>,
    ) -> Result<State, HandshakeError> {
        let remote = decode_exchange(&frame).ok_or(HandshakeError::PayloadDecode)?;

        // The remote's signature covers `remote_propose ‖ local_propose ‖ remote_eph_pub`.
        {
            let mut corpus = Vec::with_capacity(
                remote_propose.len() + self.local_propose.len() + remote.epubkey.len(),
            );
            corpus.extend_from_slice(&remote_propose);
            corpus.extend_from_slice(&self.local_propose);
            corpus.extend_from_slice(remote.epubkey);
            remote_public_key
                .verify(&corpus, remote.signature)
                .map_err(|_| HandshakeError::InvalidSignature)?;
        }

        let mut shared_secret = ephemeral_secret
            .diffie_hellman(remote.epubkey)
            .ok_or(HandshakeError::InvalidEphemeralKey)?;

        let (first_half, second_half) = stretch_keys(
            algorithms.hash,
            &shared_secret,
            algorithms.cipher.iv_size(),
            algorithms.cipher.key_size(),
        );
        shared_secret.zeroize();

        let (local_keys, remote_keys) = if local_is_higher {
            (first_half, second_half)
        } else {
            (second_half, first_half)
        };

        let mut connection = SecioConnection {
            local: DirectionState::new(algorithms, &local_keys),
            remote: DirectionState::new(algorithms, &remote_keys),
            algorithms,
            rx_buffer_encrypted: Vec::new(),
            rx_buffer_decrypted: Vec::new(),
        };

        // Send the *remote's* nonce over the now-encrypted channel.
        let echo = connection.encrypt_frame(&remote_nonce);
        self.tx_buffer.extend(echo);

        Ok(State::WaitingNonce {
            connection,
            remote_public_key,
            nonce_verified: false,
        })
    }
}

impl fmt::Debug for HandshakeInProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeInProgress").finish()
    }
}

/// Joins the names of a preference list with commas, producing the wire form.
fn join_names<T>(list: &[(T, &str)]) -> alloc::string::String {
    let mut out = alloc::string::String::new();
    for (n, (_, name)) in list.iter().enumerate() {
        if n != 0 {
            out.push(',');
        }
        out.push_str(name);
    }
    out
}

/// Selects the first algorithm of the winning preference list that both sides support.
///
/// `local` is the local ordered preference list, `remote` the remote's comma-separated one.
fn select_algorithm<T: Copy>(
    local_is_higher: bool,
    local: &[(T, &str)],
    remote: &str,
) -> Option<T> {
    if local_is_higher {
        local
            .iter()
            .find(|(_, name)| remote.split(',').any(|r| r == *name))
            .map(|(algo, _)| *algo)
    } else {
        remote.split(',').find_map(|r| {
            local
                .iter()
                .find(|(_, name)| *name == r)
                .map(|(algo, _)| *algo)
        })
    }
}

/// Fields of a decoded `Propose` message.
struct ProposeRef<'a> {
    rand: &'a [u8],
    pubkey: &'a [u8],
    exchanges: &'a str,
    ciphers: &'a str,
    hashes: &'a str,
}

fn encode_propose(
    rand: &[u8],
    pubkey: &[u8],
    exchanges: &str,
    ciphers: &str,
    hashes: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + pubkey.len());
    for slice in protobuf::bytes_tag_encode(1, rand) {
        out.extend_from_slice(slice.as_ref());
    }
    for slice in protobuf::bytes_tag_encode(2, pubkey) {
        out.extend_from_slice(slice.as_ref());
    }
    for slice in protobuf::string_tag_encode(3, exchanges) {
        out.extend_from_slice(slice.as_ref());
    }
    for slice in protobuf::string_tag_encode(4, ciphers) {
        out.extend_from_slice(slice.as_ref());
    }
    for slice in protobuf::string_tag_encode(5, hashes) {
        out.extend_from_slice(slice.as_ref());
    }
    out
}

fn decode_propose(payload: &[u8]) -> Option<ProposeRef<'_>> {
    let mut rand = None;
    let mut pubkey = None;
    let mut exchanges = None;
    let mut ciphers = None;
    let mut hashes = None;

    let mut input = payload;
    while !input.is_empty() {
        let (rest, (field, wire_ty)) =
            protobuf::tag_decode::<nom::error::Error<&[u8]>>(input).ok()?;
        input = match (field, wire_ty) {
            (1, 2) => {
                let (rest, v) = protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                rand = Some(v);
                rest
            }
            (2, 2) => {
                let (rest, v) = protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                pubkey = Some(v);
                rest
            }
            (3, 2) => {
                let (rest, v) = protobuf::string_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                exchanges = Some(v);
                rest
            }
            (4, 2) => {
                let (rest, v) = protobuf::string_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                ciphers = Some(v);
                rest
            }
            (5, 2) => {
                let (rest, v) = protobuf::string_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                hashes = Some(v);
                rest
            }
            (_, wire_ty) => {
                let (rest, ()) =
                    protobuf::value_skip_decode::<nom::error::Error<&[u8]>>(wire_ty)(rest).ok()?;
                rest
            }
        };
    }

    Some(ProposeRef {
        rand: rand?,
        pubkey: pubkey?,
        exchanges: exchanges.unwrap_or(""),
        ciphers: ciphers.unwrap_or(""),
        hashes: hashes.unwrap_or(""),
    })
}

/// Fields of a decoded `Exchange` message.
struct ExchangeRef<'a> {
    epubkey: &'a [u8],
    signature: &'a [u8],
}

fn encode_exchange(epubkey: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + epubkey.len() + signature.len());
    for slice in protobuf::bytes_tag_encode(1, epubkey) {
        out.extend_from_slice(slice.as_ref());
    }
    for slice in protobuf::bytes_tag_encode(2, signature) {
        out.extend_from_slice(slice.as_ref());
    }
    out
}

fn decode_exchange(payload: &[u8]) -> Option<ExchangeRef<'_>> {
    let mut epubkey = None;
    let mut signature = None;

    let mut input = payload;
    while !input.is_empty() {
        let (rest, (field, wire_ty)) =
            protobuf::tag_decode::<nom::error::Error<&[u8]>>(input).ok()?;
        input = match (field, wire_ty) {
            (1, 2) => {
                let (rest, v) = protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                epubkey = Some(v);
                rest
            }
            (2, 2) => {
                let (rest, v) = protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                signature = Some(v);
                rest
            }
            (_, wire_ty) => {
                let (rest, ()) =
                    protobuf::value_skip_decode::<nom::error::Error<&[u8]>>(wire_ty)(rest).ok()?;
                rest
            }
        };
    }

    Some(ExchangeRef {
        epubkey: epubkey?,
        signature: signature?,
    })
}

/// Ephemeral secret for the Diffie-Hellman exchange, on one of the negotiable curves.
enum EphemeralSecret {
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
    P521(p521::ecdh::EphemeralSecret),
}

impl EphemeralSecret {
    /// Generates a key pair on the given curve. Returns the secret and the SEC1 uncompressed
    /// encoding of the public key.
    fn generate(curve: KeyAgreement, randomness: &mut ChaCha20Rng) -> (Self, Vec<u8>) {
        match curve {
            KeyAgreement::P256 => {
                let secret = p256::ecdh::EphemeralSecret::random(randomness);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EphemeralSecret::P256(secret), public)
            }
            KeyAgreement::P384 => {
                let secret = p384::ecdh::EphemeralSecret::random(randomness);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EphemeralSecret::P384(secret), public)
            }
            KeyAgreement::P521 => {
                let secret = p521::ecdh::EphemeralSecret::random(randomness);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EphemeralSecret::P521(secret), public)
            }
        }
    }

    /// Performs the Diffie-Hellman exchange against the remote's public point. Returns the
    /// affine X coordinate of the resulting point, or `None` if the remote's point is invalid
    /// for the negotiated curve.
    fn diffie_hellman(&self, remote_point: &[u8]) -> Option<Vec<u8>> {
        match self {
            EphemeralSecret::P256(secret) => {
                let remote = p256::PublicKey::from_sec1_bytes(remote_point).ok()?;
                Some(secret.diffie_hellman(&remote).raw_secret_bytes().to_vec())
            }
            EphemeralSecret::P384(secret) => {
                let remote = p384::PublicKey::from_sec1_bytes(remote_point).ok()?;
                Some(secret.diffie_hellman(&remote).raw_secret_bytes().to_vec())
            }
            EphemeralSecret::P521(secret) => {
                let remote = p521::PublicKey::from_sec1_bytes(remote_point).ok()?;
                Some(secret.diffie_hellman(&remote).raw_secret_bytes().to_vec())
            }
        }
    }
}

/// One `(iv, cipher key, MAC key)` triple produced by the key stretcher.
struct StretchedKey {
    iv: Vec<u8>,
    cipher_key: Vec<u8>,
    mac_key: Vec<u8>,
}

impl Drop for StretchedKey {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.cipher_key.zeroize();
        self.mac_key.zeroize();
    }
}

/// Computes `HMAC(key, concat(data))` with the given hash function.
fn hmac_digest(hash: HashAlgorithm, key: &[u8], data: &[&[u8]]) -> Vec<u8> {
    match hash {
        HashAlgorithm::Sha256 => {
            let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(key).unwrap();
            for d in data {
                mac.update(d);
            }
            mac.finalize().into_bytes().to_vec()
        }
        HashAlgorithm::Sha512 => {
            let mut mac = hmac::Hmac::<sha2::Sha512>::new_from_slice(key).unwrap();
            for d in data {
                mac.update(d);
            }
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Stretches the Diffie-Hellman shared secret into the two per-direction key triples.
///
/// The HMAC-based expansion is fixed by the protocol: starting from
/// `a = HMAC(secret, "key expansion")`, each round appends `HMAC(secret, a ‖ seed)` to the
/// output and replaces `a` with `HMAC(secret, a)`, until `2 × (iv + key + 20)` bytes have been
/// produced. The first half belongs to the side that won the preference ordering.
fn stretch_keys(
    hash: HashAlgorithm,
    secret: &[u8],
    iv_size: usize,
    cipher_key_size: usize,
) -> (StretchedKey, StretchedKey) {
    let half_len = iv_size + cipher_key_size + MAC_KEY_SIZE;
    let output_len = 2 * half_len;

    let mut output = Vec::with_capacity(output_len);
    let mut a = hmac_digest(hash, secret, &[KEY_STRETCH_SEED]);
    while output.len() < output_len {
        let b = hmac_digest(hash, secret, &[&a, KEY_STRETCH_SEED]);
        let take = cmp::min(b.len(), output_len - output.len());
        output.extend_from_slice(&b[..take]);
        a = hmac_digest(hash, secret, &[&a]);
    }
    a.zeroize();

    let split = |half: &[u8]| StretchedKey {
        iv: half[..iv_size].to_vec(),
        cipher_key: half[iv_size..iv_size + cipher_key_size].to_vec(),
        mac_key: half[iv_size + cipher_key_size..].to_vec(),
    };

    let first = split(&output[..half_len]);
    let second = split(&output[half_len..]);
    output.zeroize();
    (first, second)
}

/// Stateful symmetric cipher of one direction. The CTR key stream continues from one frame to
/// the next.
enum StreamCipherState {
    Aes128(ctr::Ctr128BE<aes::Aes128>),
    Aes256(ctr::Ctr128BE<aes::Aes256>),
}

impl StreamCipherState {
    fn new(cipher: CipherAlgorithm, key: &[u8], iv: &[u8]) -> Self {
        use aes::cipher::KeyIvInit as _;
        match cipher {
            CipherAlgorithm::Aes128 => {
                StreamCipherState::Aes128(ctr::Ctr128BE::new_from_slices(key, iv).unwrap())
            }
            CipherAlgorithm::Aes256 => {
                StreamCipherState::Aes256(ctr::Ctr128BE::new_from_slices(key, iv).unwrap())
            }
        }
    }

    fn apply_keystream(&mut self, data: &mut [u8]) {
        use aes::cipher::StreamCipher as _;
        match self {
            StreamCipherState::Aes128(cipher) => cipher.apply_keystream(data),
            StreamCipherState::Aes256(cipher) => cipher.apply_keystream(data),
        }
    }
}

/// HMAC of one direction. A fresh instance is derived from the template for every frame.
enum MacState {
    Sha256(hmac::Hmac<sha2::Sha256>),
    Sha512(hmac::Hmac<sha2::Sha512>),
}

impl MacState {
    fn new(hash: HashAlgorithm, key: &[u8]) -> Self {
        match hash {
            HashAlgorithm::Sha256 => {
                MacState::Sha256(hmac::Hmac::new_from_slice(key).unwrap())
            }
            HashAlgorithm::Sha512 => {
                MacState::Sha512(hmac::Hmac::new_from_slice(key).unwrap())
            }
        }
    }

    fn output_len(&self) -> usize {
        match self {
            MacState::Sha256(_) => 32,
            MacState::Sha512(_) => 64,
        }
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        match self {
            MacState::Sha256(template) => {
                let mut mac = template.clone();
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            MacState::Sha512(template) => {
                let mut mac = template.clone();
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        match self {
            MacState::Sha256(template) => {
                let mut mac = template.clone();
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }
            MacState::Sha512(template) => {
                let mut mac = template.clone();
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }
        }
    }
}

/// Symmetric state of one direction of the channel.
struct DirectionState {
    cipher: StreamCipherState,
    mac: MacState,
}

impl DirectionState {
    fn new(algorithms: Algorithms, keys: &StretchedKey) -> Self {
        DirectionState {
            cipher: StreamCipherState::new(algorithms.cipher, &keys.cipher_key, &keys.iv),
            mac: MacState::new(algorithms.hash, &keys.mac_key),
        }
    }
}

/// State of the SECIO encryption/decryption once the handshake has succeeded.
pub struct SecioConnection {
    /// Symmetric state used to encrypt outgoing data.
    local: DirectionState,
    /// Symmetric state used to decrypt incoming data.
    remote: DirectionState,
    /// Algorithms agreed upon during the handshake.
    algorithms: Algorithms,
    /// Buffer of data received on the wire, before decryption. Always either empty or contains
    /// a partial frame, including the four bytes of length prefix.
    rx_buffer_encrypted: Vec<u8>,
    /// Buffer of data received on the wire, after decryption and MAC verification.
    rx_buffer_decrypted: Vec<u8>,
}

impl SecioConnection {
    /// Returns the algorithms agreed upon during the handshake.
    pub fn algorithms(&self) -> Algorithms {
        self.algorithms
    }

    /// Builds one outgoing frame: length prefix, ciphertext, MAC of the ciphertext.
    fn encrypt_frame(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mac_len = self.local.mac.output_len();

        let mut frame = Vec::with_capacity(4 + plaintext.len() + mac_len);
        frame.extend_from_slice(
            &u32::try_from(plaintext.len() + mac_len).unwrap().to_be_bytes(),
        );
        frame.extend_from_slice(plaintext);
        self.local.cipher.apply_keystream(&mut frame[4..]);
        let tag = self.local.mac.compute(&frame[4..]);
        frame.extend_from_slice(&tag);
        frame
    }

    /// Feeds data received from the wire.
    ///
    /// Returns the number of bytes that have been read from `payload`. This can be less than
    /// `payload.len()` only if the internal buffer of decrypted data is full, in which case
    /// [`SecioConnection::consume_inbound_data`] must be called before more data is injected.
    pub fn inject_inbound_data(&mut self, mut payload: &[u8]) -> Result<usize, CipherError> {
        let mac_len = self.remote.mac.output_len();
        let mut total_read = 0;

        loop {
            // Buffering up too much data in the output buffer should be avoided. As such, past
            // a certain threshold, return early and refuse to read more.
            if self.rx_buffer_decrypted.len() >= 65536 * 4 {
                return Ok(total_read);
            }

            // Try to construct the length prefix in `rx_buffer_encrypted` by moving bytes from
            // `payload`.
            while self.rx_buffer_encrypted.len() < 4 {
                if payload.is_empty() {
                    return Ok(total_read);
                }

                self.rx_buffer_encrypted.push(payload[0]);
                payload = &payload[1..];
                total_read += 1;
            }

            let expected_len = usize::try_from(u32::from_be_bytes(
                <[u8; 4]>::try_from(&self.rx_buffer_encrypted[..4]).unwrap(),
            ))
            .unwrap();

            if expected_len > MAX_FRAME_LEN {
                return Err(CipherError::FrameTooLarge);
            }
            if expected_len < mac_len {
                return Err(CipherError::FrameTooShort);
            }

            // If there isn't enough data available for the full frame, copy the partial frame
            // to `rx_buffer_encrypted` and return early.
            if self.rx_buffer_encrypted.len() + payload.len() < expected_len + 4 {
                self.rx_buffer_encrypted.extend_from_slice(payload);
                total_read += payload.len();
                return Ok(total_read);
            }

            // Copy the rest of the frame to `rx_buffer_encrypted`.
            let remains = expected_len + 4 - self.rx_buffer_encrypted.len();
            self.rx_buffer_encrypted
                .extend_from_slice(&payload[..remains]);
            payload = &payload[remains..];
            total_read += remains;

            // The frame is the ciphertext followed by the MAC of the ciphertext.
            let ciphertext_len = expected_len - mac_len;
            {
                let ciphertext = &self.rx_buffer_encrypted[4..4 + ciphertext_len];
                let tag = &self.rx_buffer_encrypted[4 + ciphertext_len..];
                if !self.remote.mac.verify(ciphertext, tag) {
                    return Err(CipherError::MacMismatch);
                }
            }

            // Decrypt in place in the output buffer.
            let len_before = self.rx_buffer_decrypted.len();
            self.rx_buffer_decrypted
                .extend_from_slice(&self.rx_buffer_encrypted[4..4 + ciphertext_len]);
            self.remote
                .cipher
                .apply_keystream(&mut self.rx_buffer_decrypted[len_before..]);

            self.rx_buffer_encrypted.clear();
        }
    }

    /// Returns the data that has been decrypted but not consumed yet.
    pub fn decoded_inbound_data(&self) -> &[u8] {
        &self.rx_buffer_decrypted
    }

    /// Discards the first `n` bytes of [`SecioConnection::decoded_inbound_data`].
    pub fn consume_inbound_data(&mut self, n: usize) {
        // TODO: be smarter than copying
        self.rx_buffer_decrypted = self.rx_buffer_decrypted[n..].to_vec();
    }

    /// Reads data from `payload` and writes it in encrypted form to `destination`. Returns, in
    /// order, the number of bytes read from `payload` and the number of bytes written to
    /// `destination`.
    ///
    /// The number of bytes read and written is only a function of the size of the input and of
    /// the available output. Use [`SecioConnection::encrypt_size_conv`] to determine the
    /// maximum payload size that fits a certain output buffer.
    pub fn encrypt<'a>(
        &mut self,
        payload: impl Iterator<Item = impl AsRef<[u8]>>,
        mut destination: (&'a mut [u8], &'a mut [u8]),
    ) -> (usize, usize) {
        let overhead = 4 + self.local.mac.output_len();

        let data = payload.fold(Vec::new(), |mut a, b| {
            a.extend_from_slice(b.as_ref());
            a
        });

        let mut total_read = 0;
        let mut total_written = 0;

        while destination.0.len() + destination.1.len() > overhead && total_read < data.len() {
            let in_len = cmp::min(
                cmp::min(MAX_OUT_FRAME_PLAINTEXT, data.len() - total_read),
                destination.0.len() + destination.1.len() - overhead,
            );

            let frame = self.encrypt_frame(&data[total_read..total_read + in_len]);
            debug_assert_eq!(frame.len(), in_len + overhead);

            let to_first = cmp::min(destination.0.len(), frame.len());
            destination.0[..to_first].copy_from_slice(&frame[..to_first]);
            destination.1[..frame.len() - to_first].copy_from_slice(&frame[to_first..]);

            let (dest_a, dest_b) = destination;
            destination = if to_first == frame.len() {
                (&mut dest_a[frame.len()..], dest_b)
            } else {
                (&mut dest_b[frame.len() - to_first..], &mut [])
            };

            total_read += in_len;
            total_written += frame.len();
        }

        (total_read, total_written)
    }

    /// Returns the maximum size of unencrypted data whose encrypted form fits in an output
    /// buffer of `out_size` bytes.
    pub fn encrypt_size_conv(&self, out_size: usize) -> usize {
        let overhead = 4 + self.local.mac.output_len();

        let mut total = 0;
        let mut dest_len = out_size;
        while dest_len > overhead {
            let in_len = cmp::min(MAX_OUT_FRAME_PLAINTEXT, dest_len - overhead);
            total += in_len;
            dest_len -= in_len + overhead;
        }
        total
    }
}

impl fmt::Debug for SecioConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecioConnection")
            .field("algorithms", &self.algorithms)
            .finish()
    }
}

/// Potential error during the SECIO handshake.
#[derive(Debug, derive_more::Display)]
pub enum HandshakeError {
    /// Reading side of the connection is closed. The handshake can't proceed further.
    ReadClosed,
    /// Writing side of the connection is closed. The handshake can't proceed further.
    WriteClosed,
    /// A handshake frame exceeds the allowed size.
    FrameTooLarge,
    /// Failed to decode a handshake message. Also happens if the remote sends a message that
    /// doesn't belong to the current phase of the negotiation.
    PayloadDecode,
    /// Key announced in the remote's proposal failed to decode into a libp2p public key.
    InvalidRemotePubKey,
    /// The two sides of the handshake announced the same public key and nonce. The node is
    /// connecting to itself.
    SelfConnecting,
    /// One of the algorithm categories has no entry supported by both sides.
    NoCommonAlgos,
    /// Signature of the exchange message doesn't match the remote's announced identity.
    InvalidSignature,
    /// The remote's ephemeral public key isn't a valid point on the negotiated curve.
    InvalidEphemeralKey,
    /// The nonce received over the encrypted channel doesn't match the one announced in the
    /// local proposal.
    InvalidInitialPacket,
    /// Error in the decryption state machine.
    #[display(fmt = "Cipher error: {}", _0)]
    Cipher(CipherError),
}

/// Error while decrypting a SECIO frame.
#[derive(Debug, derive_more::Display)]
pub enum CipherError {
    /// A frame exceeds the allowed size.
    FrameTooLarge,
    /// A frame is too short to contain its MAC.
    FrameTooShort,
    /// The MAC of a frame doesn't match its content. Data has been corrupted or tampered with.
    MacMismatch,
}

#[cfg(test)]
mod tests {
    use super::{select_algorithm, Config, HandshakeError, KeyAgreement, SecioHandshake};
    use crate::read_write::ReadWrite;

    fn drive(
        handshake: SecioHandshake,
        incoming: &mut Vec<u8>,
        outgoing: &mut Vec<u8>,
    ) -> Result<SecioHandshake, HandshakeError> {
        match handshake {
            SecioHandshake::InProgress(nego) => {
                let mut out_buf = vec![0; 4096];
                let mut read_write = ReadWrite {
                    now: 0,
                    incoming_buffer: Some(incoming),
                    outgoing_buffer: Some((&mut out_buf, &mut [])),
                    read_bytes: 0,
                    written_bytes: 0,
                    wake_up_after: None,
                };
                let outcome = nego.read_write(&mut read_write)?;
                let (read_bytes, written_bytes) =
                    (read_write.read_bytes, read_write.written_bytes);
                incoming.drain(..read_bytes);
                outgoing.extend_from_slice(&out_buf[..written_bytes]);
                Ok(outcome)
            }
            done => Ok(done),
        }
    }

    #[test]
    fn handshake_basic_works() {
        let mut handshake1 = SecioHandshake::new(Config {
            identity_private_key: &rand::random(),
            randomness_seed: rand::random(),
        });
        let mut handshake2 = SecioHandshake::new(Config {
            identity_private_key: &rand::random(),
            randomness_seed: rand::random(),
        });

        let mut buf_1_to_2 = Vec::new();
        let mut buf_2_to_1 = Vec::new();

        for _ in 0..64 {
            if matches!(
                (&handshake1, &handshake2),
                (
                    SecioHandshake::Success { .. },
                    SecioHandshake::Success { .. }
                )
            ) {
                break;
            }

            handshake1 = drive(handshake1, &mut buf_2_to_1, &mut buf_1_to_2).unwrap();
            handshake2 = drive(handshake2, &mut buf_1_to_2, &mut buf_2_to_1).unwrap();
        }

        let (mut cipher1, peer_id1, mut cipher2, peer_id2) =
            match (handshake1, handshake2) {
                (
                    SecioHandshake::Success {
                        cipher: c1,
                        remote_peer_id: p1,
                    },
                    SecioHandshake::Success {
                        cipher: c2,
                        remote_peer_id: p2,
                    },
                ) => (c1, p1, c2, p2),
                _ => panic!("handshake did not finish"),
            };

        // Mirror-image algorithm selection.
        assert_eq!(cipher1.algorithms(), cipher2.algorithms());
        assert_ne!(peer_id1, peer_id2);

        // Data encrypted by one side decrypts on the other, in both directions.
        let mut wire = vec![0; 1024];
        let (read, written) =
            cipher1.encrypt(core::iter::once(b"ping over secio"), (&mut wire, &mut []));
        assert_eq!(read, 15);
        let consumed = cipher2.inject_inbound_data(&wire[..written]).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(cipher2.decoded_inbound_data(), b"ping over secio");
        cipher2.consume_inbound_data(15);

        let mut wire = vec![0; 1024];
        let (read, written) =
            cipher2.encrypt(core::iter::once(b"pong over secio"), (&mut wire, &mut []));
        assert_eq!(read, 15);
        let consumed = cipher1.inject_inbound_data(&wire[..written]).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(cipher1.decoded_inbound_data(), b"pong over secio");
    }

    #[test]
    fn self_connecting_detected() {
        // Same identity and same randomness seed produce the same proposal on both sides.
        let identity: [u8; 32] = rand::random();
        let seed: [u8; 32] = rand::random();

        let mut handshake1 = SecioHandshake::new(Config {
            identity_private_key: &identity,
            randomness_seed: seed,
        });
        let handshake2 = SecioHandshake::new(Config {
            identity_private_key: &identity,
            randomness_seed: seed,
        });

        let mut buf_1_to_2 = Vec::new();
        let mut buf_2_to_1 = Vec::new();

        // Capture the proposal of side 2 and feed it to side 1.
        let _ = drive(handshake2, &mut buf_1_to_2, &mut buf_2_to_1).unwrap();

        let mut detected = None;
        for _ in 0..8 {
            match drive(handshake1, &mut buf_2_to_1, &mut buf_1_to_2) {
                Ok(h) => handshake1 = h,
                Err(err) => {
                    detected = Some(err);
                    break;
                }
            }
        }
        assert!(matches!(detected, Some(HandshakeError::SelfConnecting)));
    }

    #[test]
    fn tampered_signature_detected() {
        let mut handshake1 = SecioHandshake::new(Config {
            identity_private_key: &rand::random(),
            randomness_seed: rand::random(),
        });
        let mut handshake2 = SecioHandshake::new(Config {
            identity_private_key: &rand::random(),
            randomness_seed: rand::random(),
        });

        let mut buf_1_to_2 = Vec::new();
        let mut buf_2_to_1 = Vec::new();

        // Let side 1 emit its proposal.
        handshake1 = drive(handshake1, &mut buf_2_to_1, &mut buf_1_to_2).unwrap();
        // Side 2 receives it and emits its proposal followed by its exchange.
        handshake2 = drive(handshake2, &mut buf_1_to_2, &mut buf_2_to_1).unwrap();
        handshake2 = drive(handshake2, &mut buf_1_to_2, &mut buf_2_to_1).unwrap();
        let _ = handshake2;

        // `buf_2_to_1` now contains two length-prefixed frames: the proposal and the exchange.
        let first_frame_len =
            u32::from_be_bytes(<[u8; 4]>::try_from(&buf_2_to_1[..4]).unwrap()) as usize;
        assert!(buf_2_to_1.len() > first_frame_len + 8, "exchange not emitted");

        // Flip a bit in the last byte of the exchange frame, which is part of the signature.
        let last = buf_2_to_1.len() - 1;
        buf_2_to_1[last] ^= 0x01;

        // Side 1 must reject the exchange.
        let mut outcome = Ok(());
        for _ in 0..8 {
            match drive(handshake1, &mut buf_2_to_1, &mut buf_1_to_2) {
                Ok(h) => handshake1 = h,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        assert!(matches!(outcome, Err(HandshakeError::InvalidSignature)));
    }

    #[test]
    fn algorithm_selection_follows_winner_order() {
        let local = [(KeyAgreement::P256, "P-256"), (KeyAgreement::P384, "P-384")];

        // When the local side wins, its order is scanned first.
        assert_eq!(
            select_algorithm(true, &local, "P-384,P-256"),
            Some(KeyAgreement::P256)
        );
        // When the remote side wins, its order is scanned first.
        assert_eq!(
            select_algorithm(false, &local, "P-384,P-256"),
            Some(KeyAgreement::P384)
        );
        // No overlap.
        assert_eq!(select_algorithm::<KeyAgreement>(true, &local, "X25519"), None);
        assert_eq!(select_algorithm::<KeyAgreement>(false, &local, ""), None);
    }
}
