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

//! Low-level peer-to-peer networking.
//!
//! This crate implements the wire protocols of the *libp2p* networking stack. Their
//! specifications can be found in the <https://github.com/libp2p/specs> repository. The crate
//! contains code that allows connecting to and exchanging messages with libp2p-compatible nodes
//! over any duplex byte transport.
//!
//! # Network identity
//!
//! In order to join a peer-to-peer network, one must first generate a *network identity*. A
//! network identity is a small struct containing a cryptographic public key (here always
//! Ed25519) or the hash of a cryptographic public key. A network identity is represented with
//! the [`PeerId`] struct.
//!
//! Network identities primarily have a binary encoding. When displayed for UI purposes, the
//! string representation, which consists in the Base58 encoding of the binary encoding, is used.
//! Example string representation: `12D3KooWR3UGwwSP5wdBMk2JXXuzXoscPSudv8hmQkzfZTBzSbeE`.
//!
//! In order to generate a network identity, fill a [`peer_id::PublicKey::Ed25519`] with an
//! Ed25519 public key, then use [`PeerId::from_public_key`].
//!
//! When establishing a connection to another member of the peer-to-peer network, a cryptographic
//! handshake is performed in order to ensure that the remote indeed possesses the private key
//! corresponding to its network identity. Two such handshakes are implemented: the Noise-based
//! one found in [`connection::noise`], and the legacy SECIO one found in [`connection::secio`].
//!
//! # The `ReadWrite` object
//!
//! One of the most important objects in this crate is the [`read_write::ReadWrite`] struct.
//!
//! In order to allow for better determinism and testability, absolutely no code in this crate
//! directly interacts with operating-system-provided TCP sockets. Instead, this crate provides
//! state machines that need to be synchronized manually with a [`read_write::ReadWrite`] through
//! function calls. Once synchronized, the API user must in turn manually synchronize this
//! [`read_write::ReadWrite`] with the actual state of the operating-system-provided socket.
//!
//! The [`read_write::ReadWrite`] struct notably contains data that has been received on the
//! socket but hasn't been processed yet, and data that is queued for sending out but hasn't been
//! sent yet.
//!
//! The same principle applies to time: state machines never read a clock. The current time is
//! passed in from the outside through a generic `TNow` parameter, and state machines report,
//! through [`read_write::ReadWrite::wake_up_after`], the moment at which they need to be called
//! again even in the absence of socket activity. For the same reason, no code in this crate logs
//! anything or reads from a global source of randomness; state machines return typed events, and
//! randomness is injected through explicit seeds in the various `Config` structs.
//!
//! # Connections
//!
//! A connection goes through the following upgrade pipeline, where every step runs on top of the
//! output of the previous one:
//!
//! - A *multistream-select* negotiation choosing the encryption protocol. See
//! [`connection::multistream_select`].
//! - The chosen encryption handshake, either [`connection::noise`] or [`connection::secio`],
//! after which all traffic is encrypted and the remote's [`PeerId`] is known.
//! - A second *multistream-select* negotiation choosing the multiplexing protocol, performed on
//! top of the encryption.
//! - The [`connection::mplex`] multiplexer, which splits the connection into any number of
//! independent substreams. Each substream in turn starts with a *multistream-select*
//! negotiation of the application protocol to run on it.
//!
//! The [`connection::handshake`] module drives the first three steps and yields a
//! [`connection::established::Established`] state machine implementing the last one.
//!
//! # Publish-subscribe
//!
//! The [`pubsub::floodsub`] module contains a routing state machine for the `/floodsub/1.0.0`
//! protocol, which disseminates topic-tagged messages across a mesh of peers while suppressing
//! duplicates. Similarly to the rest of this crate, it performs no I/O of its own; the API user
//! is responsible for opening the substreams that the router's messages are read from and
//! written to.

extern crate alloc;

pub mod connection;
pub mod multiaddr;
pub mod multihash;
pub mod peer_id;
pub mod pubsub;
pub mod read_write;

mod util;

pub use multiaddr::Multiaddr;
pub use peer_id::PeerId;
