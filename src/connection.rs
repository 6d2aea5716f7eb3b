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

//! State machines handling a single libp2p connection.
//!
//! A connection is a single duplex stream of bytes, typically a TCP socket, connecting the local
//! node to a remote. This module turns that raw stream of bytes into authenticated, encrypted,
//! multiplexed substreams.
//!
//! The lifecycle of a connection starts with the [`handshake`], during which the two nodes
//! negotiate an encryption protocol ([`noise`] or [`secio`]) with [`multistream_select`],
//! perform the chosen cryptographic handshake, then negotiate the [`mplex`] multiplexing
//! protocol on top of the encryption. After the handshake, the connection is [`established`],
//! and each substream opened through the multiplexer starts with its own protocol negotiation.

pub mod established;
pub mod handshake;
pub mod mplex;
pub mod multistream_select;
pub mod noise;
pub mod ping;
pub mod secio;
