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

//! Publish-subscribe message dissemination.
//!
//! In the publish-subscribe model, nodes subscribe to *topics*, publish messages tagged with
//! topics, and receive the messages published by others on the topics they are subscribed to.
//! No node has a complete view of the network; instead, each node forwards the messages it
//! receives to its direct peers, and a deduplication mechanism prevents messages from being
//! processed multiple times.
//!
//! The only routing strategy implemented at the moment is the simple flooding one, found in
//! [`floodsub`].

pub mod floodsub;
