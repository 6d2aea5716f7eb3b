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

//! Floodsub message routing.
//!
//! Floodsub is the simplest of the libp2p publish-subscribe protocols: every message is
//! forwarded to every directly-connected peer that is subscribed to one of the message's
//! topics, except the peer the message came from. A bounded cache of already-seen message ids
//! suppresses duplicates and routing loops.
//!
//! # Usage
//!
//! The [`Floodsub`] struct is a state machine that performs no I/O of its own. The API user
//! is responsible for opening, over each connected peer, a substream negotiating the protocol
//! name found in [`PROTOCOL_NAME`], and for reporting the peers and their data to the state
//! machine:
//!
//! - Call [`Floodsub::peer_connected`] and [`Floodsub::peer_disconnected`] when the substream
//! of a peer opens and closes.
//! - On the wire, each RPC is prefixed by its LEB128-encoded length. Accumulate each frame
//! and pass its content, without the prefix, to [`Floodsub::inject_rpc`].
//! - When [`InjectOutcome::PublishPending`] is returned, inspect
//! [`Floodsub::pending_publishes`] (for example to run an application-specific validity
//! check) and call either [`Floodsub::accept_pending_publishes`], which returns the messages
//! to deliver to the application and queues their forwarding, or
//! [`Floodsub::reject_pending_publishes`].
//! - Call [`Floodsub::flush`] after any operation that may have queued parts, and write each
//! returned frame to the corresponding peer. Report write completions with
//! [`Floodsub::write_acknowledged`] in order to resolve the [`DeliveryToken`]s of the
//! published messages.
//!
//! All the state is owned by the [`Floodsub`] object, which is expected to live in the
//! single task that routes messages; no synchronization is performed.

use crate::{util::protobuf, PeerId};

use alloc::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    string::{String, ToString as _},
    vec::Vec,
};
use core::fmt;
use rand::Rng as _;
use rand_chacha::{rand_core::SeedableRng as _, ChaCha20Rng};

/// Name of the protocol, typically used when negotiating it with *multistream-select*.
pub const PROTOCOL_NAME: &str = "/floodsub/1.0.0";

/// Number of message ids remembered for deduplication purposes, in the absence of a more
/// specific configuration.
///
/// Once the cache is full, the oldest id is evicted, which opens a theoretical replay window
/// of one cache generation. This is the accepted trade-off for bounded memory.
pub const DEFAULT_SEEN_MESSAGES_CAPACITY: usize = 10_000;

/// Configuration of a [`Floodsub`].
#[derive(Debug)]
pub struct Config {
    /// Identity of the local node, used as the `from` field of published messages.
    pub local_peer_id: PeerId,

    /// Capacity of the cache of already-seen message ids. Use
    /// [`DEFAULT_SEEN_MESSAGES_CAPACITY`] when in doubt.
    pub seen_messages_capacity: usize,

    /// Seed used to derive the initial sequence number of published messages. Sequence
    /// numbers must not repeat across restarts, as they are part of the message ids.
    pub randomness_seed: [u8; 32],
}

/// Identifier of a pubsub message, used for deduplication.
///
/// Consists of the concatenation of the `from` and `seqno` fields of the message. Since each
/// sender assigns itself 8-byte sequence numbers, the space is effectively collision-free per
/// sender. The text representation is the hexadecimal encoding of the bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(Vec<u8>);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// A pubsub message, as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identity of the original publisher. Normally the binary encoding of a [`PeerId`].
    pub from: Vec<u8>,
    /// Opaque payload.
    pub data: Vec<u8>,
    /// Sender-assigned sequence number. 8 bytes in practice.
    pub seqno: Vec<u8>,
    /// Topics this message is published on.
    pub topics: Vec<String>,
}

impl Message {
    /// Returns the deduplication id of this message.
    pub fn id(&self) -> MessageId {
        let mut bytes = Vec::with_capacity(self.from.len() + self.seqno.len());
        bytes.extend_from_slice(&self.from);
        bytes.extend_from_slice(&self.seqno);
        MessageId(bytes)
    }
}

/// Token representing the delivery of one message to one peer.
///
/// Resolved by [`Floodsub::write_acknowledged`] once the corresponding RPC has been written
/// out, or reported as failed by [`Floodsub::peer_disconnected`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryToken(u64);

/// Flood routing state machine.
pub struct Floodsub {
    /// See [`Config::local_peer_id`].
    local_peer_id: PeerId,

    /// Topics the local node is subscribed to.
    subscribed_topics: BTreeSet<String>,

    /// State of each connected peer.
    peers: BTreeMap<PeerId, Peer>,

    /// Bounded insertion-ordered cache of the ids of the messages already processed.
    seen_messages: SeenCache,

    /// Publishes received from a peer and waiting for [`Floodsub::accept_pending_publishes`]
    /// or [`Floodsub::reject_pending_publishes`].
    pending_validation: Option<PendingValidation>,

    /// Sequence number of the next published message.
    next_seqno: u64,

    /// Value of the next [`DeliveryToken`].
    next_token: u64,
}

struct Peer {
    /// Topics this peer has declared itself subscribed to.
    topics: BTreeSet<String>,

    /// Subscription changes queued to be sent to this peer.
    pending_subscriptions: Vec<(String, bool)>,

    /// Messages queued to be sent to this peer, with their delivery tokens. The order is
    /// preserved by [`Floodsub::flush`].
    pending_publish: Vec<(Message, DeliveryToken)>,

    /// Tokens of the messages that have been flushed and whose write hasn't been acknowledged
    /// yet.
    in_flight: Vec<DeliveryToken>,
}

struct PendingValidation {
    from: PeerId,
    messages: Vec<Message>,
}

/// Bounded insertion-ordered set of message ids. Eviction follows insertion order; a lookup
/// doesn't refresh the entry, as "has been seen" is the semantic, not "is frequently seen".
struct SeenCache {
    capacity: usize,
    queue: VecDeque<MessageId>,
    set: BTreeSet<MessageId>,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        SeenCache {
            capacity,
            queue: VecDeque::with_capacity(capacity.min(1024)),
            set: BTreeSet::new(),
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: MessageId) {
        if !self.set.insert(id.clone()) {
            return;
        }
        self.queue.push_back(id);
        if self.queue.len() > self.capacity {
            let evicted = self.queue.pop_front().unwrap();
            let _was_in = self.set.remove(&evicted);
            debug_assert!(_was_in);
        }
    }
}

impl Floodsub {
    /// Initializes a new flood router.
    pub fn new(config: Config) -> Self {
        let mut randomness = ChaCha20Rng::from_seed(config.randomness_seed);

        Floodsub {
            local_peer_id: config.local_peer_id,
            subscribed_topics: BTreeSet::new(),
            peers: BTreeMap::new(),
            seen_messages: SeenCache::new(config.seen_messages_capacity),
            pending_validation: None,
            next_seqno: randomness.gen(),
            next_token: 0,
        }
    }

    /// Subscribes the local node to a topic. Messages received on this topic are reported by
    /// [`Floodsub::accept_pending_publishes`].
    ///
    /// A subscription announcement is queued for every connected peer. Returns `false` if the
    /// local node was already subscribed, in which case nothing happens.
    pub fn subscribe(&mut self, topic: &str) -> bool {
        if !self.subscribed_topics.insert(topic.to_string()) {
            return false;
        }

        for peer in self.peers.values_mut() {
            peer.pending_subscriptions.push((topic.to_string(), true));
        }

        true
    }

    /// Unsubscribes the local node from a topic. Returns `false` if the local node wasn't
    /// subscribed.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        if !self.subscribed_topics.remove(topic) {
            return false;
        }

        for peer in self.peers.values_mut() {
            peer.pending_subscriptions.push((topic.to_string(), false));
        }

        true
    }

    /// Returns the topics the local node is subscribed to.
    pub fn subscribed_topics(&self) -> impl Iterator<Item = &str> {
        self.subscribed_topics.iter().map(String::as_str)
    }

    /// Registers a peer whose floodsub substream has opened.
    ///
    /// A "hello" RPC announcing all the local subscriptions is queued for this peer.
    ///
    /// # Panic
    ///
    /// Panics if the peer is already registered.
    ///
    pub fn peer_connected(&mut self, peer_id: PeerId) {
        let pending_subscriptions = self
            .subscribed_topics
            .iter()
            .map(|topic| (topic.clone(), true))
            .collect();

        let _previous = self.peers.insert(
            peer_id,
            Peer {
                topics: BTreeSet::new(),
                pending_subscriptions,
                pending_publish: Vec::new(),
                in_flight: Vec::new(),
            },
        );
        assert!(_previous.is_none());
    }

    /// Unregisters a peer whose floodsub substream has closed.
    ///
    /// Returns the tokens of the deliveries that will consequently never complete. Queued
    /// parts destined to this peer are dropped; the rest of the router state is unaffected.
    pub fn peer_disconnected(&mut self, peer_id: &PeerId) -> Vec<DeliveryToken> {
        let peer = match self.peers.remove(peer_id) {
            Some(peer) => peer,
            None => return Vec::new(),
        };

        let mut failed = peer.in_flight;
        failed.extend(peer.pending_publish.into_iter().map(|(_, token)| token));
        failed
    }

    /// Returns the topics a peer has declared itself subscribed to.
    pub fn peer_topics(&self, peer_id: &PeerId) -> impl Iterator<Item = &str> {
        self.peers
            .get(peer_id)
            .into_iter()
            .flat_map(|peer| peer.topics.iter().map(String::as_str))
    }

    /// Processes one RPC received from a peer. `rpc_bytes` is the content of the frame,
    /// without the length prefix.
    ///
    /// Subscription changes are applied immediately. If the RPC contains messages that
    /// haven't been seen before, [`InjectOutcome::PublishPending`] is returned, and either
    /// [`Floodsub::accept_pending_publishes`] or [`Floodsub::reject_pending_publishes`] must
    /// be called before anything else. A rejected RPC leaves no trace; in particular, a
    /// single malformed RPC from a peer doesn't affect the other peers.
    ///
    /// # Panic
    ///
    /// Panics if publishes from a previous call are still pending validation.
    ///
    pub fn inject_rpc(
        &mut self,
        from: &PeerId,
        rpc_bytes: &[u8],
    ) -> Result<InjectOutcome, InjectError> {
        assert!(self.pending_validation.is_none());

        if !self.peers.contains_key(from) {
            return Err(InjectError::UnknownPeer);
        }

        let rpc = decode_rpc(rpc_bytes).ok_or(InjectError::MalformedRpc)?;

        // Apply the subscription deltas.
        {
            let peer = self.peers.get_mut(from).unwrap();
            for (topic, subscribe) in rpc.subscriptions {
                if subscribe {
                    peer.topics.insert(topic);
                } else {
                    peer.topics.remove(&topic);
                }
            }
        }

        // A control section would be processed here; flood routing has no control plane, and
        // the section is ignored.

        // Deduplicate the messages.
        let unseen = rpc
            .publish
            .into_iter()
            .filter(|message| !self.seen_messages.contains(&message.id()))
            .collect::<Vec<_>>();

        if unseen.is_empty() {
            return Ok(InjectOutcome::Processed);
        }

        self.pending_validation = Some(PendingValidation {
            from: from.clone(),
            messages: unseen,
        });
        Ok(InjectOutcome::PublishPending)
    }

    /// Returns the messages waiting for validation, if any.
    pub fn pending_publishes(&self) -> Option<&[Message]> {
        self.pending_validation
            .as_ref()
            .map(|pending| &pending.messages[..])
    }

    /// Declares the pending messages valid. They are marked as seen, their forwarding to the
    /// other interested peers is queued, and they are returned for delivery to the
    /// application.
    ///
    /// Call [`Floodsub::flush`] afterwards to obtain the forwarding frames.
    ///
    /// # Panic
    ///
    /// Panics if no publishes are pending.
    ///
    pub fn accept_pending_publishes(&mut self) -> Vec<Message> {
        let PendingValidation { from, messages } = self.pending_validation.take().unwrap();

        for message in &messages {
            self.seen_messages.insert(message.id());
            let _ = self.broadcast(message, Some(&from));
        }

        messages
    }

    /// Declares the pending messages invalid. They are dropped without being marked as seen
    /// and without being forwarded.
    ///
    /// # Panic
    ///
    /// Panics if no publishes are pending.
    ///
    pub fn reject_pending_publishes(&mut self) {
        assert!(self.pending_validation.take().is_some());
    }

    /// Publishes a message on the given topics.
    ///
    /// The message is queued for every connected peer subscribed to at least one of the
    /// topics; call [`Floodsub::flush`] to obtain the frames. The returned tokens are
    /// resolved by [`Floodsub::write_acknowledged`] or failed by
    /// [`Floodsub::peer_disconnected`].
    pub fn publish(
        &mut self,
        topics: Vec<String>,
        data: Vec<u8>,
    ) -> Result<PublishOutcome, PublishError> {
        let message = Message {
            from: self.local_peer_id.as_bytes().to_vec(),
            data,
            seqno: self.next_seqno.to_be_bytes().to_vec(),
            topics,
        };

        let id = message.id();
        if self.seen_messages.contains(&id) {
            return Err(PublishError::MessageAlreadySeen);
        }

        self.next_seqno = self.next_seqno.wrapping_add(1);
        self.seen_messages.insert(id.clone());
        let tokens = self.broadcast(&message, None);

        Ok(PublishOutcome { id, tokens })
    }

    /// Queues `message` as a new RPC part for every interested peer. Returns the attached
    /// delivery tokens.
    fn broadcast(&mut self, message: &Message, exclude: Option<&PeerId>) -> Vec<DeliveryToken> {
        let mut tokens = Vec::new();
        let mut next_token = self.next_token;

        for (peer_id, peer) in self.peers.iter_mut() {
            if exclude.map_or(false, |excluded| excluded == peer_id) {
                continue;
            }
            if !message.topics.iter().any(|topic| peer.topics.contains(topic)) {
                continue;
            }

            let token = DeliveryToken(next_token);
            next_token += 1;
            peer.pending_publish.push((message.clone(), token));
            tokens.push(token);
        }

        self.next_token = next_token;
        tokens
    }

    /// Drains the queued RPC parts, merging the parts of each peer into a single RPC, and
    /// returns one frame per peer with something to send. The frames include the length
    /// prefix and must be written out verbatim.
    ///
    /// The parts of one peer are merged in the order they were queued.
    pub fn flush(&mut self) -> Vec<OutgoingRpc> {
        let mut out = Vec::new();

        for (peer_id, peer) in self.peers.iter_mut() {
            if peer.pending_subscriptions.is_empty() && peer.pending_publish.is_empty() {
                continue;
            }

            let subscriptions = core::mem::take(&mut peer.pending_subscriptions);
            let publish = core::mem::take(&mut peer.pending_publish);

            let messages = publish
                .iter()
                .map(|(message, _)| message.clone())
                .collect::<Vec<_>>();
            peer.in_flight
                .extend(publish.into_iter().map(|(_, token)| token));

            out.push(OutgoingRpc {
                peer_id: peer_id.clone(),
                frame: encode_rpc(&subscriptions, &messages),
            });
        }

        out
    }

    /// Reports that the writes of the frames previously returned by [`Floodsub::flush`] for
    /// this peer have completed. Returns the delivery tokens that are thereby resolved.
    pub fn write_acknowledged(&mut self, peer_id: &PeerId) -> Vec<DeliveryToken> {
        self.peers
            .get_mut(peer_id)
            .map(|peer| core::mem::take(&mut peer.in_flight))
            .unwrap_or_default()
    }
}

impl fmt::Debug for Floodsub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Floodsub")
            .field("num_peers", &self.peers.len())
            .field("subscribed_topics", &self.subscribed_topics)
            .finish()
    }
}

/// Outcome of [`Floodsub::inject_rpc`].
#[derive(Debug)]
pub enum InjectOutcome {
    /// The RPC has been fully processed.
    Processed,
    /// The RPC contains not-seen-before messages that are now waiting in
    /// [`Floodsub::pending_publishes`].
    PublishPending,
}

/// Error potentially returned by [`Floodsub::inject_rpc`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum InjectError {
    /// The peer hasn't been registered with [`Floodsub::peer_connected`].
    UnknownPeer,
    /// The RPC doesn't decode as a valid protobuf of the expected schema.
    MalformedRpc,
}

/// Success of [`Floodsub::publish`].
#[derive(Debug)]
pub struct PublishOutcome {
    /// Id under which the message has been recorded.
    pub id: MessageId,
    /// One token per peer the message has been queued for. Can be empty if no connected peer
    /// is subscribed to any of the topics.
    pub tokens: Vec<DeliveryToken>,
}

/// Error potentially returned by [`Floodsub::publish`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum PublishError {
    /// A message with the same id has already been published or received.
    MessageAlreadySeen,
}

/// One frame to write out, produced by [`Floodsub::flush`].
#[derive(Debug)]
pub struct OutgoingRpc {
    /// Peer the frame must be sent to.
    pub peer_id: PeerId,
    /// Frame content, including the length prefix.
    pub frame: Vec<u8>,
}

/// Fields of a decoded RPC.
struct RpcIn {
    subscriptions: Vec<(String, bool)>,
    publish: Vec<Message>,
}

fn encode_sub_opts(topic: &str, subscribe: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(topic.len() + 8);
    out.extend(protobuf::bool_tag_encode(1, subscribe));
    for slice in protobuf::string_tag_encode(2, topic) {
        out.extend_from_slice(slice.as_ref());
    }
    out
}

fn encode_message(message: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        message.from.len() + message.data.len() + message.seqno.len() + 64,
    );
    for slice in protobuf::bytes_tag_encode(1, &message.from) {
        out.extend_from_slice(slice.as_ref());
    }
    for slice in protobuf::bytes_tag_encode(2, &message.data) {
        out.extend_from_slice(slice.as_ref());
    }
    for slice in protobuf::bytes_tag_encode(3, &message.seqno) {
        out.extend_from_slice(slice.as_ref());
    }
    for topic in &message.topics {
        for slice in protobuf::string_tag_encode(4, topic) {
            out.extend_from_slice(slice.as_ref());
        }
    }
    out
}

/// Encodes one RPC, including its length prefix.
fn encode_rpc(subscriptions: &[(String, bool)], publish: &[Message]) -> Vec<u8> {
    let mut body = Vec::new();

    for (topic, subscribe) in subscriptions {
        for slice in protobuf::bytes_tag_encode(1, encode_sub_opts(topic, *subscribe)) {
            body.extend_from_slice(slice.as_ref());
        }
    }
    for message in publish {
        for slice in protobuf::bytes_tag_encode(2, encode_message(message)) {
            body.extend_from_slice(slice.as_ref());
        }
    }

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend(crate::util::leb128::encode_usize(body.len()));
    frame.extend_from_slice(&body);
    frame
}

fn decode_sub_opts(bytes: &[u8]) -> Option<(String, bool)> {
    let mut subscribe = false;
    let mut topic = None;

    let mut input = bytes;
    while !input.is_empty() {
        let (rest, (field, wire_ty)) =
            protobuf::tag_decode::<nom::error::Error<&[u8]>>(input).ok()?;
        input = match (field, wire_ty) {
            (1, 0) => {
                let (rest, value) = protobuf::bool_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                subscribe = value;
                rest
            }
            (2, 2) => {
                let (rest, value) =
                    protobuf::string_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                topic = Some(value.to_string());
                rest
            }
            (_, wire_ty) => {
                let (rest, ()) =
                    protobuf::value_skip_decode::<nom::error::Error<&[u8]>>(wire_ty)(rest).ok()?;
                rest
            }
        };
    }

    Some((topic?, subscribe))
}

fn decode_message(bytes: &[u8]) -> Option<Message> {
    let mut from = None;
    let mut data = Vec::new();
    let mut seqno = None;
    let mut topics = Vec::new();

    let mut input = bytes;
    while !input.is_empty() {
        let (rest, (field, wire_ty)) =
            protobuf::tag_decode::<nom::error::Error<&[u8]>>(input).ok()?;
        input = match (field, wire_ty) {
            (1, 2) => {
                let (rest, value) =
                    protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                from = Some(value.to_vec());
                rest
            }
            (2, 2) => {
                let (rest, value) =
                    protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                data = value.to_vec();
                rest
            }
            (3, 2) => {
                let (rest, value) =
                    protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                seqno = Some(value.to_vec());
                rest
            }
            (4, 2) => {
                let (rest, value) =
                    protobuf::string_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                topics.push(value.to_string());
                rest
            }
            (_, wire_ty) => {
                let (rest, ()) =
                    protobuf::value_skip_decode::<nom::error::Error<&[u8]>>(wire_ty)(rest).ok()?;
                rest
            }
        };
    }

    // Both `from` and `seqno` are required, as without them no deduplication id exists.
    Some(Message {
        from: from?,
        data,
        seqno: seqno?,
        topics,
    })
}

fn decode_rpc(bytes: &[u8]) -> Option<RpcIn> {
    let mut subscriptions = Vec::new();
    let mut publish = Vec::new();

    let mut input = bytes;
    while !input.is_empty() {
        let (rest, (field, wire_ty)) =
            protobuf::tag_decode::<nom::error::Error<&[u8]>>(input).ok()?;
        input = match (field, wire_ty) {
            (1, 2) => {
                let (rest, value) =
                    protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                subscriptions.push(decode_sub_opts(value)?);
                rest
            }
            (2, 2) => {
                let (rest, value) =
                    protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest).ok()?;
                publish.push(decode_message(value)?);
                rest
            }
            // The control section (field 3) belongs to the gossip-based routers and is
            // ignored here.
            (_, wire_ty) => {
                let (rest, ()) =
                    protobuf::value_skip_decode::<nom::error::Error<&[u8]>>(wire_ty)(rest).ok()?;
                rest
            }
        };
    }

    Some(RpcIn {
        subscriptions,
        publish,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        decode_rpc, encode_rpc, Config, Floodsub, InjectError, InjectOutcome, Message,
        PublishError,
    };
    use crate::peer_id::{PeerId, PublicKey};

    fn peer(n: u8) -> PeerId {
        PublicKey::Ed25519([n; 32]).into_peer_id()
    }

    fn router() -> Floodsub {
        Floodsub::new(Config {
            local_peer_id: peer(0),
            seen_messages_capacity: super::DEFAULT_SEEN_MESSAGES_CAPACITY,
            randomness_seed: rand::random(),
        })
    }

    fn subscription_rpc(topic: &str) -> Vec<u8> {
        let frame = encode_rpc(&[(topic.into(), true)], &[]);
        frame[1..].to_vec() // strip the one-byte length prefix
    }

    fn publish_rpc(message: &Message) -> Vec<u8> {
        let frame = encode_rpc(&[], core::slice::from_ref(message));
        // The test frames are small enough for a one-byte length prefix.
        assert!(frame.len() <= 128);
        frame[1..].to_vec()
    }

    fn test_message(sender: u8, seqno: u64, topic: &str) -> Message {
        Message {
            from: peer(sender).as_bytes().to_vec(),
            data: b"payload".to_vec(),
            seqno: seqno.to_be_bytes().to_vec(),
            topics: vec![topic.into()],
        }
    }

    #[test]
    fn rpc_round_trip() {
        let message = test_message(1, 42, "news");
        let frame = encode_rpc(&[("news".into(), true), ("olds".into(), false)], &[
            message.clone(),
        ]);

        // Strip the length prefix before decoding.
        let (rest, len) =
            crate::util::leb128::nom_leb128_usize::<nom::error::Error<&[u8]>>(&frame).unwrap();
        assert_eq!(rest.len(), len);

        let rpc = decode_rpc(rest).unwrap();
        assert_eq!(
            rpc.subscriptions,
            vec![("news".to_string(), true), ("olds".to_string(), false)]
        );
        assert_eq!(rpc.publish, vec![message]);
    }

    #[test]
    fn hello_rpc_on_peer_connected() {
        let mut router = router();
        router.subscribe("news");
        router.peer_connected(peer(1));

        let out = router.flush();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].peer_id, peer(1));

        let rpc = decode_rpc(&out[0].frame[1..]).unwrap();
        assert_eq!(rpc.subscriptions, vec![("news".to_string(), true)]);
        assert!(rpc.publish.is_empty());

        // Nothing left after the flush.
        assert!(router.flush().is_empty());
    }

    #[test]
    fn flood_fanout_excludes_origin_and_filters_topics() {
        let mut router = router();
        for n in 1..=4 {
            router.peer_connected(peer(n));
        }

        // Peers 1, 2 and 3 subscribe to "t"; peer 4 subscribes to something else.
        for n in 1..=3 {
            assert!(matches!(
                router.inject_rpc(&peer(n), &subscription_rpc("t")).unwrap(),
                InjectOutcome::Processed
            ));
        }
        assert!(matches!(
            router
                .inject_rpc(&peer(4), &subscription_rpc("other"))
                .unwrap(),
            InjectOutcome::Processed
        ));

        // A message arrives from peer 1.
        let message = test_message(1, 7, "t");
        assert!(matches!(
            router.inject_rpc(&peer(1), &publish_rpc(&message)).unwrap(),
            InjectOutcome::PublishPending
        ));
        let delivered = router.accept_pending_publishes();
        assert_eq!(delivered, vec![message.clone()]);

        // Exactly one RPC for peer 2 and one for peer 3; none for the origin nor for the
        // peer subscribed to another topic.
        let out = router.flush();
        let mut destinations = out.iter().map(|rpc| rpc.peer_id.clone()).collect::<Vec<_>>();
        destinations.sort();
        assert_eq!(destinations, vec![peer(2), peer(3)]);

        // The message id is now known.
        assert!(router.seen_messages.contains(&message.id()));
    }

    #[test]
    fn duplicate_message_not_forwarded_again() {
        let mut router = router();
        router.peer_connected(peer(1));
        router.peer_connected(peer(2));
        router.inject_rpc(&peer(1), &subscription_rpc("t")).unwrap();
        router.inject_rpc(&peer(2), &subscription_rpc("t")).unwrap();

        let message = test_message(1, 1, "t");

        assert!(matches!(
            router.inject_rpc(&peer(1), &publish_rpc(&message)).unwrap(),
            InjectOutcome::PublishPending
        ));
        router.accept_pending_publishes();
        assert_eq!(router.flush().len(), 1); // forwarded to peer 2 only

        // The same message arriving again, even from another peer, is fully absorbed.
        assert!(matches!(
            router.inject_rpc(&peer(2), &publish_rpc(&message)).unwrap(),
            InjectOutcome::Processed
        ));
        assert!(router.flush().is_empty());
    }

    #[test]
    fn publish_fans_out_and_resolves_tokens() {
        let mut router = router();
        router.peer_connected(peer(1));
        router.peer_connected(peer(2));
        router.peer_connected(peer(3));
        router.inject_rpc(&peer(1), &subscription_rpc("t")).unwrap();
        router.inject_rpc(&peer(2), &subscription_rpc("t")).unwrap();

        let outcome = router.publish(vec!["t".into()], b"fresh".to_vec()).unwrap();
        assert_eq!(outcome.tokens.len(), 2);
        assert!(router.seen_messages.contains(&outcome.id));

        let out = router.flush();
        assert_eq!(out.len(), 2);

        // Acknowledging the writes resolves the tokens.
        let mut resolved = Vec::new();
        resolved.extend(router.write_acknowledged(&peer(1)));
        resolved.extend(router.write_acknowledged(&peer(2)));
        resolved.sort();
        let mut expected = outcome.tokens.clone();
        expected.sort();
        assert_eq!(resolved, expected);

        // Nothing in flight anymore.
        assert!(router.write_acknowledged(&peer(1)).is_empty());
    }

    #[test]
    fn disconnection_fails_pending_deliveries() {
        let mut router = router();
        router.peer_connected(peer(1));
        router.inject_rpc(&peer(1), &subscription_rpc("t")).unwrap();

        let outcome = router.publish(vec!["t".into()], b"doomed".to_vec()).unwrap();
        assert_eq!(outcome.tokens.len(), 1);

        // Disconnect before the part is even flushed.
        let failed = router.peer_disconnected(&peer(1));
        assert_eq!(failed, outcome.tokens);
        assert!(router.flush().is_empty());
    }

    #[test]
    fn publish_duplicate_rejected() {
        let mut router = router();
        let first = router.publish(vec!["t".into()], b"x".to_vec()).unwrap();

        // Force the next sequence number to collide with the previous one.
        router.next_seqno = router.next_seqno.wrapping_sub(1);
        assert!(matches!(
            router.publish(vec!["t".into()], b"x".to_vec()),
            Err(PublishError::MessageAlreadySeen)
        ));
        let _ = first;
    }

    #[test]
    fn rejected_publishes_leave_no_trace() {
        let mut router = router();
        router.peer_connected(peer(1));
        router.peer_connected(peer(2));
        router.inject_rpc(&peer(2), &subscription_rpc("t")).unwrap();

        let message = test_message(1, 3, "t");

        assert!(matches!(
            router.inject_rpc(&peer(1), &publish_rpc(&message)).unwrap(),
            InjectOutcome::PublishPending
        ));
        router.reject_pending_publishes();

        // Not marked seen, not forwarded.
        assert!(!router.seen_messages.contains(&message.id()));
        assert!(router.flush().is_empty());

        // The same message can be submitted again later.
        assert!(matches!(
            router.inject_rpc(&peer(1), &publish_rpc(&message)).unwrap(),
            InjectOutcome::PublishPending
        ));
    }

    #[test]
    fn merged_rpc_preserves_part_order() {
        let mut router = router();
        router.peer_connected(peer(1));
        router.inject_rpc(&peer(1), &subscription_rpc("t")).unwrap();

        // Queue a subscription change and two publishes for the same peer.
        router.subscribe("extra");
        router.publish(vec!["t".into()], b"one".to_vec()).unwrap();
        router.publish(vec!["t".into()], b"two".to_vec()).unwrap();

        let out = router.flush();
        assert_eq!(out.len(), 1);

        let rpc = decode_rpc(&out[0].frame[1..]).unwrap();
        assert_eq!(rpc.subscriptions, vec![("extra".to_string(), true)]);
        assert_eq!(rpc.publish.len(), 2);
        assert_eq!(rpc.publish[0].data, b"one");
        assert_eq!(rpc.publish[1].data, b"two");
    }

    #[test]
    fn seen_cache_evicts_in_insertion_order() {
        let mut router = Floodsub::new(Config {
            local_peer_id: peer(0),
            seen_messages_capacity: 2,
            randomness_seed: rand::random(),
        });
        router.peer_connected(peer(1));

        let first = test_message(1, 1, "t");
        let second = test_message(1, 2, "t");
        let third = test_message(1, 3, "t");

        for message in [&first, &second, &third] {
            assert!(matches!(
                router.inject_rpc(&peer(1), &publish_rpc(message)).unwrap(),
                InjectOutcome::PublishPending
            ));
            router.accept_pending_publishes();
        }

        // The first id has been evicted by the third insertion, so the message would be
        // processed anew.
        assert!(!router.seen_messages.contains(&first.id()));
        assert!(router.seen_messages.contains(&second.id()));
        assert!(router.seen_messages.contains(&third.id()));
    }

    #[test]
    fn unknown_peer_rejected() {
        let mut router = router();
        assert!(matches!(
            router.inject_rpc(&peer(9), &subscription_rpc("t")),
            Err(InjectError::UnknownPeer)
        ));
    }

    #[test]
    fn message_id_is_hex_of_from_and_seqno() {
        let message = Message {
            from: vec![0xab, 0xcd],
            data: Vec::new(),
            seqno: vec![0x00, 0x01],
            topics: Vec::new(),
        };
        assert_eq!(message.id().to_string(), "abcd0001");
    }
}
