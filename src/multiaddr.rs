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

//! Self-describing network addresses.
//!
//! A multiaddr is an ordered list of protocol components, such as
//! `/ip4/10.0.0.1/tcp/30333`. Each component consists of a protocol from a static registry plus
//! an optional value whose format is determined by the protocol.
//!
//! Multiaddresses have two canonical representations: a text form, used in UIs and
//! configuration, and a binary form, used on the wire. The binary form is the concatenation of
//! the components, each encoded as the LEB128-encoded protocol code followed by the value
//! encoded per the protocol's size policy: a fixed number of bytes, a LEB128-length-prefixed
//! variable number of bytes, or nothing. The [`Multiaddr`] struct stores the binary form, and
//! two multiaddresses are equal if and only if their binary forms are equal. Parsing the text
//! form normalizes the address (e.g. `/ip6/::1` and `/ip6/0:0:0:0:0:0:0:1` are the same
//! multiaddr).
//!
//! The `unix` protocol is *path-typed*: in the text form its value absorbs the entire remaining
//! suffix of the address, and no component can follow it.
//!
//! See <https://github.com/multiformats/multiaddr>.

use crate::util::leb128;

use alloc::{borrow::Cow, string::String, vec::Vec};
use core::{
    fmt, iter,
    net::{Ipv4Addr, Ipv6Addr},
    str::{self, FromStr},
};

/// Protocol codes of the registry, as assigned in the multiformats table.
pub mod codes {
    pub const IP4: u64 = 4;
    pub const TCP: u64 = 6;
    pub const IP6: u64 = 41;
    pub const DNS: u64 = 53;
    pub const DNS4: u64 = 54;
    pub const DNS6: u64 = 55;
    pub const DNSADDR: u64 = 56;
    pub const UDP: u64 = 273;
    pub const UNIX: u64 = 400;
    pub const P2P: u64 = 421;
    pub const WS: u64 = 477;
    pub const WSS: u64 = 478;
}

/// A multiaddress.
///
/// Wraps around the canonical binary encoding.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Multiaddr {
    bytes: Vec<u8>,
}

impl Multiaddr {
    /// Builds a new empty multiaddress, containing no component.
    pub fn empty() -> Self {
        Multiaddr { bytes: Vec::new() }
    }

    /// Returns the serialized version of this multiaddr.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Shrinks the memory used by the underlying container to its size.
    pub fn shrink_to_fit(&mut self) {
        self.bytes.shrink_to_fit()
    }

    /// Returns the list of components of the multiaddress.
    pub fn iter(&'_ self) -> impl Iterator<Item = ProtocolRef<'_>> + '_ {
        let mut iter =
            nom::combinator::iterator(&self.bytes[..], protocol::<nom::error::Error<&'_ [u8]>>);
        iter::from_fn(move || (&mut iter).next())
    }

    /// Returns the components whose protocol code is part of `codes`.
    ///
    /// See the [`codes`] module for the possible values.
    pub fn filter<'a, 'b: 'a>(
        &'b self,
        codes: &'a [u64],
    ) -> impl Iterator<Item = ProtocolRef<'b>> + 'a {
        self.iter().filter(move |c| codes.contains(&c.code()))
    }

    /// Returns the first component whose protocol code is part of `codes`, if any.
    ///
    /// See the [`codes`] module for the possible values.
    pub fn first_of(&self, codes: &[u64]) -> Option<ProtocolRef<'_>> {
        self.filter(codes).next()
    }

    /// Pushes a component at the end of the multiaddress.
    ///
    /// Errors if the current last component is path-typed, as nothing can follow a path.
    pub fn push(&mut self, protocol: ProtocolRef<'_>) -> Result<(), PushError> {
        if self.iter().last().map_or(false, |c| c.is_path()) {
            return Err(PushError::AfterPath);
        }

        for slice in protocol.as_bytes() {
            self.bytes.extend_from_slice(slice.as_ref());
        }

        Ok(())
    }
}

/// Error potentially returned by [`Multiaddr::push`].
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum PushError {
    /// A path-typed component terminates the address; no component can be added after it.
    AfterPath,
}

impl<'a> From<ProtocolRef<'a>> for Multiaddr {
    fn from(proto: ProtocolRef<'a>) -> Multiaddr {
        let bytes = proto.as_bytes().fold(Vec::new(), |mut a, b| {
            a.extend_from_slice(b.as_ref());
            a
        });

        Multiaddr { bytes }
    }
}

impl FromStr for Multiaddr {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // A trailing `/` is tolerated and ignored.
        let input = input.strip_suffix('/').unwrap_or(input);

        let mut bytes = Vec::with_capacity(input.len());
        let mut parts = input.split('/').peekable();

        if parts.next() != Some("") {
            return Err(ParseError::InvalidFormat);
        }

        while parts.peek().is_some() {
            let protocol = ProtocolRef::from_str_parts(&mut parts)?;
            let is_path = protocol.is_path();
            for slice in protocol.as_bytes() {
                bytes.extend_from_slice(slice.as_ref());
            }
            debug_assert!(!is_path || parts.peek().is_none());
        }

        Ok(Multiaddr { bytes })
    }
}

impl TryFrom<Vec<u8>> for Multiaddr {
    type Error = FromVecError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        // Check whether this is indeed a valid list of components, with any path-typed
        // component being the last one.
        let mut remain = &bytes[..];
        let mut after_path = false;
        while !remain.is_empty() {
            if after_path {
                return Err(FromVecError {});
            }
            match protocol::<nom::error::Error<&[u8]>>(remain) {
                Ok((rest, component)) => {
                    after_path = component.is_path();
                    remain = rest;
                }
                Err(_) => return Err(FromVecError {}),
            }
        }

        Ok(Multiaddr { bytes })
    }
}

/// Error potentially returned by the `TryFrom<Vec<u8>>` implementation of [`Multiaddr`].
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub struct FromVecError {}

/// Error potentially returned when parsing a multiaddress from its text form.
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The string doesn't start with `/`.
    InvalidFormat,
    /// A protocol name isn't part of the registry.
    UnknownProtocol,
    /// A protocol that requires a value isn't followed by one.
    MissingValue,
    /// The value of a component couldn't be parsed.
    InvalidValue,
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(&mut nom::combinator::iterator(
                &self.bytes[..],
                protocol::<nom::error::Error<&[u8]>>,
            ))
            .finish()
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for protocol in self.iter() {
            fmt::Display::fmt(&protocol, f)?;
        }

        Ok(())
    }
}

/// A single component of a multiaddress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolRef<'a> {
    Dns(&'a str),
    Dns4(&'a str),
    Dns6(&'a str),
    DnsAddr(&'a str),
    Ip4([u8; 4]),
    Ip6([u8; 16]),
    /// A multihash, normally the one of a [`crate::PeerId`].
    P2p(Cow<'a, [u8]>),
    Tcp(u16),
    Udp(u16),
    /// Path of a Unix domain socket. Always starts with a `/`. Terminal: no component can
    /// follow.
    Unix(Cow<'a, str>),
    Ws,
    Wss,
}

impl<'a> ProtocolRef<'a> {
    /// Parses a component from its name and, if the protocol has a value, the following parts of
    /// a `/`-separated text form.
    ///
    /// A path-typed protocol consumes all the remaining parts.
    pub fn from_str_parts(
        mut iter: impl Iterator<Item = &'a str>,
    ) -> Result<Self, ParseError> {
        match iter.next().ok_or(ParseError::MissingValue)? {
            "dns" => {
                let addr = iter.next().ok_or(ParseError::MissingValue)?;
                Ok(ProtocolRef::Dns(addr))
            }
            "dns4" => {
                let addr = iter.next().ok_or(ParseError::MissingValue)?;
                Ok(ProtocolRef::Dns4(addr))
            }
            "dns6" => {
                let addr = iter.next().ok_or(ParseError::MissingValue)?;
                Ok(ProtocolRef::Dns6(addr))
            }
            "dnsaddr" => {
                let addr = iter.next().ok_or(ParseError::MissingValue)?;
                Ok(ProtocolRef::DnsAddr(addr))
            }
            "ip4" => {
                let string_ip = iter.next().ok_or(ParseError::MissingValue)?;
                let parsed =
                    Ipv4Addr::from_str(string_ip).map_err(|_| ParseError::InvalidValue)?;
                Ok(ProtocolRef::Ip4(parsed.octets()))
            }
            "ip6" => {
                let string_ip = iter.next().ok_or(ParseError::MissingValue)?;
                let parsed =
                    Ipv6Addr::from_str(string_ip).map_err(|_| ParseError::InvalidValue)?;
                Ok(ProtocolRef::Ip6(parsed.octets()))
            }
            // `ipfs` is the legacy name of `p2p` and is still emitted by some implementations.
            "p2p" | "ipfs" => {
                let s = iter.next().ok_or(ParseError::MissingValue)?;
                let decoded = bs58::decode(s)
                    .into_vec()
                    .map_err(|_| ParseError::InvalidValue)?;
                if crate::multihash::MultihashRef::from_bytes(&decoded).is_err() {
                    return Err(ParseError::InvalidValue);
                }
                Ok(ProtocolRef::P2p(Cow::Owned(decoded)))
            }
            "tcp" => {
                let port = iter.next().ok_or(ParseError::MissingValue)?;
                Ok(ProtocolRef::Tcp(
                    port.parse().map_err(|_| ParseError::InvalidValue)?,
                ))
            }
            "udp" => {
                let port = iter.next().ok_or(ParseError::MissingValue)?;
                Ok(ProtocolRef::Udp(
                    port.parse().map_err(|_| ParseError::InvalidValue)?,
                ))
            }
            "unix" => {
                // Path-typed: the rest of the address is the path.
                let mut path = String::new();
                for part in iter {
                    path.push('/');
                    path.push_str(part);
                }
                if path.is_empty() {
                    return Err(ParseError::MissingValue);
                }
                Ok(ProtocolRef::Unix(Cow::Owned(path)))
            }
            "ws" => Ok(ProtocolRef::Ws),
            "wss" => Ok(ProtocolRef::Wss),
            _ => Err(ParseError::UnknownProtocol),
        }
    }

    /// Returns the protocol code of this component. See the [`codes`] module.
    pub fn code(&self) -> u64 {
        match self {
            ProtocolRef::Dns(_) => codes::DNS,
            ProtocolRef::Dns4(_) => codes::DNS4,
            ProtocolRef::Dns6(_) => codes::DNS6,
            ProtocolRef::DnsAddr(_) => codes::DNSADDR,
            ProtocolRef::Ip4(_) => codes::IP4,
            ProtocolRef::Ip6(_) => codes::IP6,
            ProtocolRef::P2p(_) => codes::P2P,
            ProtocolRef::Tcp(_) => codes::TCP,
            ProtocolRef::Udp(_) => codes::UDP,
            ProtocolRef::Unix(_) => codes::UNIX,
            ProtocolRef::Ws => codes::WS,
            ProtocolRef::Wss => codes::WSS,
        }
    }

    /// Returns `true` if this component is path-typed, in other words if it absorbs the entire
    /// remaining suffix of the text form and terminates the address.
    pub fn is_path(&self) -> bool {
        matches!(self, ProtocolRef::Unix(_))
    }

    /// Returns the binary encoding of this component, as a list of buffers to concatenate.
    pub fn as_bytes(&self) -> impl Iterator<Item = impl AsRef<[u8]> + '_> + '_ {
        let code = leb128::encode(self.code()).collect::<arrayvec::ArrayVec<u8, 9>>();

        // The value, prefixed by its length for variable-sized protocols.
        let (length, value): (Option<_>, Cow<'_, [u8]>) = match self {
            ProtocolRef::Dns(addr)
            | ProtocolRef::Dns4(addr)
            | ProtocolRef::Dns6(addr)
            | ProtocolRef::DnsAddr(addr) => (
                Some(leb128::encode_usize(addr.len()).collect::<arrayvec::ArrayVec<u8, 9>>()),
                Cow::Borrowed(addr.as_bytes()),
            ),
            ProtocolRef::Ip4(ip) => (None, Cow::Borrowed(&ip[..])),
            ProtocolRef::Ip6(ip) => (None, Cow::Borrowed(&ip[..])),
            ProtocolRef::P2p(multihash) => (
                Some(
                    leb128::encode_usize(multihash.len()).collect::<arrayvec::ArrayVec<u8, 9>>(),
                ),
                Cow::Borrowed(&multihash[..]),
            ),
            ProtocolRef::Tcp(port) | ProtocolRef::Udp(port) => {
                (None, Cow::Owned(port.to_be_bytes().to_vec()))
            }
            ProtocolRef::Unix(path) => (
                Some(leb128::encode_usize(path.len()).collect::<arrayvec::ArrayVec<u8, 9>>()),
                Cow::Borrowed(path.as_bytes()),
            ),
            ProtocolRef::Ws | ProtocolRef::Wss => (None, Cow::Borrowed(&[][..])),
        };

        iter::once(either::Left(code))
            .chain(length.map(either::Left).into_iter())
            .chain(iter::once(either::Right(value)))
    }
}

impl<'a> fmt::Display for ProtocolRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolRef::Dns(addr) => write!(f, "/dns/{}", addr),
            ProtocolRef::Dns4(addr) => write!(f, "/dns4/{}", addr),
            ProtocolRef::Dns6(addr) => write!(f, "/dns6/{}", addr),
            ProtocolRef::DnsAddr(addr) => write!(f, "/dnsaddr/{}", addr),
            ProtocolRef::Ip4(ip) => write!(f, "/ip4/{}", Ipv4Addr::from(*ip)),
            ProtocolRef::Ip6(ip) => write!(f, "/ip6/{}", Ipv6Addr::from(*ip)),
            ProtocolRef::P2p(multihash) => {
                write!(f, "/p2p/{}", bs58::encode(multihash).into_string())
            }
            ProtocolRef::Tcp(port) => write!(f, "/tcp/{}", port),
            ProtocolRef::Udp(port) => write!(f, "/udp/{}", port),
            // The path already contains its leading `/`.
            ProtocolRef::Unix(path) => write!(f, "/unix{}", path),
            ProtocolRef::Ws => write!(f, "/ws"),
            ProtocolRef::Wss => write!(f, "/wss"),
        }
    }
}

/// Parses a single component from its binary encoding.
fn protocol<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], ProtocolRef<'a>, E> {
    nom::combinator::flat_map(leb128::nom_leb128_u64, |protocol_code| {
        move |bytes: &'a [u8]| match protocol_code {
            codes::IP4 => nom::combinator::map(nom::bytes::complete::take(4_u32), |ip: &[u8]| {
                ProtocolRef::Ip4(ip.try_into().unwrap())
            })(bytes),
            codes::TCP => {
                nom::combinator::map(nom::number::complete::be_u16, ProtocolRef::Tcp)(bytes)
            }
            codes::IP6 => nom::combinator::map(nom::bytes::complete::take(16_u32), |ip: &[u8]| {
                ProtocolRef::Ip6(ip.try_into().unwrap())
            })(bytes),
            codes::DNS => nom::combinator::map(utf8_value, ProtocolRef::Dns)(bytes),
            codes::DNS4 => nom::combinator::map(utf8_value, ProtocolRef::Dns4)(bytes),
            codes::DNS6 => nom::combinator::map(utf8_value, ProtocolRef::Dns6)(bytes),
            codes::DNSADDR => nom::combinator::map(utf8_value, ProtocolRef::DnsAddr)(bytes),
            codes::UDP => {
                nom::combinator::map(nom::number::complete::be_u16, ProtocolRef::Udp)(bytes)
            }
            codes::UNIX => nom::combinator::map(
                nom::combinator::verify(utf8_value, |path: &str| path.starts_with('/')),
                |path| ProtocolRef::Unix(Cow::Borrowed(path)),
            )(bytes),
            codes::P2P => nom::combinator::map(
                nom::combinator::map_parser(
                    nom::multi::length_data(leb128::nom_leb128_usize),
                    nom::combinator::recognize(nom::combinator::all_consuming(
                        crate::multihash::multihash,
                    )),
                ),
                |b| ProtocolRef::P2p(Cow::Borrowed(b)),
            )(bytes),
            codes::WS => Ok((bytes, ProtocolRef::Ws)),
            codes::WSS => Ok((bytes, ProtocolRef::Wss)),
            _ => Err(nom::Err::Error(nom::error::make_error(
                bytes,
                nom::error::ErrorKind::Tag,
            ))),
        }
    })(bytes)
}

/// Parses a length-prefixed UTF-8 string value.
fn utf8_value<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], &'a str, E> {
    nom::combinator::map_opt(
        nom::multi::length_data(leb128::nom_leb128_usize),
        |s: &[u8]| str::from_utf8(s).ok(),
    )(bytes)
}

#[cfg(test)]
mod tests {
    use super::{codes, Multiaddr, ParseError, ProtocolRef, PushError};
    use core::str::FromStr;

    #[test]
    fn basic_parse() {
        let addr = Multiaddr::from_str("/ip4/127.0.0.1/tcp/1234").unwrap();

        let components = addr.iter().collect::<Vec<_>>();
        assert_eq!(
            components,
            vec![
                ProtocolRef::Ip4([127, 0, 0, 1]),
                ProtocolRef::Tcp(1234),
            ]
        );

        assert_eq!(addr.to_string(), "/ip4/127.0.0.1/tcp/1234");
        assert_eq!(
            addr.to_vec(),
            &[0x04, 0x7f, 0x00, 0x00, 0x01, 0x06, 0x04, 0xd2]
        );
    }

    #[test]
    fn missing_leading_slash() {
        assert!(matches!(
            Multiaddr::from_str("ip4/1.2.3.4/tcp/1234"),
            Err(ParseError::InvalidFormat)
        ));
    }

    #[test]
    fn unknown_protocol() {
        assert!(matches!(
            Multiaddr::from_str("/ip4/1.2.3.4/frob/1234"),
            Err(ParseError::UnknownProtocol)
        ));
    }

    #[test]
    fn missing_value() {
        assert!(matches!(
            Multiaddr::from_str("/ip4/1.2.3.4/tcp"),
            Err(ParseError::MissingValue)
        ));
    }

    #[test]
    fn trailing_slash_tolerated() {
        let addr = Multiaddr::from_str("/ip4/1.2.3.4/tcp/5/").unwrap();
        assert_eq!(addr.to_string(), "/ip4/1.2.3.4/tcp/5");
    }

    #[test]
    fn text_binary_round_trips() {
        for text in [
            "/ip4/1.2.3.4/tcp/5",
            "/ip6/::1/tcp/30333",
            "/dns/example.com/tcp/443/wss",
            "/dnsaddr/bootstrap.example.com",
            "/ip4/10.0.0.1/udp/9000",
            "/unix/var/run/node.sock",
        ] {
            let parsed = Multiaddr::from_str(text).unwrap();
            let binary_round_trip = Multiaddr::try_from(parsed.to_vec()).unwrap();
            assert_eq!(parsed, binary_round_trip);
            // One normalization pass is idempotent.
            let re_parsed = Multiaddr::from_str(&parsed.to_string()).unwrap();
            assert_eq!(re_parsed.to_string(), parsed.to_string());
        }
    }

    #[test]
    fn ip6_normalization() {
        let compressed = Multiaddr::from_str("/ip6/::1/tcp/10").unwrap();
        let expanded = Multiaddr::from_str("/ip6/0:0:0:0:0:0:0:1/tcp/10").unwrap();
        assert_eq!(compressed, expanded);
        assert_eq!(expanded.to_string(), "/ip6/::1/tcp/10");
    }

    #[test]
    fn unix_is_terminal() {
        let addr = Multiaddr::from_str("/unix/tmp/p2p.sock").unwrap();
        let components = addr.iter().collect::<Vec<_>>();
        assert_eq!(components.len(), 1);
        assert!(matches!(
            &components[0],
            ProtocolRef::Unix(path) if path == "/tmp/p2p.sock"
        ));
        assert_eq!(addr.to_string(), "/unix/tmp/p2p.sock");

        // In the text form, everything after `unix` is the path, even things that would
        // otherwise parse as components.
        let greedy = Multiaddr::from_str("/unix/tmp/tcp/1234").unwrap();
        assert_eq!(greedy.iter().count(), 1);

        // In the binary form, no component is allowed after the path.
        let mut bytes = addr.to_vec();
        bytes.extend_from_slice(&[0x06, 0x00, 0x50]);
        assert!(Multiaddr::try_from(bytes).is_err());

        // Pushing onto a path-terminated address fails too.
        let mut addr = addr;
        assert_eq!(
            addr.push(ProtocolRef::Tcp(1234)),
            Err(PushError::AfterPath)
        );
    }

    #[test]
    fn ipfs_alias() {
        let peer_id = crate::peer_id::PublicKey::Ed25519([7; 32]).into_peer_id();
        let as_p2p =
            Multiaddr::from_str(&format!("/ip4/1.2.3.4/tcp/5/p2p/{}", peer_id)).unwrap();
        let as_ipfs =
            Multiaddr::from_str(&format!("/ip4/1.2.3.4/tcp/5/ipfs/{}", peer_id)).unwrap();
        assert_eq!(as_p2p, as_ipfs);
        assert!(as_p2p.to_string().contains("/p2p/"));
    }

    #[test]
    fn p2p_invalid_multihash_rejected() {
        // `QmInvalid` decodes as base58 but isn't a multihash.
        assert!(Multiaddr::from_str("/p2p/badbase58!!").is_err());
        assert!(Multiaddr::from_str(&format!(
            "/p2p/{}",
            bs58::encode(&[1, 2, 3]).into_string()
        ))
        .is_err());
    }

    #[test]
    fn filter_and_first_of() {
        let addr = Multiaddr::from_str("/ip4/1.2.3.4/tcp/80/ws").unwrap();

        let transports = addr
            .filter(&[codes::TCP, codes::UDP])
            .collect::<Vec<_>>();
        assert_eq!(transports, vec![ProtocolRef::Tcp(80)]);

        assert_eq!(
            addr.first_of(&[codes::IP4, codes::IP6]),
            Some(ProtocolRef::Ip4([1, 2, 3, 4]))
        );
        assert_eq!(addr.first_of(&[codes::UNIX]), None);
    }

    #[test]
    fn binary_garbage_rejected() {
        assert!(Multiaddr::try_from(vec![0x04, 0x7f, 0x00]).is_err());
        assert!(Multiaddr::try_from(vec![0xff, 0xff, 0x01]).is_err());
    }

    #[test]
    fn empty_multiaddr() {
        let addr = Multiaddr::from_str("/").unwrap();
        assert_eq!(addr.iter().count(), 0);
        assert_eq!(addr.to_string(), "");
        assert_eq!(Multiaddr::try_from(Vec::new()).unwrap(), addr);
    }
}
