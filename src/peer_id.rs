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

//! Identity of a node on the network, and the public key that proves it.
//!
//! A [`PeerId`] is the multihash of the protobuf encoding of the node's identity public key.
//! This crate always hashes the encoding with SHA-256, as mandated for keys that don't fit
//! inline; identity-hashed peer ids produced by other implementations are accepted when parsing.

use crate::{multihash, util::protobuf};

use alloc::{string::String, vec::Vec};
use core::{cmp, fmt, hash, str::FromStr};
use sha2::Digest as _;

/// Public key of a node's identity.
///
/// Libp2p specifies multiple different possible algorithms, but only Ed25519 support is
/// mandatory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicKey {
    /// An Ed25519 public key.
    Ed25519([u8; 32]),
}

/// `KeyType` values of the protobuf encoding. Only `Ed25519` is supported, but the other values
/// must be recognized in order to report them as unsupported rather than undecodable.
const KEY_TYPE_RSA: u64 = 0;
const KEY_TYPE_ED25519: u64 = 1;
const KEY_TYPE_SECP256K1: u64 = 2;
const KEY_TYPE_ECDSA: u64 = 3;

impl PublicKey {
    /// Encode the public key into the protobuf structure that is exchanged with other nodes and
    /// hashed into a [`PeerId`].
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        let PublicKey::Ed25519(key) = self;

        let mut out = Vec::with_capacity(40);
        out.extend(protobuf::varint_tag_encode(1, KEY_TYPE_ED25519));
        for slice in protobuf::bytes_tag_encode(2, key) {
            out.extend_from_slice(slice.as_ref());
        }
        out
    }

    /// Decode a public key from its protobuf encoding, e.g. received from another node.
    pub fn from_protobuf_encoding(bytes: &[u8]) -> Result<PublicKey, FromProtobufEncodingError> {
        let mut key_type = None;
        let mut data = None;

        let mut input = bytes;
        while !input.is_empty() {
            let (rest, (field, wire_ty)) =
                protobuf::tag_decode::<nom::error::Error<&[u8]>>(input)
                    .map_err(|_| FromProtobufEncodingError::ProtobufDecodeError)?;
            input = match (field, wire_ty) {
                (1, 0) => {
                    let (rest, value) = protobuf::varint_decode::<nom::error::Error<&[u8]>>(rest)
                        .map_err(|_| FromProtobufEncodingError::ProtobufDecodeError)?;
                    key_type = Some(value);
                    rest
                }
                (2, 2) => {
                    let (rest, value) =
                        protobuf::delimited_decode::<nom::error::Error<&[u8]>>(rest)
                            .map_err(|_| FromProtobufEncodingError::ProtobufDecodeError)?;
                    data = Some(value);
                    rest
                }
                (_, wire_ty) => {
                    let (rest, ()) =
                        protobuf::value_skip_decode::<nom::error::Error<&[u8]>>(wire_ty)(rest)
                            .map_err(|_| FromProtobufEncodingError::ProtobufDecodeError)?;
                    rest
                }
            };
        }

        match (key_type, data) {
            (Some(KEY_TYPE_ED25519), Some(data)) => {
                let key = <&[u8; 32]>::try_from(data)
                    .map_err(|_| FromProtobufEncodingError::BadEd25519Key)?;
                Ok(PublicKey::Ed25519(*key))
            }
            (Some(KEY_TYPE_RSA | KEY_TYPE_SECP256K1 | KEY_TYPE_ECDSA), Some(_)) => {
                Err(FromProtobufEncodingError::UnsupportedAlgorithm)
            }
            (Some(_), Some(_)) => Err(FromProtobufEncodingError::UnknownAlgorithm),
            _ => Err(FromProtobufEncodingError::ProtobufDecodeError),
        }
    }

    /// Convert the [`PublicKey`] into the corresponding [`PeerId`].
    pub fn into_peer_id(self) -> PeerId {
        self.into()
    }

    /// Verifies whether the given signature is valid for the given message using `self` as the
    /// public key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureVerifyFailed> {
        let PublicKey::Ed25519(public_key) = self;
        let public_key = ed25519_zebra::VerificationKey::try_from(*public_key)
            .map_err(|_| SignatureVerifyFailed())?;
        let signature =
            ed25519_zebra::Signature::try_from(signature).map_err(|_| SignatureVerifyFailed())?;
        public_key
            .verify(&signature, message)
            .map_err(|_| SignatureVerifyFailed())?;
        Ok(())
    }
}

/// Error potentially returned by [`PublicKey::from_protobuf_encoding`].
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum FromProtobufEncodingError {
    /// Error decoding the protobuf message.
    ProtobufDecodeError,
    /// Public key algorithm unknown.
    UnknownAlgorithm,
    /// Ed25519 key doesn't have the correct length.
    BadEd25519Key,
    /// Algorithms other than Ed25519 aren't supported.
    UnsupportedAlgorithm,
}

/// Call to [`PublicKey::verify`] has failed. No reason is provided for security reasons.
#[derive(Debug, derive_more::Display)]
pub struct SignatureVerifyFailed();

/// Identifier of a node of the network.
///
/// The data is a multihash of the protobuf encoding of the public key of the peer.
#[derive(Clone, Eq)]
pub struct PeerId {
    multihash: Vec<u8>,
}

impl PeerId {
    /// Builds the [`PeerId`] corresponding to a public key.
    pub fn from_public_key(key: &PublicKey) -> PeerId {
        let key_enc = key.to_protobuf_encoding();

        let mut multihash = Vec::with_capacity(34);
        multihash.push(0x12); // sha2-256
        multihash.push(0x20); // 32 bytes
        multihash.extend_from_slice(sha2::Sha256::digest(&key_enc).as_slice());

        PeerId { multihash }
    }

    /// Checks whether `data` is a valid [`PeerId`].
    ///
    /// In case of error, returns the bytes passed as parameter in addition to the error.
    pub fn from_bytes(data: Vec<u8>) -> Result<PeerId, (FromBytesError, Vec<u8>)> {
        let result = match multihash::MultihashRef::from_bytes(&data) {
            // SHA-256 of a public key. The preimage is unknown, so only the length can be
            // checked.
            Ok(hash) if hash.hash_algorithm_code() == 0x12 => {
                if hash.data().len() == 32 {
                    Ok(())
                } else {
                    Err(FromBytesError::InvalidHashLength)
                }
            }
            // Identity hashing. The content must itself be a valid public key.
            Ok(hash) if hash.hash_algorithm_code() == 0x0 => {
                match PublicKey::from_protobuf_encoding(hash.data()) {
                    Ok(_) => Ok(()),
                    Err(err) => Err(FromBytesError::InvalidPublicKey(err)),
                }
            }
            Ok(_) => Err(FromBytesError::UnknownHashAlgorithm),
            Err(_) => Err(FromBytesError::DecodeError),
        };

        match result {
            Ok(()) => Ok(PeerId { multihash: data }),
            Err(err) => Err((err, data)),
        }
    }

    /// Returns a raw bytes representation of this `PeerId`.
    pub fn into_bytes(self) -> Vec<u8> {
        self.multihash
    }

    /// Returns a raw bytes representation of this `PeerId`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.multihash
    }

    /// Returns a base-58 encoded string of this `PeerId`.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.as_bytes()).into_string()
    }
}

impl<'a> From<&'a PublicKey> for PeerId {
    fn from(public_key: &'a PublicKey) -> PeerId {
        PeerId::from_public_key(public_key)
    }
}

impl From<PublicKey> for PeerId {
    fn from(public_key: PublicKey) -> PeerId {
        PeerId::from_public_key(&public_key)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_base58()).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_base58().fmt(f)
    }
}

impl cmp::PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(Ord::cmp(self, other))
    }
}

impl cmp::Ord for PeerId {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.multihash.cmp(&other.multihash)
    }
}

impl PartialEq<PeerId> for PeerId {
    fn eq(&self, other: &PeerId) -> bool {
        self.multihash == other.multihash
    }
}

impl hash::Hash for PeerId {
    fn hash<H>(&self, state: &mut H)
    where
        H: hash::Hasher,
    {
        hash::Hash::hash(&self.multihash, state)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = FromBytesError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        PeerId::from_bytes(value).map_err(|(err, _)| err)
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(Bs58DecodeError)
            .map_err(ParseError::Bs58)?;
        PeerId::from_bytes(bytes).map_err(|(err, _)| ParseError::NotPeerId(err))
    }
}

/// Error when turning bytes into a [`PeerId`].
#[derive(Debug, derive_more::Display, Clone)]
pub enum FromBytesError {
    /// Failed to decode the bytes into a multihash.
    DecodeError,
    /// The hash algorithm of the multihash isn't one peer ids can use.
    UnknownHashAlgorithm,
    /// The length of the SHA-256 hash is invalid.
    InvalidHashLength,
    /// Multihash uses the identity algorithm, but the data isn't a valid public key.
    #[display(fmt = "Invalid public key: {}", _0)]
    InvalidPublicKey(FromProtobufEncodingError),
}

/// Error when parsing a string into a [`PeerId`].
#[derive(Debug, derive_more::Display)]
pub enum ParseError {
    /// Error decoding the base58 encoding.
    #[display(fmt = "Base58 decoding error: {}", _0)]
    Bs58(Bs58DecodeError),
    /// Decoded bytes aren't a valid [`PeerId`].
    #[display(fmt = "{}", _0)]
    NotPeerId(FromBytesError),
}

/// Error when decoding base58 encoding.
#[derive(Debug, derive_more::Display, derive_more::From)]
pub struct Bs58DecodeError(bs58::decode::Error);

#[cfg(test)]
mod tests {
    use super::{PeerId, PublicKey};
    use core::str::FromStr;

    #[test]
    fn public_key_protobuf_round_trip() {
        let key = PublicKey::Ed25519(rand::random());
        let encoded = key.to_protobuf_encoding();
        assert_eq!(PublicKey::from_protobuf_encoding(&encoded).unwrap(), key);
    }

    #[test]
    fn public_key_protobuf_known_encoding() {
        // Field 1 (varint) = 1 (ed25519), field 2 (bytes) = 32 bytes of key.
        let key = PublicKey::Ed25519([0x42; 32]);
        let encoded = key.to_protobuf_encoding();
        assert_eq!(&encoded[..4], &[0x08, 0x01, 0x12, 0x20]);
        assert_eq!(&encoded[4..], &[0x42; 32]);
    }

    #[test]
    fn peer_id_is_sha256_multihash() {
        let key = PublicKey::Ed25519(rand::random());
        let peer_id = key.clone().into_peer_id();
        let bytes = peer_id.as_bytes();
        assert_eq!(bytes.len(), 34);
        assert_eq!(&bytes[..2], &[0x12, 0x20]);

        let expected: [u8; 32] = {
            use sha2::Digest as _;
            sha2::Sha256::digest(key.to_protobuf_encoding()).into()
        };
        assert_eq!(&bytes[2..], &expected);
    }

    #[test]
    fn base58_round_trip() {
        let peer_id = PublicKey::Ed25519(rand::random()).into_peer_id();
        let string = peer_id.to_base58();
        let parsed = PeerId::from_str(&string).unwrap();
        assert_eq!(parsed, peer_id);
    }

    #[test]
    fn signature_verification() {
        let secret = ed25519_zebra::SigningKey::from(rand::random::<[u8; 32]>());
        let public = PublicKey::Ed25519(ed25519_zebra::VerificationKey::from(&secret).into());

        let message = b"the quick brown fox";
        let signature: [u8; 64] = secret.sign(message).into();

        assert!(public.verify(message, &signature).is_ok());
        assert!(public.verify(b"another message", &signature).is_err());

        let mut tampered = signature;
        tampered[5] ^= 0x40;
        assert!(public.verify(message, &tampered).is_err());
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(PeerId::from_bytes(vec![1, 2, 3, 4]).is_err());
    }
}
