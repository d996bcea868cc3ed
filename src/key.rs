//! Overlay identities and the registration secret.
//!
//! Both are 32 bytes of key material. On input they are accepted as 64 hex characters or as
//! 52 z-base-32 characters; [`PeerKey`] always displays as z-base-32.

use std::{
    convert::Infallible,
    fmt::{self, Debug, Display},
    str::FromStr,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize, de};
use snafu::{Backtrace, ResultExt, Snafu};
use subtle::ConstantTimeEq;

/// Length in bytes of keys and secrets.
pub const KEY_LENGTH: usize = 32;

/// Error when parsing a [`PeerKey`] or a [`SharedSecret`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum KeyParsingError {
    #[snafu(display("invalid hex encoding"))]
    Hex { source: data_encoding::DecodeError },
    #[snafu(display("invalid z-base-32 encoding"))]
    Z32 { source: z32::Z32Error },
    #[snafu(display("invalid key length {len}, expected 32 bytes"))]
    InvalidLength { len: usize },
}

impl From<Infallible> for KeyParsingError {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

/// Decodes 32 bytes of key material from hex or z-base-32 text.
fn decode_key_text(s: &str) -> Result<[u8; KEY_LENGTH], KeyParsingError> {
    let s = s.trim();
    let bytes = if s.len() == 2 * KEY_LENGTH {
        data_encoding::HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .context(HexSnafu)?
    } else {
        z32::decode(s.as_bytes()).context(Z32Snafu)?
    };
    to_array(&bytes)
}

fn to_array(bytes: &[u8]) -> Result<[u8; KEY_LENGTH], KeyParsingError> {
    bytes
        .try_into()
        .map_err(|_| InvalidLengthSnafu { len: bytes.len() }.build())
}

/// The overlay identity of a peer, in its canonical binary form.
///
/// Unlike the iroh `PublicKey` this does not check that the bytes are a valid curve point:
/// the bridge only routes by identity, and the transport rejects keys it cannot dial.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::From, derive_more::Into)]
pub struct PeerKey([u8; KEY_LENGTH]);

impl PeerKey {
    /// Creates a key from raw bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// The canonical z-base-32 text form.
    pub fn to_z32(&self) -> String {
        z32::encode(&self.0)
    }

    /// Converts to a hex string limited to the first 5 bytes, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_z32())
    }
}

impl Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.to_z32())
    }
}

impl FromStr for PeerKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key_text(s).map(Self)
    }
}

impl TryFrom<&str> for PeerKey {
    type Error = KeyParsingError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&String> for PeerKey {
    type Error = KeyParsingError;

    fn try_from(s: &String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&[u8]> for PeerKey {
    type Error = KeyParsingError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        to_array(bytes).map(Self)
    }
}

impl AsRef<[u8]> for PeerKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for PeerKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_z32())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PeerKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes = <[u8; KEY_LENGTH]>::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}

/// The pre-shared secret that authorizes alias registrations.
///
/// Comparison runs in constant time and `Debug` never prints the key material.
#[derive(Clone)]
pub struct SharedSecret([u8; KEY_LENGTH]);

impl SharedSecret {
    /// Creates a secret from raw bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generates a random secret.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// The raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Whether `candidate` equals this secret, compared by content in constant time.
    pub fn matches(&self, candidate: &[u8; KEY_LENGTH]) -> bool {
        self.0[..].ct_eq(&candidate[..]).into()
    }

    /// The secret as lowercase hex, the form accepted by the configuration.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }
}

impl Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for SharedSecret {}

impl FromStr for SharedSecret {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key_text(s).map(Self)
    }
}

impl<'de> Deserialize<'de> for SharedSecret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for SharedSecret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
