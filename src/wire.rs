//! Versioned binary messages of the registration and metrics protocols.
//!
//! The layout follows the compact encoding used by the overlay peers:
//!
//! * `uint`: one byte below `0xfd`, otherwise a `0xfd`/`0xfe`/`0xff` marker followed by a
//!   little endian `u16`/`u32`/`u64`.
//! * `bool`: one byte, `1` is true.
//! * `string`: `uint` byte length followed by UTF-8 bytes.
//! * `fixed32`: 32 raw bytes, no length prefix.
//!
//! Every message starts with its `uint` version. Decoding a message whose version is newer
//! than ours fails with [`DecodeError::FutureVersion`] instead of guessing at the layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};

use crate::key::{KEY_LENGTH, PeerKey, SharedSecret};

/// Errors when decoding a wire message.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display(
        "Cannot decode {message} of future version {version} (own version: {supported})"
    ))]
    FutureVersion {
        message: &'static str,
        version: u64,
        supported: u64,
    },
    #[snafu(display("Unexpected end of message"))]
    UnexpectedEnd {},
    #[snafu(display("Invalid bool value {value}"))]
    InvalidBool { value: u8 },
    #[snafu(display("Invalid UTF-8 in string field"))]
    InvalidUtf8 { source: std::string::FromUtf8Error },
}

/// Writes compact encoded fields.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Writes a variable length unsigned integer.
    pub fn uint(&mut self, n: u64) {
        if n < 0xfd {
            self.buf.put_u8(n as u8);
        } else if n <= u16::MAX as u64 {
            self.buf.put_u8(0xfd);
            self.buf.put_u16_le(n as u16);
        } else if n <= u32::MAX as u64 {
            self.buf.put_u8(0xfe);
            self.buf.put_u32_le(n as u32);
        } else {
            self.buf.put_u8(0xff);
            self.buf.put_u64_le(n);
        }
    }

    /// Writes a bool as a single byte.
    pub fn bool(&mut self, b: bool) {
        self.buf.put_u8(b as u8);
    }

    /// Writes a length prefixed UTF-8 string.
    pub fn string(&mut self, s: &str) {
        self.uint(s.len() as u64);
        self.buf.put_slice(s.as_bytes());
    }

    /// Writes 32 raw bytes.
    pub fn fixed32(&mut self, bytes: &[u8; KEY_LENGTH]) {
        self.buf.put_slice(bytes);
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads compact encoded fields.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(UnexpectedEndSnafu.build());
        }
        Ok(())
    }

    /// Reads a variable length unsigned integer.
    pub fn uint(&mut self) -> Result<u64, DecodeError> {
        self.need(1)?;
        let n = match self.buf.get_u8() {
            0xfd => {
                self.need(2)?;
                self.buf.get_u16_le() as u64
            }
            0xfe => {
                self.need(4)?;
                self.buf.get_u32_le() as u64
            }
            0xff => {
                self.need(8)?;
                self.buf.get_u64_le()
            }
            n => n as u64,
        };
        Ok(n)
    }

    /// Reads a single byte bool.
    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(InvalidBoolSnafu { value }.build()),
        }
    }

    /// Reads a length prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.uint()?;
        let len = usize::try_from(len).map_err(|_| UnexpectedEndSnafu.build())?;
        self.need(len)?;
        let mut bytes = vec![0u8; len];
        self.buf.copy_to_slice(&mut bytes);
        String::from_utf8(bytes).context(InvalidUtf8Snafu)
    }

    /// Reads 32 raw bytes.
    pub fn fixed32(&mut self) -> Result<[u8; KEY_LENGTH], DecodeError> {
        self.need(KEY_LENGTH)?;
        let mut bytes = [0u8; KEY_LENGTH];
        self.buf.copy_to_slice(&mut bytes);
        Ok(bytes)
    }
}

/// A message with a versioned compact encoding.
pub trait WireMessage: Sized {
    /// Name used in error messages.
    const NAME: &'static str;
    /// The version this implementation writes, and the newest it can read.
    const VERSION: u64;

    /// Writes the fields following the version.
    fn encode_fields(&self, enc: &mut Encoder);

    /// Reads the fields following the version.
    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    /// Encodes the message, version first.
    fn encode(&self) -> Bytes {
        let mut enc = Encoder::default();
        enc.uint(Self::VERSION);
        self.encode_fields(&mut enc);
        enc.finish()
    }

    /// Decodes a message, rejecting versions newer than [`Self::VERSION`].
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let version = dec.uint()?;
        if version > Self::VERSION {
            return Err(FutureVersionSnafu {
                message: Self::NAME,
                version,
                supported: Self::VERSION,
            }
            .build());
        }
        Self::decode_fields(&mut dec)
    }
}

/// Request to map `alias` to `target`, authorized by `secret`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    /// The shared secret, transmitted as is.
    pub secret: SharedSecret,
    /// The alias to register.
    pub alias: String,
    /// The overlay identity the alias should scrape.
    pub target: PeerKey,
}

impl WireMessage for RegisterRequest {
    const NAME: &'static str = "RegisterRequest";
    const VERSION: u64 = 0;

    fn encode_fields(&self, enc: &mut Encoder) {
        enc.fixed32(self.secret.as_bytes());
        enc.string(&self.alias);
        enc.fixed32(self.target.as_bytes());
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            secret: SharedSecret::from_bytes(dec.fixed32()?),
            alias: dec.string()?,
            target: PeerKey::from_bytes(dec.fixed32()?),
        })
    }
}

/// Reply to a [`RegisterRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterResponse {
    /// The registration was applied.
    Success {
        /// False when the registration only renewed an existing entry.
        updated: bool,
    },
    /// The registration was refused.
    Failure {
        /// Why the registration was refused.
        error_message: String,
    },
}

impl WireMessage for RegisterResponse {
    const NAME: &'static str = "RegisterReply";
    const VERSION: u64 = 0;

    fn encode_fields(&self, enc: &mut Encoder) {
        match self {
            Self::Success { updated } => {
                enc.bool(true);
                enc.bool(*updated);
            }
            Self::Failure { error_message } => {
                enc.bool(false);
                enc.string(error_message);
            }
        }
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        if dec.bool()? {
            Ok(Self::Success {
                updated: dec.bool()?,
            })
        } else {
            Ok(Self::Failure {
                error_message: dec.string()?,
            })
        }
    }
}

/// Reply of a scraped peer to the `metrics` method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsResponse {
    /// The peer collected its metrics.
    Success {
        /// The metrics in the text exposition format.
        metrics: String,
    },
    /// The peer failed to collect its metrics.
    Failure {
        /// The peer's error.
        error_message: String,
    },
}

impl WireMessage for MetricsResponse {
    const NAME: &'static str = "MetricsReply";
    const VERSION: u64 = 0;

    fn encode_fields(&self, enc: &mut Encoder) {
        match self {
            Self::Success { metrics } => {
                enc.bool(true);
                enc.string(metrics);
            }
            Self::Failure { error_message } => {
                enc.bool(false);
                enc.string(error_message);
            }
        }
    }

    fn decode_fields(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        if dec.bool()? {
            Ok(Self::Success {
                metrics: dec.string()?,
            })
        } else {
            Ok(Self::Failure {
                error_message: dec.string()?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::Result;
    use pretty_assertions::assert_eq;

    use super::*;

    fn request() -> RegisterRequest {
        RegisterRequest {
            secret: SharedSecret::from_bytes([9; 32]),
            alias: "dummy".to_string(),
            target: PeerKey::from_bytes([0xaa; 32]),
        }
    }

    #[test]
    fn request_layout() -> Result {
        let bytes = request().encode();
        assert_eq!(bytes.len(), 1 + 32 + 1 + 5 + 32);
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..33], &[9; 32]);
        assert_eq!(bytes[33], 5);
        assert_eq!(&bytes[34..39], b"dummy");
        assert_eq!(RegisterRequest::decode(&bytes)?, request());
        Ok(())
    }

    #[test]
    fn responses_roundtrip() -> Result {
        let success = RegisterResponse::Success { updated: true };
        assert_eq!(success.encode().as_ref(), &[0, 1, 1]);
        assert_eq!(RegisterResponse::decode(&success.encode())?, success);

        let failure = RegisterResponse::Failure {
            error_message: "unauthorised".to_string(),
        };
        assert_eq!(RegisterResponse::decode(&failure.encode())?, failure);

        let metrics = MetricsResponse::Success {
            metrics: "process_cpu_user_seconds_total 0.1\n".repeat(100),
        };
        assert_eq!(MetricsResponse::decode(&metrics.encode())?, metrics);
        Ok(())
    }

    #[test]
    fn uint_boundaries() -> Result {
        for (n, len) in [(0xfc, 1), (0xfd, 3), (0xffff, 3), (0x1_0000, 5), (u64::MAX, 9)] {
            let mut enc = Encoder::default();
            enc.uint(n);
            let bytes = enc.finish();
            assert_eq!(bytes.len(), len, "encoded length of {n}");
            assert_eq!(Decoder::new(&bytes).uint()?, n);
        }
        Ok(())
    }

    #[test]
    fn future_version_is_rejected() {
        let mut bytes = request().encode().to_vec();
        bytes[0] = 1;
        let err = RegisterRequest::decode(&bytes).unwrap_err();
        assert!(
            matches!(
                err,
                DecodeError::FutureVersion {
                    version: 1,
                    supported: 0,
                    ..
                }
            ),
            "{err:?}"
        );
        assert!(err.to_string().contains("future version 1"));

        let err = MetricsResponse::decode(&[0xfd, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, DecodeError::FutureVersion { version: 256, .. }));
    }

    #[test]
    fn malformed_input() {
        let bytes = request().encode();
        let err = RegisterRequest::decode(&bytes[..40]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEnd { .. }));

        let err = RegisterResponse::decode(&[0, 2]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidBool { value: 2, .. }));

        let err = MetricsResponse::decode(&[0, 1, 2, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8 { .. }));

        let err = RegisterResponse::decode(&[]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEnd { .. }));
    }
}
