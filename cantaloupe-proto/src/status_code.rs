use core::{
    fmt::{self, Display, Formatter},
    num::NonZeroU16,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::util;

/// An inline status code carried by headers-only messages
///
/// Constants are provided for the codes the server is known to emit.
/// Values are guaranteed to be in range `100..1000`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCode(NonZeroU16);

impl StatusCode {
    /// Idle heartbeat or flow control message from a JetStream consumer
    pub const IDLE_HEARTBEAT: StatusCode = Self::new_internal(100);
    /// The request has successfully been processed
    pub const OK: StatusCode = Self::new_internal(200);
    /// No messages are immediately available for a `no_wait` pull
    pub const NOT_FOUND: StatusCode = Self::new_internal(404);
    /// An expiring pull request elapsed
    pub const TIMEOUT: StatusCode = Self::new_internal(408);
    /// The pull request conflicts with the consumer state
    pub const CONFLICT: StatusCode = Self::new_internal(409);
    /// The request was sent to a subject with no subscribers listening
    pub const NO_RESPONDERS: StatusCode = Self::new_internal(503);

    /// Decodes a status code from a slice of ASCII characters.
    ///
    /// The ASCII representation is expected to be in the form of `"NNN"`,
    /// where `N` is a numeric digit.
    ///
    /// # Errors
    ///
    /// It returns an error if the slice of bytes does not contain a valid status code.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, StatusCodeError> {
        if buf.len() != 3 {
            return Err(StatusCodeError);
        }

        util::parse_u16(buf)
            .map_err(|_| StatusCodeError)?
            .try_into()
            .map_err(|_| StatusCodeError)
    }

    const fn new_internal(val: u16) -> Self {
        match NonZeroU16::new(val) {
            Some(val) => Self(val),
            None => unreachable!(),
        }
    }
}

impl FromStr for StatusCode {
    type Err = StatusCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_ascii_bytes(s.as_bytes())
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = StatusCodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match NonZeroU16::new(value) {
            Some(value) if (100..1000).contains(&value.get()) => Ok(Self(value)),
            _ => Err(StatusCodeError),
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(value: StatusCode) -> Self {
        value.0.get()
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        u16::from(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u16::deserialize(deserializer)?;
        n.try_into().map_err(de::Error::custom)
    }
}

/// An error encountered while parsing [`StatusCode`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("invalid status code")]
pub struct StatusCodeError;

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use claims::assert_err;

    use super::StatusCode;

    #[test]
    fn valid_status_codes() {
        for status_code in [100, 200, 404, 408, 409, 503] {
            assert_eq!(
                status_code,
                u16::from(StatusCode::try_from(status_code).unwrap())
            );

            let s = status_code.to_string();
            assert_eq!(
                status_code,
                u16::from(StatusCode::from_ascii_bytes(s.as_bytes()).unwrap())
            );
        }
    }

    #[test]
    fn invalid_status_codes() {
        for status_code in [0u16, 5, 55, 1000, 9999] {
            assert_err!(StatusCode::try_from(status_code));

            let s = status_code.to_string();
            assert_err!(StatusCode::from_ascii_bytes(s.as_bytes()));
        }
    }
}
