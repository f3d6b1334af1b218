//! Decoding of the claims carried by a credential
//!
//! Credentials are compact three-segment tokens. Only the payload segment is
//! inspected; the signature is the server's concern and is never verified here.

use base64::{engine::general_purpose::STANDARD, Engine};
use halflife_clock::{DurationSecs, UnixTime};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::{error::MalformedCredential, AccessTokenRef, Subject, SubjectRef};

/// The claims the token manager relies on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    sub: Subject,
    #[serde(deserialize_with = "numeric_date")]
    nbf: UnixTime,
    #[serde(deserialize_with = "numeric_date")]
    exp: UnixTime,
}

impl Claims {
    /// Constructs a claim set directly
    pub fn new(sub: impl Into<Subject>, nbf: UnixTime, exp: UnixTime) -> Self {
        Self {
            sub: sub.into(),
            nbf,
            exp,
        }
    }

    /// Decodes the payload segment of a credential
    ///
    /// The payload is read as base64url, with the URL-safe alphabet translated
    /// to the standard one and padding restored, and then parsed as JSON. A
    /// credential whose expiry is not after its not-before time is rejected.
    pub fn decode(token: &AccessTokenRef) -> Result<Self, MalformedCredential> {
        let segments: Vec<&str> = token.as_str().split('.').collect();
        let &[_, payload, _] = segments.as_slice() else {
            return Err(MalformedCredential::SegmentCount(segments.len()));
        };

        let json = decode_base64url(payload)?;
        let claims: Claims = serde_json::from_slice(&json)?;

        if claims.exp <= claims.nbf {
            return Err(MalformedCredential::NonPositiveLifetime {
                nbf: claims.nbf.0,
                exp: claims.exp.0,
            });
        }

        Ok(claims)
    }

    /// The subject the credential was issued to
    #[inline]
    pub fn subject(&self) -> &SubjectRef {
        &self.sub
    }

    /// The time at which the credential becomes valid
    #[inline]
    pub fn not_before(&self) -> UnixTime {
        self.nbf
    }

    /// The time at which the credential expires
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.exp
    }

    /// The total time the credential is valid for
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.exp - self.nbf
    }

    /// Half of the credential's lifetime, rounded down
    #[inline]
    pub fn half_life(&self) -> DurationSecs {
        self.lifetime() / 2
    }
}

/// Reads a NumericDate, which may carry fractional seconds, rounding down
fn numeric_date<'de, D>(deserializer: D) -> Result<UnixTime, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;

    if !secs.is_finite() || secs < 0.0 {
        return Err(de::Error::invalid_value(
            de::Unexpected::Float(secs),
            &"a non-negative number of seconds since the epoch",
        ));
    }

    Ok(UnixTime(secs.floor() as u64))
}

fn decode_base64url(segment: &str) -> Result<Vec<u8>, MalformedCredential> {
    let mut standard: String = segment
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();

    match standard.len() % 4 {
        0 => {}
        2 => standard.push_str("=="),
        3 => standard.push('='),
        _ => return Err(MalformedCredential::IllegalLength),
    }

    Ok(STANDARD.decode(standard)?)
}
