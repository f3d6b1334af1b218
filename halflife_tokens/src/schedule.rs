use halflife_clock::{DurationSecs, UnixTime};

use crate::Claims;

/// A credential's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The credential is valid and less than half of its lifetime has passed
    Fresh,
    /// The credential is valid, but should be refreshed
    Stale,
    /// The credential is no longer valid
    Expired,
}

/// When the currently cached credential should be turned in for a new one
///
/// A credential is refreshed once half of its lifetime has elapsed, leaving the
/// other half as margin for clock skew and for retrying a failed refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshSchedule {
    anchor: UnixTime,
    lifetime: DurationSecs,
}

impl RefreshSchedule {
    /// Derives the schedule from a decoded claim set
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            anchor: claims.not_before(),
            lifetime: claims.lifetime(),
        }
    }

    /// The time the schedule counts from (the credential's not-before time)
    #[inline]
    pub fn anchor(&self) -> UnixTime {
        self.anchor
    }

    /// How long after the anchor the credential should be refreshed
    #[inline]
    pub fn half_life(&self) -> DurationSecs {
        self.lifetime / 2
    }

    /// The time the credential expires
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.anchor + self.lifetime
    }

    /// Whether more than half of the credential's lifetime has elapsed at `now`
    ///
    /// Compared as `2 * elapsed > lifetime` so odd lifetimes keep their
    /// half-second boundary.
    #[inline]
    pub fn is_due_at(&self, now: UnixTime) -> bool {
        let elapsed = now - self.anchor;
        u128::from(elapsed.0) * 2 > u128::from(self.lifetime.0)
    }

    /// Gets the credential's lifetime status as of the provided time
    pub fn status_at(&self, now: UnixTime) -> TokenStatus {
        if now >= self.expiry() {
            TokenStatus::Expired
        } else if self.is_due_at(now) {
            TokenStatus::Stale
        } else {
            TokenStatus::Fresh
        }
    }

    /// Gets a duration for how much longer the credential would be fresh as of
    /// the provided time
    #[inline]
    pub fn until_stale_at(&self, now: UnixTime) -> DurationSecs {
        (self.anchor + self.half_life()) - now
    }
}
