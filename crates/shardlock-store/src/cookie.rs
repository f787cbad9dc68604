//! Lock cookies proving possession of an exclusively held session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock token plus the instant it was acquired.
///
/// A fresh cookie is minted for every lock attempt. Two cookies are equal
/// when their tokens are equal; the acquisition time is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockCookie {
    token: String,
    acquired_at: DateTime<Utc>,
}

impl LockCookie {
    /// Mint a cookie with a random token.
    pub fn new(acquired_at: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
            acquired_at,
        }
    }

    /// Rebuild a cookie read back from storage.
    ///
    /// Returns `None` for an empty token: an empty token means "unlocked".
    pub fn from_parts(token: impl Into<String>, acquired_at: DateTime<Utc>) -> Option<Self> {
        let token = token.into();
        if token.is_empty() {
            return None;
        }
        Some(Self { token, acquired_at })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Time elapsed since acquisition, never negative.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.acquired_at).max(chrono::Duration::zero())
    }
}

impl PartialEq for LockCookie {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for LockCookie {}

impl std::hash::Hash for LockCookie {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl std::fmt::Display for LockCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.token, self.acquired_at.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fresh_cookies_have_distinct_tokens() {
        let now = Utc::now();
        let a = LockCookie::new(now);
        let b = LockCookie::new(now);
        assert!(!a.token().is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn test_equality_ignores_timestamp() {
        let now = Utc::now();
        let a = LockCookie::from_parts("t1", now).unwrap();
        let b = LockCookie::from_parts("t1", now - Duration::minutes(5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_token_is_unlocked() {
        assert!(LockCookie::from_parts("", Utc::now()).is_none());
    }

    #[test]
    fn test_age_is_clamped() {
        let now = Utc::now();
        let cookie = LockCookie::new(now + Duration::seconds(10));
        assert_eq!(cookie.age(now), Duration::zero());
        assert_eq!(cookie.age(now + Duration::seconds(30)), Duration::seconds(20));
    }
}
