//! Policies: named allow/deny pattern sets evaluated against request paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KesError;
use crate::identity::Identity;

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

/// Single path-segment glob match.
///
/// `*` matches any run of non-`/` characters, `?` matches one non-`/`
/// character, everything else is literal. The pattern must cover the whole
/// path; trailing slashes are significant.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    match_bytes(pattern.as_bytes(), path.as_bytes())
}

fn match_bytes(pat: &[u8], path: &[u8]) -> bool {
    match pat.split_first() {
        None => path.is_empty(),
        Some((&b'*', rest)) => {
            // Zero characters first, then one more non-separator at a time.
            if match_bytes(rest, path) {
                return true;
            }
            for (i, &c) in path.iter().enumerate() {
                if c == b'/' {
                    return false;
                }
                if match_bytes(rest, &path[i + 1..]) {
                    return true;
                }
            }
            false
        }
        Some((&b'?', rest)) => match path.split_first() {
            Some((&c, tail)) if c != b'/' => match_bytes(rest, tail),
            _ => false,
        },
        Some((&c, rest)) => match path.split_first() {
            Some((&p, tail)) if p == c => match_bytes(rest, tail),
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// A named set of allow and deny patterns.
///
/// A path is permitted iff no deny pattern matches and at least one allow
/// pattern matches. An empty allow list denies everything.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: Identity,
}

/// Metadata slice of a policy, for describe responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub created_at: DateTime<Utc>,
    pub created_by: Identity,
}

impl Policy {
    pub fn new(
        allow: Vec<String>,
        deny: Vec<String>,
        created_by: Identity,
    ) -> Result<Self, KesError> {
        for pattern in allow.iter().chain(deny.iter()) {
            if pattern.is_empty() {
                return Err(KesError::InvalidPattern(pattern.clone()));
            }
        }
        Ok(Self {
            allow,
            deny,
            created_at: Utc::now(),
            created_by,
        })
    }

    /// Evaluate `path`. Deny dominates allow; pattern order is irrelevant.
    pub fn verify(&self, path: &str) -> Result<(), KesError> {
        if self.deny.iter().any(|p| glob_match(p, path)) {
            return Err(KesError::NotAuthorized);
        }
        if self.allow.iter().any(|p| glob_match(p, path)) {
            return Ok(());
        }
        Err(KesError::NotAuthorized)
    }

    pub fn info(&self) -> PolicyInfo {
        PolicyInfo {
            created_at: self.created_at,
            created_by: self.created_by.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_stays_within_segment() {
        assert!(glob_match("/v1/key/get/*", "/v1/key/get/my-key"));
        assert!(!glob_match("/v1/key/get/*", "/v1/key/get/a/b"));
        assert!(glob_match("/v1/key/*/my-key", "/v1/key/get/my-key"));
        assert!(!glob_match("/v1/*", "/v1/key/get"));
    }

    #[test]
    fn star_matches_empty_run() {
        assert!(glob_match("/v1/key/get/*", "/v1/key/get/"));
        assert!(glob_match("x*y", "xy"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(glob_match("/v1/key/get/k?", "/v1/key/get/k1"));
        assert!(!glob_match("/v1/key/get/k?", "/v1/key/get/k12"));
        assert!(!glob_match("/v1/key/get/k?", "/v1/key/get/k/"));
    }

    #[test]
    fn whole_path_must_match() {
        assert!(!glob_match("/v1/key", "/v1/key/get/my-key"));
        assert!(!glob_match("/v1/key/get/my-key", "/v1/key"));
        // Trailing slashes are significant.
        assert!(!glob_match("/v1/status", "/v1/status/"));
    }

    fn policy(allow: &[&str], deny: &[&str]) -> Policy {
        Policy::new(
            allow.iter().map(|s| s.to_string()).collect(),
            deny.iter().map(|s| s.to_string()).collect(),
            Identity::unknown(),
        )
        .unwrap()
    }

    #[test]
    fn deny_dominates_allow() {
        let p = policy(&["/v1/key/decrypt/x*"], &["/v1/key/decrypt/x-secret"]);
        assert!(p.verify("/v1/key/decrypt/x-public").is_ok());
        assert!(p.verify("/v1/key/decrypt/x-secret").is_err());
    }

    #[test]
    fn empty_allow_denies_everything() {
        let p = policy(&[], &[]);
        assert!(p.verify("/v1/status").is_err());
        assert!(p.verify("").is_err());
    }

    #[test]
    fn empty_deny_denies_nothing_extra() {
        let p = policy(&["/v1/*/*/*"], &[]);
        assert!(p.verify("/v1/key/create/abc").is_ok());
    }

    #[test]
    fn empty_patterns_are_rejected() {
        let res = Policy::new(vec!["".into()], vec![], Identity::unknown());
        assert!(matches!(res, Err(KesError::InvalidPattern(_))));
    }
}
