//! Single-use authorization tokens.
//!
//! Callers post a token before asking the coordinator to open a connection;
//! the coordinator consumes it when the request is accepted. No token
//! survives a successful verification.

use std::collections::HashSet;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{NetError, Result};

pub type AuthorizationToken = Uuid;

/// One-shot token table for a single target component.
#[derive(Debug, Default)]
pub struct AuthorizationTokenStore {
    tokens: Mutex<HashSet<AuthorizationToken>>,
}

impl AuthorizationTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues and posts a fresh token in one step.
    pub fn issue(&self) -> AuthorizationToken {
        let token = Uuid::new_v4();
        self.post(token);
        token
    }

    pub fn post(&self, token: AuthorizationToken) {
        self.tokens.lock().insert(token);
    }

    /// Consumes the token; absent tokens are a lookup miss.
    pub fn verify_and_consume(&self, token: AuthorizationToken) -> Result<()> {
        if self.tokens.lock().remove(&token) {
            Ok(())
        } else {
            Err(NetError::LookupMiss(format!(
                "authorization token [{token}] not posted or already used"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_single_use() {
        let store = AuthorizationTokenStore::new();
        let token = store.issue();
        store.verify_and_consume(token).unwrap();
        assert!(matches!(
            store.verify_and_consume(token),
            Err(NetError::LookupMiss(_))
        ));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let store = AuthorizationTokenStore::new();
        assert!(store.verify_and_consume(Uuid::new_v4()).is_err());
    }
}
