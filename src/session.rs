use std::sync::RwLock;

use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError};

/// Marks one generation of the session slot. Captured when an operation
/// starts and compared again before its completion is applied, so responses
/// that outlive a login/logout are dropped instead of committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEpoch(u64);

/// The authenticated identity plus the key that decrypts record fields.
#[derive(Clone)]
pub struct SessionData {
    pub user_id: i64,
    pub username: String,
    pub token: String,
    secret_key: Zeroizing<String>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            user_id: -1,
            username: String::new(),
            token: String::new(),
            secret_key: Zeroizing::new(String::new()),
        }
    }
}

impl SessionData {
    pub fn is_authenticated(&self) -> bool {
        self.user_id >= 0
    }
}

struct Inner {
    data: SessionData,
    epoch: u64,
}

/// Single slot for the current identity. Replaced wholesale on login, signup
/// and logout; readers see either the old or the new session, never a mix.
pub struct Session {
    inner: RwLock<Inner>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                data: SessionData::default(),
                epoch: 0,
            }),
        }
    }

    /// Replace the whole session and start a new epoch.
    pub fn set_authenticated(
        &self,
        secret_key: &str,
        user_id: i64,
        username: &str,
        token: &str,
    ) -> SessionEpoch {
        let mut inner = self.inner.write().unwrap();
        inner.data = SessionData {
            user_id,
            username: username.to_string(),
            token: token.to_string(),
            secret_key: Zeroizing::new(secret_key.to_string()),
        };
        inner.epoch += 1;
        SessionEpoch(inner.epoch)
    }

    /// Reset to the unauthenticated state. The record cache must be wiped in
    /// the same logical transaction so the previous user's plaintext does not
    /// stay resident.
    pub fn clear(&self) -> SessionEpoch {
        let mut inner = self.inner.write().unwrap();
        inner.data = SessionData::default();
        inner.epoch += 1;
        SessionEpoch(inner.epoch)
    }

    pub fn snapshot(&self) -> SessionData {
        self.inner.read().unwrap().data.clone()
    }

    pub fn epoch(&self) -> SessionEpoch {
        SessionEpoch(self.inner.read().unwrap().epoch)
    }

    pub fn is_current(&self, epoch: SessionEpoch) -> bool {
        self.epoch() == epoch
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.read().unwrap().data.is_authenticated()
    }

    pub fn token(&self) -> String {
        self.inner.read().unwrap().data.token.clone()
    }

    /// Decode the stored secret key into raw AES key bytes.
    pub fn key_bytes(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let inner = self.inner.read().unwrap();
        crypto::decode_key(&inner.data.secret_key)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
