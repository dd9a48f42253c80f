use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use ring::{digest, hmac};

use crate::errors::{NativeSrvError, Result};

/// A user that passed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub name: String,
    /// Database to use when the client doesn't name one.
    pub default_database: Option<String>,
    /// Settings from the user's profile, applied before the client's own.
    pub settings: Vec<(String, String)>,
}

impl AuthenticatedUser {
    pub fn new(name: impl Into<String>) -> Self {
        AuthenticatedUser {
            name: name.into(),
            default_database: None,
            settings: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Authenticator: Sync + Send + fmt::Debug {
    /// Authenticate a user with a password.
    async fn authenticate(
        &self,
        user: &str,
        password: &str,
        address: Option<SocketAddr>,
    ) -> Result<AuthenticatedUser>;

    /// Authenticate a user that signed `challenge` with their key.
    async fn verify_signature(
        &self,
        user: &str,
        _challenge: &str,
        _signature: &str,
    ) -> Result<AuthenticatedUser> {
        Err(NativeSrvError::AuthenticationFailed(format!(
            "{user}: key authentication is not supported"
        )))
    }

    /// Resolve the user an inter-server query runs as. Only called once the
    /// query's hash has been verified against the cluster secret.
    async fn user_for_interserver(&self, user: &str) -> Result<AuthenticatedUser> {
        Ok(AuthenticatedUser::new(user))
    }
}

/// Accept every user without checking anything.
#[derive(Debug, Default)]
pub struct PasswordlessAuthenticator;

#[async_trait]
impl Authenticator for PasswordlessAuthenticator {
    async fn authenticate(
        &self,
        user: &str,
        _password: &str,
        _address: Option<SocketAddr>,
    ) -> Result<AuthenticatedUser> {
        Ok(AuthenticatedUser::new(user))
    }
}

#[derive(Debug, Clone)]
struct UserEntry {
    password: String,
    signing_key: Option<Vec<u8>>,
    default_database: Option<String>,
    settings: Vec<(String, String)>,
}

/// Authenticate against a fixed set of users.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, UserEntry>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(
            user.into(),
            UserEntry {
                password: password.into(),
                signing_key: None,
                default_database: None,
                settings: Vec::new(),
            },
        );
        self
    }

    /// Allow `user` to authenticate by signing a challenge with `key`.
    ///
    /// Does nothing if the user hasn't been added.
    pub fn with_signing_key(mut self, user: &str, key: impl Into<Vec<u8>>) -> Self {
        if let Some(entry) = self.users.get_mut(user) {
            entry.signing_key = Some(key.into());
        }
        self
    }

    pub fn with_default_database(mut self, user: &str, database: impl Into<String>) -> Self {
        if let Some(entry) = self.users.get_mut(user) {
            entry.default_database = Some(database.into());
        }
        self
    }

    pub fn with_setting(
        mut self,
        user: &str,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        if let Some(entry) = self.users.get_mut(user) {
            entry.settings.push((name.into(), value.into()));
        }
        self
    }

    fn lookup(&self, user: &str) -> Result<(&str, &UserEntry)> {
        self.users
            .get_key_value(user)
            .map(|(name, entry)| (name.as_str(), entry))
            .ok_or_else(|| {
                NativeSrvError::AuthenticationFailed(format!(
                    "{user}: Authentication failed: password is incorrect, or there is no user with such name"
                ))
            })
    }

    fn to_user(name: &str, entry: &UserEntry) -> AuthenticatedUser {
        AuthenticatedUser {
            name: name.to_string(),
            default_database: entry.default_database.clone(),
            settings: entry.settings.clone(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        user: &str,
        password: &str,
        _address: Option<SocketAddr>,
    ) -> Result<AuthenticatedUser> {
        let (name, entry) = self.lookup(user)?;
        if entry.password != password {
            return Err(NativeSrvError::AuthenticationFailed(format!(
                "{user}: Authentication failed: password is incorrect, or there is no user with such name"
            )));
        }
        Ok(Self::to_user(name, entry))
    }

    async fn verify_signature(
        &self,
        user: &str,
        challenge: &str,
        signature: &str,
    ) -> Result<AuthenticatedUser> {
        let (name, entry) = self.lookup(user)?;
        let Some(key) = &entry.signing_key else {
            return Err(NativeSrvError::AuthenticationFailed(format!(
                "{user}: no key configured for user"
            )));
        };
        if !verify_challenge(key, challenge, signature) {
            return Err(NativeSrvError::AuthenticationFailed(format!(
                "{user}: signature doesn't match"
            )));
        }
        Ok(Self::to_user(name, entry))
    }

    async fn user_for_interserver(&self, user: &str) -> Result<AuthenticatedUser> {
        // Queries forwarded by other servers may run as users only they know
        // about.
        match self.users.get_key_value(user) {
            Some((name, entry)) => Ok(Self::to_user(name, entry)),
            None => Ok(AuthenticatedUser::new(user)),
        }
    }
}

/// Random challenge sent to a client authenticating with a key.
pub fn generate_challenge() -> String {
    to_hex(&rand::random::<[u8; 32]>())
}

/// Sign a challenge with a key, as done by the client.
pub fn sign_challenge(key: &[u8], challenge: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    to_hex(hmac::sign(&key, challenge.as_bytes()).as_ref())
}

fn verify_challenge(key: &[u8], challenge: &str, signature: &str) -> bool {
    let Some(signature) = from_hex(signature) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, challenge.as_bytes(), &signature).is_ok()
}

/// Hash proving a query was sent by a server sharing the cluster secret.
///
/// `nonce` is the value the receiving server sent in its hello, and is
/// only mixed in from the second version of the scheme onwards.
pub fn interserver_hash(
    secret: &str,
    salt: &str,
    nonce: Option<u64>,
    query: &str,
    query_id: &str,
    initial_user: &str,
) -> Vec<u8> {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(salt.as_bytes());
    if let Some(nonce) = nonce {
        ctx.update(nonce.to_string().as_bytes());
    }
    ctx.update(secret.as_bytes());
    ctx.update(query.as_bytes());
    ctx.update(query_id.as_bytes());
    ctx.update(initial_user.as_bytes());
    ctx.finish().as_ref().to_vec()
}

fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push(DIGITS[(b >> 4) as usize] as char);
        s.push(DIGITS[(b & 0xf) as usize] as char);
    }
    s
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_passwords() {
        let auth = StaticAuthenticator::new()
            .with_user("alice", "secret")
            .with_default_database("alice", "analytics");

        let user = auth.authenticate("alice", "secret", None).await.unwrap();
        assert_eq!(Some("analytics".to_string()), user.default_database);

        let err = auth.authenticate("alice", "wrong", None).await.unwrap_err();
        assert!(matches!(err, NativeSrvError::AuthenticationFailed(_)));
        auth.authenticate("bob", "", None).await.unwrap_err();
    }

    #[tokio::test]
    async fn signed_challenge() {
        let auth = StaticAuthenticator::new()
            .with_user("alice", "")
            .with_signing_key("alice", b"key".to_vec());

        let challenge = generate_challenge();
        assert_eq!(64, challenge.len());

        let signature = sign_challenge(b"key", &challenge);
        auth.verify_signature("alice", &challenge, &signature)
            .await
            .unwrap();

        let bad = sign_challenge(b"other", &challenge);
        auth.verify_signature("alice", &challenge, &bad)
            .await
            .unwrap_err();
        auth.verify_signature("alice", &challenge, "zz")
            .await
            .unwrap_err();
    }

    #[test]
    fn interserver_hash_depends_on_nonce() {
        let v1 = interserver_hash("s", "salt", None, "SELECT 1", "q", "u");
        let v2 = interserver_hash("s", "salt", Some(7), "SELECT 1", "q", "u");
        assert_eq!(32, v1.len());
        assert_ne!(v1, v2);
        assert_eq!(v2, interserver_hash("s", "salt", Some(7), "SELECT 1", "q", "u"));
        assert_ne!(v2, interserver_hash("other", "salt", Some(7), "SELECT 1", "q", "u"));
    }

    #[test]
    fn hex_roundtrip() {
        assert_eq!("00ff10", to_hex(&[0, 255, 16]));
        assert_eq!(Some(vec![0, 255, 16]), from_hex("00ff10"));
        assert_eq!(None, from_hex("0"));
        assert_eq!(None, from_hex("zz"));
    }
}
