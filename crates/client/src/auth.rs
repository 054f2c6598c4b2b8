//! Client credentials.
//!
//! The login flow itself lives outside this crate; it hands a bearer token to
//! [`AuthSession::login`]. Everything that needs the token reads the current
//! [`Credentials`] from the session's watch channel.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub authenticated: bool,
    pub token: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            token: Some(token.into()),
        }
    }

    /// The access token, if present and non-blank.
    pub fn access_token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Shared, observable login state (cheap to Clone).
#[derive(Clone)]
pub struct AuthSession {
    tx: Arc<watch::Sender<Credentials>>,
}

impl AuthSession {
    pub fn new(credentials: Credentials) -> Self {
        let (tx, _rx) = watch::channel(credentials);
        Self { tx: Arc::new(tx) }
    }

    pub fn anonymous() -> Self {
        Self::new(Credentials::default())
    }

    pub fn login(&self, token: impl Into<String>) {
        self.tx.send_replace(Credentials::bearer(token));
        info!(component = "auth", event = "auth.login");
    }

    pub fn logout(&self) {
        self.tx.send_replace(Credentials::default());
        info!(component = "auth", event = "auth.logout");
    }

    pub fn current(&self) -> Credentials {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Credentials> {
        self.tx.subscribe()
    }
}

/// Read a token file, ignoring surrounding whitespace. Missing or blank files
/// yield `None`.
pub fn token_from_file(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_token_is_not_an_access_token() {
        assert_eq!(Credentials::bearer("  ").access_token(), None);
        assert_eq!(Credentials::bearer("t").access_token(), Some("t"));
        assert_eq!(Credentials::default().access_token(), None);
    }

    #[test]
    fn login_and_logout_are_observable() {
        let session = AuthSession::anonymous();
        let rx = session.subscribe();

        session.login("token-1");
        assert_eq!(rx.borrow().access_token(), Some("token-1"));
        assert!(rx.borrow().authenticated);

        session.logout();
        assert_eq!(*rx.borrow(), Credentials::default());
    }

    #[test]
    fn token_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth-token");
        assert_eq!(token_from_file(&path), None);

        std::fs::write(&path, "  abc123\n").unwrap();
        assert_eq!(token_from_file(&path).as_deref(), Some("abc123"));

        std::fs::write(&path, "\n").unwrap();
        assert_eq!(token_from_file(&path), None);
    }
}
