//! Session token source.
//!
//! The client never obtains or refreshes credentials itself. It reads the
//! current token once per connect attempt from whatever store the host
//! application keeps.

use std::sync::{Arc, RwLock};

/// Synchronous getter for the current session token.
pub trait TokenSource: Send + Sync {
    /// Returns the current token, if any.
    fn current_token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn current_token(&self) -> Option<String> {
        self()
    }
}

/// Anonymous connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

impl TokenSource for NoToken {
    fn current_token(&self) -> Option<String> {
        None
    }
}

/// A token fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Creates a source that always returns `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }
}

impl TokenSource for StaticToken {
    fn current_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// A token slot the host application updates on login and logout.
#[derive(Debug, Clone, Default)]
pub struct SharedToken(Arc<RwLock<Option<String>>>);

impl SharedToken {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the token. Takes effect on the next connect.
    pub fn set(&self, token: Option<String>) {
        match self.0.write() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

impl TokenSource for SharedToken {
    fn current_token(&self) -> Option<String> {
        match self.0.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Returns the token to send as a subprotocol: present and not blank.
#[must_use]
pub fn usable_token(source: &dyn TokenSource) -> Option<String> {
    source
        .current_token()
        .filter(|token| !token.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_token() {
        assert_eq!(NoToken.current_token(), None);
        assert_eq!(usable_token(&NoToken), None);
    }

    #[test]
    fn test_static_token() {
        let source = StaticToken::new("abc");
        assert_eq!(usable_token(&source), Some("abc".to_string()));
    }

    #[test]
    fn test_blank_token_is_anonymous() {
        assert_eq!(usable_token(&StaticToken::new("   ")), None);
        assert_eq!(usable_token(&StaticToken::new("")), None);
    }

    #[test]
    fn test_closure_source() {
        let source = || Some("from-store".to_string());
        assert_eq!(usable_token(&source), Some("from-store".to_string()));
    }

    #[test]
    fn test_shared_token_updates() {
        let token = SharedToken::new();
        assert_eq!(token.current_token(), None);
        token.set(Some("t1".to_string()));
        assert_eq!(token.current_token(), Some("t1".to_string()));
        token.set(None);
        assert_eq!(usable_token(&token), None);
    }
}
