use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::info;

use marksync_core::{
    identity::{SessionToken, SubjectIdentity},
    ids::SubjectId,
};

use crate::error::SyncError;

/// Profile attributes the identity provider knows about a subject.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubjectProfile {
    pub email: Option<String>,
    pub full_name: Option<String>,
}

impl SubjectProfile {
    /// Text before the first space of the full name, else the local part of
    /// the email, else "User".
    pub fn display_name(&self) -> String {
        let from_name = self
            .full_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .and_then(|name| name.split(' ').next());
        let from_email = self
            .email
            .as_deref()
            .filter(|email| !email.is_empty())
            .and_then(|email| email.split('@').next());
        from_name.or(from_email).unwrap_or("User").to_string()
    }
}

/// An authenticated subject as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: SubjectId,
    pub token: SessionToken,
    pub profile: SubjectProfile,
    /// Bumped by every sign-in. A token refresh keeps it, so the engine can
    /// tell a refresh from a sign-out and sign-in it saw only the end of.
    pub generation: u64,
}

/// Identifies one activation of the engine for one subject. Results of
/// asynchronous work carry the epoch they were issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionEpoch(u64);

impl SessionEpoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source of the current subject and of session transitions.
pub trait SessionProvider: Send + Sync {
    fn current_subject(&self) -> Option<Subject>;

    /// Yields the new subject (or `None`) on every transition.
    fn watch(&self) -> watch::Receiver<Option<Subject>>;

    /// Called by the engine when the remote rejects the session outright.
    fn end_session(&self);
}

/// Watch-channel session provider that issues signed tokens.
pub struct SessionManager {
    tx: watch::Sender<Option<Subject>>,
    token_ttl_ms: u64,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(token_ttl_ms: u64) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            token_ttl_ms,
            generation: AtomicU64::new(0),
        }
    }

    pub fn sign_in(
        &self,
        identity: &SubjectIdentity,
        profile: SubjectProfile,
    ) -> Result<Subject, SyncError> {
        let token = SessionToken::issue(identity, self.token_ttl_ms)?;
        Ok(self.sign_in_with_token(token, profile))
    }

    /// Install an already-issued token, e.g. one that is expired or revoked.
    pub fn sign_in_with_token(&self, token: SessionToken, profile: SubjectProfile) -> Subject {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let subject = self.install(token, profile, generation);
        info!(subject = %subject.id, session = %subject.token.session_id, generation, "signed in");
        subject
    }

    /// Reissue the token for the current subject without ending the session.
    pub fn refresh(&self, identity: &SubjectIdentity) -> Result<Subject, SyncError> {
        let current = match self.current_subject() {
            Some(current) if current.id == identity.subject_id() => current,
            _ => return Err(SyncError::NoSession),
        };
        let token = SessionToken::issue(identity, self.token_ttl_ms)?;
        let subject = self.install(token, current.profile, current.generation);
        info!(subject = %subject.id, session = %subject.token.session_id, "token refreshed");
        Ok(subject)
    }

    fn install(&self, token: SessionToken, profile: SubjectProfile, generation: u64) -> Subject {
        let subject = Subject {
            id: token.subject,
            token,
            profile,
            generation,
        };
        self.tx.send_replace(Some(subject.clone()));
        subject
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.tx.send_replace(None) {
            info!(subject = %previous.id, "signed out");
        }
    }
}

impl SessionProvider for SessionManager {
    fn current_subject(&self) -> Option<Subject> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Subject>> {
        self.tx.subscribe()
    }

    fn end_session(&self) {
        self.sign_out();
    }
}
