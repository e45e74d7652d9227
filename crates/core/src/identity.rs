use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hlc::physical_now;
use crate::ids::{SessionId, Signature, SubjectId};

/// The signing identity of a subject. The public half is its `SubjectId`.
pub struct SubjectIdentity {
    signing_key: ed25519_dalek::SigningKey,
}

impl SubjectIdentity {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut rng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn subject_id(&self) -> SubjectId {
        SubjectId::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature::from_bytes(sig.to_bytes())
    }
}

pub fn verify_signature(
    subject: &SubjectId,
    message: &[u8],
    signature: &Signature,
) -> Result<(), CoreError> {
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(subject.as_bytes())
        .map_err(|_| CoreError::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    verifying_key
        .verify(message, &sig)
        .map_err(|_| CoreError::InvalidSignature)
}

/// Bearer credential presented with every remote call. Self-signed by the
/// subject, bounded in time, and revocable by `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub session_id: SessionId,
    pub subject: SubjectId,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    pub signature: Signature,
}

impl SessionToken {
    fn signing_bytes(
        session_id: &SessionId,
        subject: &SubjectId,
        issued_at_ms: u64,
        expires_at_ms: u64,
    ) -> Result<Vec<u8>, CoreError> {
        let fields = (
            session_id.as_bytes(),
            subject.as_bytes(),
            issued_at_ms,
            expires_at_ms,
        );
        rmp_serde::to_vec(&fields).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn issue(identity: &SubjectIdentity, ttl_ms: u64) -> Result<Self, CoreError> {
        let issued_at_ms = physical_now()?;
        Self::issue_at(identity, issued_at_ms, issued_at_ms.saturating_add(ttl_ms))
    }

    pub fn issue_at(
        identity: &SubjectIdentity,
        issued_at_ms: u64,
        expires_at_ms: u64,
    ) -> Result<Self, CoreError> {
        let session_id = SessionId::new();
        let subject = identity.subject_id();
        let bytes = Self::signing_bytes(&session_id, &subject, issued_at_ms, expires_at_ms)?;
        Ok(Self {
            session_id,
            subject,
            issued_at_ms,
            expires_at_ms,
            signature: identity.sign(&bytes),
        })
    }

    /// Check signature and expiry against `now_ms`.
    pub fn verify(&self, now_ms: u64) -> Result<(), CoreError> {
        let bytes = Self::signing_bytes(
            &self.session_id,
            &self.subject,
            self.issued_at_ms,
            self.expires_at_ms,
        )?;
        verify_signature(&self.subject, &bytes, &self.signature)?;
        if now_ms >= self.expires_at_ms {
            return Err(CoreError::TokenExpired {
                expired_at_ms: self.expires_at_ms,
            });
        }
        Ok(())
    }
}
