//! Event admission rules: key, id, signature, timestamp, kind.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};

use crate::{
    error::ValidationError,
    event::{Disposition, Event},
};

/// Timestamp window accepted by the relay.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// Oldest accepted event age in seconds.
    pub max_age: u64,
    /// Seconds an event may be ahead of the relay clock.
    pub max_future_skew: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_age: 7 * 24 * 60 * 60,
            max_future_skew: 0,
        }
    }
}

impl Policy {
    /// Validate against the current wall clock.
    pub fn validate(&self, ev: &Event) -> Result<(), ValidationError> {
        self.validate_at(ev, unix_now())
    }

    /// Run every rule in order, stopping at the first failure.
    pub fn validate_at(&self, ev: &Event, now: u64) -> Result<(), ValidationError> {
        let pk = public_key(&ev.pubkey)?;
        let digest = verify_id(ev)?;
        verify_signature(&digest, &ev.sig, &pk)?;
        self.check_timestamp(ev.created_at, now)?;
        if ev.disposition() == Disposition::Unsupported {
            return Err(ValidationError::UnsupportedKind(ev.kind));
        }
        Ok(())
    }

    fn check_timestamp(&self, created_at: u64, now: u64) -> Result<(), ValidationError> {
        if created_at > now.saturating_add(self.max_future_skew) {
            return Err(ValidationError::FromFuture { created_at, now });
        }
        let horizon = now.saturating_sub(self.max_age);
        if created_at < horizon {
            return Err(ValidationError::TooOld {
                created_at,
                horizon,
            });
        }
        Ok(())
    }
}

/// Check id and signature only; used when re-verifying stored events.
pub fn verify_integrity(ev: &Event) -> Result<(), ValidationError> {
    let pk = public_key(&ev.pubkey)?;
    let digest = verify_id(ev)?;
    verify_signature(&digest, &ev.sig, &pk)
}

fn public_key(hex_key: &str) -> Result<XOnlyPublicKey, ValidationError> {
    let bytes = hex::decode(hex_key).map_err(ValidationError::PublicKeyEncoding)?;
    XOnlyPublicKey::from_slice(&bytes).map_err(ValidationError::PublicKey)
}

fn verify_id(ev: &Event) -> Result<[u8; 32], ValidationError> {
    let digest = ev.digest();
    let computed = hex::encode(digest);
    if computed != ev.id {
        return Err(ValidationError::IdMismatch {
            declared: ev.id.clone(),
            computed,
        });
    }
    Ok(digest)
}

fn verify_signature(
    digest: &[u8; 32],
    sig_hex: &str,
    pk: &XOnlyPublicKey,
) -> Result<(), ValidationError> {
    let raw = hex::decode(sig_hex).map_err(ValidationError::SignatureEncoding)?;
    let sig = Signature::from_slice(&raw).map_err(ValidationError::Signature)?;
    let msg = Message::from_digest_slice(digest).map_err(ValidationError::Signature)?;
    Secp256k1::verification_only()
        .verify_schnorr(&sig, &msg, pk)
        .map_err(ValidationError::Signature)
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
