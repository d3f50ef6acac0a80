//! Cryptographic primitives (spec §1 "out of scope... invoked as black-box
//! operations"): secret sharing, pairwise-mask key agreement, SignDS, and
//! attestation-signature verification. This crate defines the interface the
//! round kernels (§4.G "cipher rounds") call through; real implementations are
//! supplied by the binding that wires a production `CipherModule`.
//!
//! Grounded on the external-collaborator boundary in spec.md §1 and the
//! `PASSED/FAILED/TIMEOUT` outcome shape in §4.H.

/// Outcome of verifying one piece of cipher-round input (spec §4.G: "on
/// invalidity the kernel returns `RequestError` with the cipher's reason string").
pub type CipherCheck = Result<(), String>;

/// Outcome of attestation-signature verification (spec §4.H):
/// unknown `fl_id` ⇒ `Timeout`; bad signature ⇒ `Failed`; otherwise `Passed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationResult {
    Passed,
    Failed,
    Timeout,
}

/// Black-box cipher operations a production binding supplies. All methods take
/// already-parsed request fields; wire parsing stays in the round kernels.
pub trait CipherModule: Clone + Send + Sync + 'static {
    /// Validates a client-submitted Diffie-Hellman prime (`exchangeKeys`).
    fn verify_dh_prime(&self, prime: &[u8]) -> CipherCheck;

    /// Validates one client's secret share (`shareSecrets`).
    fn verify_share(&self, fl_id: &str, share: &[u8]) -> CipherCheck;

    /// Validates the set of shares submitted for reconstruction
    /// (`reconstructSecrets`), given the configured threshold.
    fn verify_reconstruct(&self, shares: &[(String, Vec<u8>)], threshold: u64) -> CipherCheck;

    /// Validates a SignDS list-signature submission (`pushListSign`).
    fn verify_list_sign(&self, fl_id: &str, signature: &[u8]) -> CipherCheck;

    /// Attestation-signature check (spec §4.H):
    /// `hash = SHA256(fl_id ∥ timestamp ∥ iteration)`, `RSA_VERIFY(pubkey, hash, signature)`,
    /// plus a replay-window check on `|now - timestamp| < replay_attack_time_diff`.
    /// `now_ms` and `replay_window_ms` are passed in so the kernel's clock and
    /// hyper-params stay the single source of truth for both.
    fn verify_attestation(
        &self,
        fl_id: &str,
        timestamp_ms: u64,
        iteration: u64,
        signature: &[u8],
        now_ms: u64,
        replay_window_ms: u64,
    ) -> AttestationResult;
}

/// Deterministic stand-in used by scenario tests (spec §8: "deterministic given
/// mock transports"): every check passes except for attestations from `fl_id`s
/// explicitly marked unknown or signatures explicitly marked bad.
#[derive(Debug, Clone, Default)]
pub struct PermissiveCipherModule {
    unknown_clients: std::sync::Arc<parking_lot::Mutex<std::collections::HashSet<String>>>,
    bad_signatures: std::sync::Arc<parking_lot::Mutex<std::collections::HashSet<String>>>,
}

impl PermissiveCipherModule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unknown_client(&self, fl_id: impl Into<String>) {
        self.unknown_clients.lock().insert(fl_id.into());
    }

    pub fn mark_bad_signature(&self, fl_id: impl Into<String>) {
        self.bad_signatures.lock().insert(fl_id.into());
    }
}

impl CipherModule for PermissiveCipherModule {
    fn verify_dh_prime(&self, prime: &[u8]) -> CipherCheck {
        if prime.is_empty() {
            return Err("empty dh prime".to_string());
        }
        Ok(())
    }

    fn verify_share(&self, _fl_id: &str, share: &[u8]) -> CipherCheck {
        if share.is_empty() {
            return Err("empty secret share".to_string());
        }
        Ok(())
    }

    fn verify_reconstruct(&self, shares: &[(String, Vec<u8>)], threshold: u64) -> CipherCheck {
        if (shares.len() as u64) < threshold {
            return Err(format!("only {} of {threshold} required shares present", shares.len()));
        }
        Ok(())
    }

    fn verify_list_sign(&self, _fl_id: &str, signature: &[u8]) -> CipherCheck {
        if signature.is_empty() {
            return Err("empty list signature".to_string());
        }
        Ok(())
    }

    fn verify_attestation(
        &self,
        fl_id: &str,
        timestamp_ms: u64,
        _iteration: u64,
        _signature: &[u8],
        now_ms: u64,
        replay_window_ms: u64,
    ) -> AttestationResult {
        if self.unknown_clients.lock().contains(fl_id) {
            return AttestationResult::Timeout;
        }
        if self.bad_signatures.lock().contains(fl_id) {
            return AttestationResult::Failed;
        }
        let skew = now_ms.abs_diff(timestamp_ms);
        if skew >= replay_window_ms {
            return AttestationResult::Failed;
        }
        AttestationResult::Passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_client_times_out() {
        let cipher = PermissiveCipherModule::new();
        cipher.mark_unknown_client("ghost");
        let result = cipher.verify_attestation("ghost", 1000, 1, b"sig", 1000, 5000);
        assert_eq!(result, AttestationResult::Timeout);
    }

    #[test]
    fn stale_timestamp_fails_replay_window() {
        let cipher = PermissiveCipherModule::new();
        let result = cipher.verify_attestation("c1", 0, 1, b"sig", 10_000, 5_000);
        assert_eq!(result, AttestationResult::Failed);
    }

    #[test]
    fn fresh_known_client_passes() {
        let cipher = PermissiveCipherModule::new();
        let result = cipher.verify_attestation("c1", 1_000, 1, b"sig", 1_200, 5_000);
        assert_eq!(result, AttestationResult::Passed);
    }

    #[test]
    fn reconstruct_requires_threshold_shares() {
        let cipher = PermissiveCipherModule::new();
        let shares = vec![("a".to_string(), vec![1u8]), ("b".to_string(), vec![2u8])];
        assert!(cipher.verify_reconstruct(&shares, 3).is_err());
        assert!(cipher.verify_reconstruct(&shares, 2).is_ok());
    }
}
