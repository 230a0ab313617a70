use anyhow::Result;

use super::model::SecretRecord;

/// Key-value persistence with conditional writes.
///
/// The store builds its whole state machine on these primitives, so every
/// implementation must make each call atomic with respect to the others.
pub trait Backend: Send + Sync {
    /// Insert `record` unless its id is taken. Returns false on collision.
    fn insert_new(&self, record: &SecretRecord) -> Result<bool>;

    /// Current stored record, including ones past their expiry.
    fn load(&self, id: &str) -> Result<Option<SecretRecord>>;

    /// Replace (`Some`) or delete (`None`) the record at `id`, only if the
    /// stored revision is still `expected`. Returns false when the record is
    /// gone or was modified in between.
    fn compare_and_swap(&self, id: &str, expected: u64, next: Option<&SecretRecord>) -> Result<bool>;

    /// Physically remove records and ledger entries that expired before `now`.
    /// Returns the number of secrets removed.
    fn delete_expired(&self, now: i64) -> Result<usize>;

    /// Record `nonce` as consumed until `expires_at`. Returns false if it is
    /// already held by an unexpired entry.
    fn claim_nonce(&self, nonce: &str, expires_at: i64, now: i64) -> Result<bool>;
}
