use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use super::backend::Backend;
use super::model::SecretRecord;

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
/// nonce -> unix expiry
const CONSUMED_NONCES: TableDefinition<&str, i64> = TableDefinition::new("consumed_nonces");

/// Leading byte of every stored record, ahead of the bincode payload.
const RECORD_FORMAT_V1: u8 = 0x01;

/// redb-backed persistence. redb serialises write transactions, which is what
/// makes each conditional write below atomic.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(CONSUMED_NONCES)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Backend for RedbBackend {
    fn insert_new(&self, record: &SecretRecord) -> Result<bool> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(SECRETS)?;
            let taken = table.get(record.id.as_str())?.is_some();
            if !taken {
                table.insert(record.id.as_str(), bytes.as_slice())?;
            }
            !taken
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    fn load(&self, id: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|bytes| decode(&bytes)).transpose()
    }

    fn compare_and_swap(&self, id: &str, expected: u64, next: Option<&SecretRecord>) -> Result<bool> {
        let next_bytes = next.map(encode).transpose()?;

        let write_txn = self.db.begin_write()?;
        let swapped = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Clone the bytes out so the AccessGuard (which borrows `table`)
            // is dropped before any mutation.
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
            let current_revision = raw_bytes.map(|bytes| decode(&bytes)).transpose()?.map(|r| r.revision);

            if current_revision != Some(expected) {
                false
            } else {
                match &next_bytes {
                    Some(bytes) => {
                        table.insert(id, bytes.as_slice())?;
                    }
                    None => {
                        table.remove(id)?;
                    }
                }
                true
            }
        };
        write_txn.commit()?;
        Ok(swapped)
    }

    fn delete_expired(&self, now: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut secrets = write_txn.open_table(SECRETS)?;
            let mut expired = Vec::new();
            for item in secrets.iter()? {
                let (k, v) = item?;
                match decode(v.value()) {
                    Ok(record) if record.is_expired(now) => expired.push(k.value().to_owned()),
                    Ok(_) => {}
                    // Undecodable rows stay in place; the rest of the sweep proceeds.
                    Err(e) => warn!(id = k.value(), error = %e, "skipping undecodable secret record"),
                }
            }
            for id in &expired {
                secrets.remove(id.as_str())?;
            }

            let mut nonces = write_txn.open_table(CONSUMED_NONCES)?;
            let mut stale = Vec::new();
            for item in nonces.iter()? {
                let (k, v) = item?;
                if v.value() <= now {
                    stale.push(k.value().to_owned());
                }
            }
            for nonce in &stale {
                nonces.remove(nonce.as_str())?;
            }
            if !stale.is_empty() {
                debug!(count = stale.len(), "dropped expired nonce ledger entries");
            }

            expired.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn claim_nonce(&self, nonce: &str, expires_at: i64, now: i64) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let claimed = {
            let mut table = write_txn.open_table(CONSUMED_NONCES)?;
            let held_until: Option<i64> = table.get(nonce)?.map(|guard| guard.value());
            match held_until {
                Some(until) if until > now => false,
                _ => {
                    table.insert(nonce, expires_at)?;
                    true
                }
            }
        };
        write_txn.commit()?;
        Ok(claimed)
    }
}

/// `[RECORD_FORMAT_V1] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT_V1);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT_V1, payload)) => {
            let (record, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
                .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}
