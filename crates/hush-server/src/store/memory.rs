use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use super::backend::Backend;
use super::model::SecretRecord;

#[derive(Default)]
struct Tables {
    secrets: HashMap<String, SecretRecord>,
    nonces: HashMap<String, i64>,
}

/// Process-local backend. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory backend lock poisoned"))
    }
}

impl Backend for MemoryBackend {
    fn insert_new(&self, record: &SecretRecord) -> Result<bool> {
        let mut tables = self.lock()?;
        if tables.secrets.contains_key(&record.id) {
            return Ok(false);
        }
        tables.secrets.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    fn load(&self, id: &str) -> Result<Option<SecretRecord>> {
        Ok(self.lock()?.secrets.get(id).cloned())
    }

    fn compare_and_swap(&self, id: &str, expected: u64, next: Option<&SecretRecord>) -> Result<bool> {
        let mut tables = self.lock()?;
        match tables.secrets.get(id) {
            Some(current) if current.revision == expected => {}
            _ => return Ok(false),
        }
        match next {
            Some(record) => {
                tables.secrets.insert(id.to_owned(), record.clone());
            }
            None => {
                tables.secrets.remove(id);
            }
        }
        Ok(true)
    }

    fn delete_expired(&self, now: i64) -> Result<usize> {
        let mut tables = self.lock()?;
        let before = tables.secrets.len();
        tables.secrets.retain(|_, record| !record.is_expired(now));
        tables.nonces.retain(|_, expires_at| *expires_at > now);
        Ok(before - tables.secrets.len())
    }

    fn claim_nonce(&self, nonce: &str, expires_at: i64, now: i64) -> Result<bool> {
        let mut tables = self.lock()?;
        if let Some(held_until) = tables.nonces.get(nonce) {
            if *held_until > now {
                return Ok(false);
            }
        }
        tables.nonces.insert(nonce.to_owned(), expires_at);
        Ok(true)
    }
}
