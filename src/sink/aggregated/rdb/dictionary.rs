//! Name-to-id dictionaries backed by a storage table.
//!
//! Ids are cached per process. A miss inserts the name; when the insert
//! does not report the new id, or fails because another writer created the
//! name first, the whole table is reloaded and the name looked up again.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

use anyhow::{Context, Result};
use prometheus::Counter;
use thiserror::Error;
use tracing::debug;

/// Table access needed by a [`Dictionary`].
pub trait DictionaryStore<K> {
    /// Read every (key, id) pair in the table.
    fn load_all(&mut self) -> impl Future<Output = Result<Vec<(K, i64)>>> + Send;

    /// Insert a key. Returns the assigned id when the engine reports it.
    fn insert(&mut self, key: &K) -> impl Future<Output = Result<Option<i64>>> + Send;
}

/// Errors raised when a key cannot be resolved to an id.
#[derive(Error, Debug)]
pub enum DictionaryError {
    #[error("{dictionary} dictionary: {key} not found after insert and reload")]
    MissingAfterReload { dictionary: &'static str, key: String },
}

/// Cached mapping from keys to storage-assigned ids.
#[derive(Debug)]
pub struct Dictionary<K> {
    name: &'static str,
    ids: HashMap<K, i64>,
    reload_counter: Option<Counter>,
}

impl<K> Dictionary<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
{
    /// Creates an empty dictionary. `name` labels logs and errors.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ids: HashMap::new(),
            reload_counter: None,
        }
    }

    /// Count reloads on the given counter.
    pub fn with_reload_counter(mut self, counter: Counter) -> Self {
        self.reload_counter = Some(counter);
        self
    }

    /// Cached id of a key.
    pub fn get(&self, key: &K) -> Option<i64> {
        self.ids.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Replace the cache with the full table contents.
    pub async fn reload<S>(&mut self, store: &mut S) -> Result<()>
    where
        S: DictionaryStore<K> + Send,
    {
        let entries = store
            .load_all()
            .await
            .with_context(|| format!("loading {} dictionary", self.name))?;

        self.ids = entries.into_iter().collect();

        if let Some(counter) = &self.reload_counter {
            counter.inc();
        }
        debug!(dictionary = self.name, entries = self.ids.len(), "dictionary reloaded");

        Ok(())
    }

    /// Resolve a key to its id, creating it in storage if needed.
    ///
    /// Issues at most one insert and one reload per call.
    pub async fn get_or_create<S>(&mut self, store: &mut S, key: &K) -> Result<i64>
    where
        S: DictionaryStore<K> + Send,
    {
        if let Some(id) = self.get(key) {
            return Ok(id);
        }

        match store.insert(key).await {
            Ok(Some(id)) => {
                self.ids.insert(key.clone(), id);
                Ok(id)
            }
            Ok(None) => {
                self.reload(store).await?;
                self.get(key).ok_or_else(|| {
                    DictionaryError::MissingAfterReload {
                        dictionary: self.name,
                        key: format!("{key:?}"),
                    }
                    .into()
                })
            }
            Err(insert_err) => {
                debug!(
                    dictionary = self.name,
                    key = ?key,
                    error = %insert_err,
                    "dictionary insert failed, reloading",
                );
                self.reload(store).await?;
                match self.get(key) {
                    Some(id) => Ok(id),
                    None => Err(insert_err
                        .context(format!("inserting {key:?} into {} dictionary", self.name))),
                }
            }
        }
    }
}
