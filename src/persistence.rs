//! Account and character storage.
//!
//! The game thread reads and writes records through [`Persistence`]. Saving
//! to disk is split in two: [`Persistence::flush_job`] serializes on the game
//! thread, and the returned [`FlushJob`] does the file I/O on a worker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::{Deadline, WorkError, WorkResult};
use crate::config::Point;
use crate::world::{AdminLevel, Appearance, CharacterId, ItemStack};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("account {0} already exists")]
    AccountExists(String),

    #[error("account {0} does not exist")]
    NoSuchAccount(String),

    #[error("character name {0} is taken")]
    NameTaken(String),

    #[error("character {0} does not exist")]
    NoSuchCharacter(CharacterId),

    #[error("failed to encode store: {0}")]
    Encode(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub real_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub email: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub id: u32,
    pub account: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub admin: AdminLevel,
    #[serde(default)]
    pub appearance: Appearance,
    pub position: Point,
    pub level: u8,
    #[serde(default)]
    pub exp: u64,
    #[serde(default)]
    pub tier: u8,
    pub hp: u16,
    pub max_hp: u16,
    #[serde(default)]
    pub inventory: Vec<ItemStack>,
}

/// Storage the game thread talks to.
pub trait Persistence {
    fn account(&self, username: &str) -> Option<&AccountRecord>;

    fn create_account(&mut self, record: AccountRecord) -> Result<(), PersistError>;

    fn set_password(&mut self, username: &str, password_hash: String) -> Result<(), PersistError>;

    fn characters_of(&self, account: &str) -> Vec<&CharacterRecord>;

    fn character(&self, id: CharacterId) -> Option<&CharacterRecord>;

    fn character_by_name(&self, name: &str) -> Option<&CharacterRecord>;

    /// Create a level 1 character and assign it a fresh id.
    fn create_character(
        &mut self,
        account: &str,
        name: &str,
        appearance: Appearance,
        start: Point,
    ) -> Result<CharacterRecord, PersistError>;

    fn save_character(&mut self, record: CharacterRecord) -> Result<(), PersistError>;

    /// Snapshot pending changes for writing. `None` when there is nothing to write.
    fn flush_job(&mut self) -> Result<Option<FlushJob>, PersistError>;
}

/// A serialized snapshot waiting to be written.
#[derive(Debug, Clone)]
pub struct FlushJob {
    path: PathBuf,
    contents: String,
}

impl FlushJob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write through a temporary file so a crash never leaves a torn store.
    pub fn write(self, deadline: Deadline) -> WorkResult<usize> {
        deadline.check()?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &self.contents)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| WorkError::Failed(format!("{}: {}", self.path.display(), e)))?;
        Ok(self.contents.len())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    next_character_id: u32,
    #[serde(default)]
    accounts: BTreeMap<String, AccountRecord>,
    #[serde(default)]
    characters: BTreeMap<u32, CharacterRecord>,
}

/// In-process store, optionally backed by a YAML file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Snapshot,
    path: Option<PathBuf>,
    dirty: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path` if it exists; later flushes write back to it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse store: {}", path.display()))?
        } else {
            Snapshot::default()
        };
        tracing::info!(
            "[store] loaded {} accounts, {} characters from {}",
            data.accounts.len(),
            data.characters.len(),
            path.display()
        );
        Ok(Self {
            data,
            path: Some(path),
            dirty: false,
        })
    }

    pub fn account_count(&self) -> usize {
        self.data.accounts.len()
    }

    pub fn character_count(&self) -> usize {
        self.data.characters.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Persistence for MemoryStore {
    fn account(&self, username: &str) -> Option<&AccountRecord> {
        self.data.accounts.get(&username.to_ascii_lowercase())
    }

    fn create_account(&mut self, record: AccountRecord) -> Result<(), PersistError> {
        let key = record.username.to_ascii_lowercase();
        if self.data.accounts.contains_key(&key) {
            return Err(PersistError::AccountExists(record.username));
        }
        self.data.accounts.insert(key, record);
        self.dirty = true;
        Ok(())
    }

    fn set_password(&mut self, username: &str, password_hash: String) -> Result<(), PersistError> {
        let account = self
            .data
            .accounts
            .get_mut(&username.to_ascii_lowercase())
            .ok_or_else(|| PersistError::NoSuchAccount(username.to_string()))?;
        account.password_hash = password_hash;
        self.dirty = true;
        Ok(())
    }

    fn characters_of(&self, account: &str) -> Vec<&CharacterRecord> {
        self.data
            .characters
            .values()
            .filter(|c| c.account.eq_ignore_ascii_case(account))
            .collect()
    }

    fn character(&self, id: CharacterId) -> Option<&CharacterRecord> {
        self.data.characters.get(&id.0)
    }

    fn character_by_name(&self, name: &str) -> Option<&CharacterRecord> {
        self.data
            .characters
            .values()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn create_character(
        &mut self,
        account: &str,
        name: &str,
        appearance: Appearance,
        start: Point,
    ) -> Result<CharacterRecord, PersistError> {
        if self.account(account).is_none() {
            return Err(PersistError::NoSuchAccount(account.to_string()));
        }
        if self.character_by_name(name).is_some() {
            return Err(PersistError::NameTaken(name.to_string()));
        }

        self.data.next_character_id = self.data.next_character_id.wrapping_add(1).max(1);
        let record = CharacterRecord {
            id: self.data.next_character_id,
            account: account.to_string(),
            name: name.to_string(),
            title: String::new(),
            admin: AdminLevel::Player,
            appearance,
            position: start,
            level: 1,
            exp: 0,
            tier: 0,
            hp: 10,
            max_hp: 10,
            inventory: Vec::new(),
        };
        self.data.characters.insert(record.id, record.clone());
        self.dirty = true;
        Ok(record)
    }

    fn save_character(&mut self, record: CharacterRecord) -> Result<(), PersistError> {
        let slot = self
            .data
            .characters
            .get_mut(&record.id)
            .ok_or(PersistError::NoSuchCharacter(CharacterId(record.id)))?;
        *slot = record;
        self.dirty = true;
        Ok(())
    }

    fn flush_job(&mut self) -> Result<Option<FlushJob>, PersistError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !self.dirty {
            return Ok(None);
        }
        let contents = serde_yaml::to_string(&self.data)?;
        self.dirty = false;
        Ok(Some(FlushJob {
            path: path.clone(),
            contents,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn account(name: &str) -> AccountRecord {
        AccountRecord {
            username: name.to_string(),
            password_hash: "hash".to_string(),
            real_name: String::new(),
            location: String::new(),
            email: String::new(),
            created: Utc::now(),
        }
    }

    #[test]
    fn test_accounts_are_case_insensitive() {
        let mut store = MemoryStore::new();
        store.create_account(account("Alice")).unwrap();
        assert!(store.account("alice").is_some());
        assert!(matches!(
            store.create_account(account("ALICE")),
            Err(PersistError::AccountExists(_))
        ));

        store.set_password("aLiCe", "new".to_string()).unwrap();
        assert_eq!(store.account("alice").unwrap().password_hash, "new");
        assert!(matches!(
            store.set_password("bob", String::new()),
            Err(PersistError::NoSuchAccount(_))
        ));
    }

    #[test]
    fn test_create_character_assigns_ids() {
        let mut store = MemoryStore::new();
        store.create_account(account("alice")).unwrap();

        let first = store
            .create_character("alice", "Hero", Appearance::default(), Point::new(1, 5, 5))
            .unwrap();
        let second = store
            .create_character("alice", "Sidekick", Appearance::default(), Point::new(1, 5, 5))
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.level, 1);
        assert_eq!(store.characters_of("ALICE").len(), 2);

        assert!(matches!(
            store.create_character("alice", "hero", Appearance::default(), Point::default()),
            Err(PersistError::NameTaken(_))
        ));
        assert!(matches!(
            store.create_character("nobody", "Other", Appearance::default(), Point::default()),
            Err(PersistError::NoSuchAccount(_))
        ));
    }

    #[test]
    fn test_save_character_replaces_record() {
        let mut store = MemoryStore::new();
        store.create_account(account("alice")).unwrap();
        let mut record = store
            .create_character("alice", "Hero", Appearance::default(), Point::default())
            .unwrap();

        record.inventory.push(ItemStack::new(1, 100));
        record.level = 7;
        store.save_character(record.clone()).unwrap();
        assert_eq!(store.character(CharacterId(record.id)), Some(&record));

        record.id = 99;
        assert!(matches!(
            store.save_character(record),
            Err(PersistError::NoSuchCharacter(CharacterId(99)))
        ));
    }

    #[test]
    fn test_flush_without_path_is_noop() {
        let mut store = MemoryStore::new();
        store.create_account(account("alice")).unwrap();
        assert!(store.flush_job().unwrap().is_none());
    }

    #[test]
    fn test_flush_writes_and_reloads() {
        let path = std::env::temp_dir().join(format!("ember-store-{}.yaml", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut store = MemoryStore::open(&path).unwrap();
        store.create_account(account("alice")).unwrap();
        store
            .create_character("alice", "Hero", Appearance::default(), Point::new(2, 3, 4))
            .unwrap();
        assert!(store.is_dirty());

        let job = store.flush_job().unwrap().unwrap();
        assert!(!store.is_dirty());
        assert!(store.flush_job().unwrap().is_none());
        assert!(job.write(Deadline::after(Duration::from_secs(5))).unwrap() > 0);

        let reloaded = MemoryStore::open(&path).unwrap();
        assert_eq!(reloaded.account_count(), 1);
        assert_eq!(reloaded.character_by_name("hero").unwrap().position, Point::new(2, 3, 4));

        // Ids keep counting after a reload.
        let mut reloaded = reloaded;
        let next = reloaded
            .create_character("alice", "Second", Appearance::default(), Point::default())
            .unwrap();
        assert_eq!(next.id, 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_expired_flush_is_not_written() {
        let path = std::env::temp_dir().join(format!("ember-expired-{}.yaml", std::process::id()));
        let job = FlushJob {
            path: path.clone(),
            contents: "x".to_string(),
        };
        let deadline = Deadline::after(Duration::ZERO);
        assert_eq!(job.write(deadline), Err(WorkError::Timeout));
        assert!(!path.exists());
    }
}
