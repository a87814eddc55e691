//! Persistent player data: accounts, bans, warps and opaque key/value blobs.
//!
//! Backends are plain synchronous types behind [`StorageBackend`]. The relay
//! never calls them directly; it goes through [`StorageHandle`], which owns the
//! backend on a dedicated thread and answers each request over a oneshot
//! channel, so a slow disk never stalls the event loop.

use log::{debug, error};
use serde::{Deserialize, Serialize};
use shared::Vector3;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

pub type AccountId = u64;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage is unavailable")]
    Unavailable,

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),
}

/// What a successful login learns about the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub id: AccountId,
    pub last_name: String,
    pub rank: String,
    pub last_ip: String,
}

pub trait StorageBackend: Send + 'static {
    /// Returns the account if `password` matches.
    fn get_account(
        &self,
        id: AccountId,
        password: &str,
    ) -> Result<Option<AccountInfo>, StorageError>;

    fn register_account(
        &mut self,
        name: &str,
        password: &str,
        ip: &str,
    ) -> Result<AccountId, StorageError>;

    fn record_login(&mut self, id: AccountId, name: &str, ip: &str) -> Result<(), StorageError>;

    fn set_rank(&mut self, id: AccountId, rank: &str) -> Result<(), StorageError>;

    fn add_online_seconds(&mut self, id: AccountId, seconds: u64) -> Result<(), StorageError>;

    fn is_banned(&self, ip: &str) -> Result<bool, StorageError>;

    fn ban_ip(&mut self, ip: &str, reason: &str) -> Result<(), StorageError>;

    /// Returns whether a ban was removed.
    fn unban_ip(&mut self, ip: &str) -> Result<bool, StorageError>;

    fn load_value(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn save_value(&mut self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    fn set_warp(&mut self, name: &str, pos: Vector3) -> Result<(), StorageError>;

    fn get_warp(&self, name: &str) -> Result<Option<Vector3>, StorageError>;

    fn list_warps(&self) -> Result<Vec<String>, StorageError>;

    /// Returns whether a warp was removed.
    fn delete_warp(&mut self, name: &str) -> Result<bool, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    name: String,
    salt: String,
    password_hash: String,
    rank: String,
    last_ip: String,
    online_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StorageData {
    next_account_id: AccountId,
    accounts: BTreeMap<AccountId, Account>,
    /// IP address to ban reason.
    bans: BTreeMap<String, String>,
    values: BTreeMap<String, Vec<u8>>,
    warps: BTreeMap<String, Vector3>,
}

fn new_salt() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hash_password(salt: &str, password: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize()
}

fn password_matches(account: &Account, password: &str) -> bool {
    match blake3::Hash::from_hex(&account.password_hash) {
        Ok(stored) => stored == hash_password(&account.salt, password),
        Err(_) => false,
    }
}

/// Keeps everything in memory; lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: StorageData,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn account_mut(&mut self, id: AccountId) -> Result<&mut Account, StorageError> {
        self.data
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("account {id}")))
    }
}

impl StorageBackend for MemoryStorage {
    fn get_account(
        &self,
        id: AccountId,
        password: &str,
    ) -> Result<Option<AccountInfo>, StorageError> {
        let Some(account) = self.data.accounts.get(&id) else {
            return Ok(None);
        };
        if !password_matches(account, password) {
            return Ok(None);
        }
        Ok(Some(AccountInfo {
            id,
            last_name: account.name.clone(),
            rank: account.rank.clone(),
            last_ip: account.last_ip.clone(),
        }))
    }

    fn register_account(
        &mut self,
        name: &str,
        password: &str,
        ip: &str,
    ) -> Result<AccountId, StorageError> {
        self.data.next_account_id += 1;
        let id = self.data.next_account_id;
        let salt = new_salt();
        let password_hash = hash_password(&salt, password).to_hex().to_string();
        self.data.accounts.insert(
            id,
            Account {
                name: name.to_lowercase(),
                salt,
                password_hash,
                rank: "default".to_string(),
                last_ip: ip.to_string(),
                online_seconds: 0,
            },
        );
        Ok(id)
    }

    fn record_login(&mut self, id: AccountId, name: &str, ip: &str) -> Result<(), StorageError> {
        let account = self.account_mut(id)?;
        account.name = name.to_lowercase();
        account.last_ip = ip.to_string();
        Ok(())
    }

    fn set_rank(&mut self, id: AccountId, rank: &str) -> Result<(), StorageError> {
        self.account_mut(id)?.rank = rank.to_lowercase();
        Ok(())
    }

    fn add_online_seconds(&mut self, id: AccountId, seconds: u64) -> Result<(), StorageError> {
        let account = self.account_mut(id)?;
        account.online_seconds = account.online_seconds.saturating_add(seconds);
        Ok(())
    }

    fn is_banned(&self, ip: &str) -> Result<bool, StorageError> {
        Ok(self.data.bans.contains_key(ip))
    }

    fn ban_ip(&mut self, ip: &str, reason: &str) -> Result<(), StorageError> {
        self.data.bans.insert(ip.to_string(), reason.to_string());
        Ok(())
    }

    fn unban_ip(&mut self, ip: &str) -> Result<bool, StorageError> {
        Ok(self.data.bans.remove(ip).is_some())
    }

    fn load_value(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.values.get(key).cloned())
    }

    fn save_value(&mut self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.data.values.insert(key.to_string(), value);
        Ok(())
    }

    fn set_warp(&mut self, name: &str, pos: Vector3) -> Result<(), StorageError> {
        self.data.warps.insert(name.to_lowercase(), pos);
        Ok(())
    }

    fn get_warp(&self, name: &str) -> Result<Option<Vector3>, StorageError> {
        Ok(self.data.warps.get(&name.to_lowercase()).copied())
    }

    fn list_warps(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.warps.keys().cloned().collect())
    }

    fn delete_warp(&mut self, name: &str) -> Result<bool, StorageError> {
        Ok(self.data.warps.remove(&name.to_lowercase()).is_some())
    }
}

/// [`MemoryStorage`] snapshotted to a JSON file after every mutation.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    memory: MemoryStorage,
}

impl JsonFileStorage {
    /// Opens `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StorageData::default(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened storage at {}", path.display());
        Ok(Self {
            path,
            memory: MemoryStorage { data },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&self.memory.data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Applies `op` and writes the file; a failed write rolls memory back.
    fn mutate<R>(
        &mut self,
        op: impl FnOnce(&mut MemoryStorage) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let snapshot = self.memory.data.clone();
        let result = op(&mut self.memory)?;
        if let Err(e) = self.persist() {
            error!("Could not write {}: {}", self.path.display(), e);
            self.memory.data = snapshot;
            return Err(e);
        }
        Ok(result)
    }
}

impl StorageBackend for JsonFileStorage {
    fn get_account(
        &self,
        id: AccountId,
        password: &str,
    ) -> Result<Option<AccountInfo>, StorageError> {
        self.memory.get_account(id, password)
    }

    fn register_account(
        &mut self,
        name: &str,
        password: &str,
        ip: &str,
    ) -> Result<AccountId, StorageError> {
        self.mutate(|m| m.register_account(name, password, ip))
    }

    fn record_login(&mut self, id: AccountId, name: &str, ip: &str) -> Result<(), StorageError> {
        self.mutate(|m| m.record_login(id, name, ip))
    }

    fn set_rank(&mut self, id: AccountId, rank: &str) -> Result<(), StorageError> {
        self.mutate(|m| m.set_rank(id, rank))
    }

    fn add_online_seconds(&mut self, id: AccountId, seconds: u64) -> Result<(), StorageError> {
        self.mutate(|m| m.add_online_seconds(id, seconds))
    }

    fn is_banned(&self, ip: &str) -> Result<bool, StorageError> {
        self.memory.is_banned(ip)
    }

    fn ban_ip(&mut self, ip: &str, reason: &str) -> Result<(), StorageError> {
        self.mutate(|m| m.ban_ip(ip, reason))
    }

    fn unban_ip(&mut self, ip: &str) -> Result<bool, StorageError> {
        self.mutate(|m| m.unban_ip(ip))
    }

    fn load_value(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.memory.load_value(key)
    }

    fn save_value(&mut self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.mutate(|m| m.save_value(key, value))
    }

    fn set_warp(&mut self, name: &str, pos: Vector3) -> Result<(), StorageError> {
        self.mutate(|m| m.set_warp(name, pos))
    }

    fn get_warp(&self, name: &str) -> Result<Option<Vector3>, StorageError> {
        self.memory.get_warp(name)
    }

    fn list_warps(&self) -> Result<Vec<String>, StorageError> {
        self.memory.list_warps()
    }

    fn delete_warp(&mut self, name: &str) -> Result<bool, StorageError> {
        self.mutate(|m| m.delete_warp(name))
    }
}

type Job = Box<dyn FnOnce(&mut dyn StorageBackend) + Send>;

/// Cloneable async front end to a storage backend running on its own thread.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl StorageHandle {
    /// Moves `backend` onto a dedicated thread. Backend calls may block on
    /// disk, so they stay off the runtime's workers.
    pub fn spawn(backend: impl StorageBackend) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let spawned = std::thread::Builder::new()
            .name("storage".to_string())
            .spawn(move || {
                let mut backend = backend;
                while let Some(job) = rx.blocking_recv() {
                    job(&mut backend);
                }
                debug!("Storage thread stopped");
            });
        if let Err(e) = spawned {
            error!("Could not start storage thread: {}", e);
        }
        Self { tx }
    }

    async fn call<R, F>(&self, op: F) -> Result<R, StorageError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn StorageBackend) -> Result<R, StorageError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |backend: &mut dyn StorageBackend| {
            let _ = reply_tx.send(op(backend));
        });
        self.tx.send(job).map_err(|_| StorageError::Unavailable)?;
        reply_rx.await.map_err(|_| StorageError::Unavailable)?
    }

    /// Fails closed: any storage error counts as banned.
    pub async fn is_banned(&self, ip: IpAddr) -> bool {
        let key = ip.to_string();
        match self.call(move |s| s.is_banned(&key)).await {
            Ok(banned) => banned,
            Err(e) => {
                error!("Ban lookup for {} failed, refusing: {}", ip, e);
                true
            }
        }
    }

    pub async fn get_account(
        &self,
        id: AccountId,
        password: String,
    ) -> Result<Option<AccountInfo>, StorageError> {
        self.call(move |s| s.get_account(id, &password)).await
    }

    pub async fn register_account(
        &self,
        name: String,
        password: String,
        ip: String,
    ) -> Result<AccountId, StorageError> {
        self.call(move |s| s.register_account(&name, &password, &ip))
            .await
    }

    pub async fn record_login(
        &self,
        id: AccountId,
        name: String,
        ip: String,
    ) -> Result<(), StorageError> {
        self.call(move |s| s.record_login(id, &name, &ip)).await
    }

    pub async fn set_rank(&self, id: AccountId, rank: String) -> Result<(), StorageError> {
        self.call(move |s| s.set_rank(id, &rank)).await
    }

    pub async fn add_online_seconds(
        &self,
        id: AccountId,
        seconds: u64,
    ) -> Result<(), StorageError> {
        self.call(move |s| s.add_online_seconds(id, seconds)).await
    }

    pub async fn ban_ip(&self, ip: IpAddr, reason: String) -> Result<(), StorageError> {
        let key = ip.to_string();
        self.call(move |s| s.ban_ip(&key, &reason)).await
    }

    pub async fn unban_ip(&self, ip: IpAddr) -> Result<bool, StorageError> {
        let key = ip.to_string();
        self.call(move |s| s.unban_ip(&key)).await
    }

    /// Lookup failures degrade to "no value".
    pub async fn load_value(&self, key: &str) -> Option<Vec<u8>> {
        let owned = key.to_string();
        match self.call(move |s| s.load_value(&owned)).await {
            Ok(value) => value,
            Err(e) => {
                error!("Loading {:?} failed: {}", key, e);
                None
            }
        }
    }

    pub async fn save_value(&self, key: String, value: Vec<u8>) -> Result<(), StorageError> {
        self.call(move |s| s.save_value(&key, value)).await
    }

    pub async fn set_warp(&self, name: String, pos: Vector3) -> Result<(), StorageError> {
        self.call(move |s| s.set_warp(&name, pos)).await
    }

    pub async fn get_warp(&self, name: String) -> Result<Option<Vector3>, StorageError> {
        self.call(move |s| s.get_warp(&name)).await
    }

    pub async fn list_warps(&self) -> Result<Vec<String>, StorageError> {
        self.call(|s| s.list_warps()).await
    }

    pub async fn delete_warp(&self, name: String) -> Result<bool, StorageError> {
        self.call(move |s| s.delete_warp(&name)).await
    }
}
