use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::types::{IdentityId, KeyScope};

const KEY_LEN: usize = 32; // 256 bits
const NONCE_LEN: usize = 12; // 96 bits

const SELF_INFO: &[u8] = b"reach-store/self-sealed/v1";
const WRAP_INFO: &[u8] = b"reach-store/invite-wrap/v1";

/// Key management errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("No cluster key installed")]
    NoClusterKey,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key store is corrupt: {0}")]
    Corrupt(String),

    #[error("Key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key store lock poisoned")]
    LockPoisoned,
}

/// How a blob's bytes are protected at rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    #[default]
    None,
    SelfSealed,
    SharedInvite,
    Cluster,
}

/// A per-blob content key sealed for one invitee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    pub ephemeral_public: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Encryption metadata stored alongside the manifest; binary fields are hex
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetadata {
    pub mode: EncryptionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_public: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wrapped_keys: BTreeMap<IdentityId, WrappedKey>,
}

impl EncryptionMetadata {
    pub fn cleartext() -> Self {
        Self::default()
    }

    pub fn is_encrypted(&self) -> bool {
        self.mode != EncryptionMode::None
    }
}

/// Information about the cluster key that can be exported (no secret material)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterKeyInfo {
    pub key_id: String,
    pub members: BTreeSet<IdentityId>,
}

struct ClusterKey {
    info: ClusterKeyInfo,
    key: [u8; KEY_LEN],
}

#[derive(Default)]
struct KeyState {
    identities: HashMap<IdentityId, StaticSecret>,
    directory: HashMap<IdentityId, PublicKey>,
    cluster: Option<ClusterKey>,
    /// Bumped on every change; orders snapshots written outside the lock
    generation: u64,
}

/// The key store as of one generation, ready to write
struct Snapshot {
    generation: u64,
    file: KeyFile,
}

/// On-disk shape of the key store
#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyFile {
    #[serde(default)]
    identities: BTreeMap<IdentityId, String>,
    #[serde(default)]
    directory: BTreeMap<IdentityId, String>,
    #[serde(default)]
    cluster: Option<StoredClusterKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredClusterKey {
    key_id: String,
    key: String,
    members: BTreeSet<IdentityId>,
}

/// Derives and holds key material for each protection scope.
///
/// Identity secrets held here are the ones this node is custodian for; the
/// public directory covers every identity content may be addressed to.
pub struct KeyManager {
    state: RwLock<KeyState>,
    key_path: Option<PathBuf>,
    /// Generation last written to disk
    persisted: Mutex<u64>,
}

impl KeyManager {
    /// A key manager that never touches disk
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(KeyState::default()),
            key_path: None,
            persisted: Mutex::new(0),
        }
    }

    /// Load the key store at `path`, creating an empty one when absent.
    /// A file that exists but cannot be parsed is reported as corruption.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = std::fs::read(&path)?;
            let file: KeyFile =
                serde_json::from_slice(&raw).map_err(|e| KeyError::Corrupt(e.to_string()))?;
            Self::state_from_file(file)?
        } else {
            KeyState::default()
        };

        info!(
            "Loaded key store at {:?} ({} local identities)",
            path,
            state.identities.len()
        );

        Ok(Self {
            state: RwLock::new(state),
            key_path: Some(path),
            persisted: Mutex::new(0),
        })
    }

    fn state_from_file(file: KeyFile) -> Result<KeyState, KeyError> {
        let mut state = KeyState::default();
        for (id, secret_hex) in file.identities {
            let secret = StaticSecret::from(decode_key(&secret_hex)?);
            state.directory.insert(id.clone(), PublicKey::from(&secret));
            state.identities.insert(id, secret);
        }
        for (id, public_hex) in file.directory {
            state
                .directory
                .entry(id)
                .or_insert(PublicKey::from(decode_key(&public_hex)?));
        }
        if let Some(stored) = file.cluster {
            state.cluster = Some(ClusterKey {
                info: ClusterKeyInfo {
                    key_id: stored.key_id,
                    members: stored.members,
                },
                key: decode_key(&stored.key)?,
            });
        }
        Ok(state)
    }

    /// Capture the state after a change. Called with the write lock held.
    fn snapshot(&self, state: &mut KeyState) -> Option<Snapshot> {
        state.generation += 1;
        self.key_path.as_ref()?;
        let file = KeyFile {
            identities: state
                .identities
                .iter()
                .map(|(id, secret)| (id.clone(), hex::encode(secret.to_bytes())))
                .collect(),
            directory: state
                .directory
                .iter()
                .map(|(id, public)| (id.clone(), hex::encode(public.as_bytes())))
                .collect(),
            cluster: state.cluster.as_ref().map(|c| StoredClusterKey {
                key_id: c.info.key_id.clone(),
                key: hex::encode(c.key),
                members: c.info.members.clone(),
            }),
        };
        Some(Snapshot {
            generation: state.generation,
            file,
        })
    }

    /// Write a snapshot once the state lock is released. A snapshot older
    /// than the one already on disk is dropped.
    fn persist(&self, snapshot: Option<Snapshot>) -> Result<(), KeyError> {
        let (Some(path), Some(snapshot)) = (&self.key_path, snapshot) else {
            return Ok(());
        };

        let mut persisted = self.persisted.lock().map_err(|_| KeyError::LockPoisoned)?;
        if snapshot.generation <= *persisted {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&snapshot.file)
            .map_err(|e| KeyError::Corrupt(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        *persisted = snapshot.generation;
        Ok(())
    }

    /// Create a key pair for an identity this node is custodian for
    pub fn generate_identity(&self, id: &str) -> Result<PublicKey, KeyError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let snapshot = {
            let mut state = self.state.write().map_err(|_| KeyError::LockPoisoned)?;
            state.identities.insert(id.to_string(), secret);
            state.directory.insert(id.to_string(), public);
            self.snapshot(&mut state)
        };
        self.persist(snapshot)?;
        debug!("Generated key pair for identity {}", id);
        Ok(public)
    }

    /// Public key of `id`, generating a key pair when the identity is unknown
    pub fn ensure_identity(&self, id: &str) -> Result<PublicKey, KeyError> {
        match self.public_key(id)? {
            Some(public) => Ok(public),
            None => self.generate_identity(id),
        }
    }

    /// Record the public key of an identity held elsewhere
    pub fn register_identity(&self, id: &str, public: PublicKey) -> Result<(), KeyError> {
        let snapshot = {
            let mut state = self.state.write().map_err(|_| KeyError::LockPoisoned)?;
            state.directory.insert(id.to_string(), public);
            self.snapshot(&mut state)
        };
        self.persist(snapshot)
    }

    pub fn public_key(&self, id: &str) -> Result<Option<PublicKey>, KeyError> {
        let state = self.state.read().map_err(|_| KeyError::LockPoisoned)?;
        Ok(state.directory.get(id).copied())
    }

    pub fn holds_identity(&self, id: &str) -> Result<bool, KeyError> {
        let state = self.state.read().map_err(|_| KeyError::LockPoisoned)?;
        Ok(state.identities.contains_key(id))
    }

    /// Generate a fresh cluster key shared by `members`, replacing any existing one
    pub fn generate_cluster_key(
        &self,
        members: impl IntoIterator<Item = IdentityId>,
    ) -> Result<ClusterKeyInfo, KeyError> {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        let mut id_bytes = [0u8; 8];
        OsRng.fill_bytes(&mut id_bytes);
        let info = ClusterKeyInfo {
            key_id: format!("cluster-{}", hex::encode(id_bytes)),
            members: members.into_iter().collect(),
        };
        self.install_cluster_key(info.clone(), key)?;
        Ok(info)
    }

    /// Install a cluster key received from another cluster member
    pub fn install_cluster_key(&self, info: ClusterKeyInfo, key: [u8; 32]) -> Result<(), KeyError> {
        info!(
            "Installed cluster key {} for {} members",
            info.key_id,
            info.members.len()
        );
        let snapshot = {
            let mut state = self.state.write().map_err(|_| KeyError::LockPoisoned)?;
            state.cluster = Some(ClusterKey { info, key });
            self.snapshot(&mut state)
        };
        self.persist(snapshot)
    }

    pub fn add_cluster_member(&self, id: &str) -> Result<(), KeyError> {
        self.enrol_cluster_members([id.to_string()]).map(|_| ())
    }

    /// Add every identity not yet a cluster member, persisting once.
    /// Returns how many were added. Membership only grows; dropping a member
    /// means generating a new key.
    pub fn enrol_cluster_members(
        &self,
        ids: impl IntoIterator<Item = IdentityId>,
    ) -> Result<usize, KeyError> {
        let (added, snapshot) = {
            let mut state = self.state.write().map_err(|_| KeyError::LockPoisoned)?;
            let cluster = state.cluster.as_mut().ok_or(KeyError::NoClusterKey)?;
            let added = ids
                .into_iter()
                .filter(|id| cluster.info.members.insert(id.clone()))
                .count();
            if added == 0 {
                return Ok(0);
            }
            (added, self.snapshot(&mut state))
        };
        self.persist(snapshot)?;
        Ok(added)
    }

    pub fn is_cluster_member(&self, id: &str) -> Result<bool, KeyError> {
        let state = self.state.read().map_err(|_| KeyError::LockPoisoned)?;
        Ok(state
            .cluster
            .as_ref()
            .map(|c| c.info.members.contains(id))
            .unwrap_or(false))
    }

    pub fn cluster_info(&self) -> Result<Option<ClusterKeyInfo>, KeyError> {
        let state = self.state.read().map_err(|_| KeyError::LockPoisoned)?;
        Ok(state.cluster.as_ref().map(|c| c.info.clone()))
    }

    /// Protect `plaintext` under the key family for `scope`.
    ///
    /// `beneficiary` is the sole reader of self-sealed content; `recipients`
    /// receive a wrapped copy of a shared-invite content key.
    pub fn encrypt_for(
        &self,
        scope: KeyScope,
        beneficiary: &str,
        recipients: &BTreeSet<IdentityId>,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, EncryptionMetadata), KeyError> {
        let state = self.state.read().map_err(|_| KeyError::LockPoisoned)?;
        match scope {
            KeyScope::Cleartext => Ok((plaintext.to_vec(), EncryptionMetadata::cleartext())),
            KeyScope::Beneficiary => {
                let recipient = state
                    .directory
                    .get(beneficiary)
                    .ok_or_else(|| KeyError::UnknownIdentity(beneficiary.to_string()))?;
                let ephemeral = EphemeralSecret::random_from_rng(OsRng);
                let ephemeral_public = PublicKey::from(&ephemeral);
                let shared = ephemeral.diffie_hellman(recipient);
                let key = derive_key(shared.as_bytes(), SELF_INFO)?;
                let (nonce, ciphertext) = seal(&key, plaintext)?;
                Ok((
                    ciphertext,
                    EncryptionMetadata {
                        mode: EncryptionMode::SelfSealed,
                        key_ref: Some(beneficiary.to_string()),
                        nonce: Some(hex::encode(nonce)),
                        ephemeral_public: Some(hex::encode(ephemeral_public.as_bytes())),
                        wrapped_keys: BTreeMap::new(),
                    },
                ))
            }
            KeyScope::SharedInvite => {
                let mut content_key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut content_key);
                let (nonce, ciphertext) = seal(&content_key, plaintext)?;

                let mut wrapped_keys = BTreeMap::new();
                for id in recipients {
                    let recipient = state
                        .directory
                        .get(id)
                        .ok_or_else(|| KeyError::UnknownIdentity(id.clone()))?;
                    wrapped_keys.insert(id.clone(), wrap_key(recipient, &content_key)?);
                }

                let mut key_id = [0u8; 8];
                OsRng.fill_bytes(&mut key_id);
                Ok((
                    ciphertext,
                    EncryptionMetadata {
                        mode: EncryptionMode::SharedInvite,
                        key_ref: Some(format!("invite-{}", hex::encode(key_id))),
                        nonce: Some(hex::encode(nonce)),
                        ephemeral_public: None,
                        wrapped_keys,
                    },
                ))
            }
            KeyScope::Cluster => {
                let cluster = state.cluster.as_ref().ok_or(KeyError::NoClusterKey)?;
                let (nonce, ciphertext) = seal(&cluster.key, plaintext)?;
                Ok((
                    ciphertext,
                    EncryptionMetadata {
                        mode: EncryptionMode::Cluster,
                        key_ref: Some(cluster.info.key_id.clone()),
                        nonce: Some(hex::encode(nonce)),
                        ephemeral_public: None,
                        wrapped_keys: BTreeMap::new(),
                    },
                ))
            }
        }
    }

    /// Recover plaintext on behalf of `requester`. Fails with `KeyUnavailable`
    /// when the requester cannot derive, or was never given, the key.
    pub fn decrypt_for(
        &self,
        requester: Option<&str>,
        metadata: &EncryptionMetadata,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        if metadata.mode == EncryptionMode::None {
            return Ok(ciphertext.to_vec());
        }

        let requester = requester
            .ok_or_else(|| KeyError::KeyUnavailable("anonymous requester".to_string()))?;
        let state = self.state.read().map_err(|_| KeyError::LockPoisoned)?;
        let nonce = decode_nonce(metadata.nonce.as_deref())?;

        let key = match metadata.mode {
            EncryptionMode::None => return Ok(ciphertext.to_vec()),
            EncryptionMode::SelfSealed => {
                if metadata.key_ref.as_deref() != Some(requester) {
                    return Err(KeyError::KeyUnavailable(format!(
                        "{} is not the beneficiary",
                        requester
                    )));
                }
                let secret = state.identities.get(requester).ok_or_else(|| {
                    KeyError::KeyUnavailable(format!("no secret held for {}", requester))
                })?;
                let ephemeral = metadata
                    .ephemeral_public
                    .as_deref()
                    .ok_or_else(|| KeyError::Decryption("missing ephemeral key".to_string()))?;
                let shared = secret.diffie_hellman(&PublicKey::from(decode_key(ephemeral)?));
                derive_key(shared.as_bytes(), SELF_INFO)?
            }
            EncryptionMode::SharedInvite => {
                let wrapped = metadata.wrapped_keys.get(requester).ok_or_else(|| {
                    KeyError::KeyUnavailable(format!("no key wrapped for {}", requester))
                })?;
                let secret = state.identities.get(requester).ok_or_else(|| {
                    KeyError::KeyUnavailable(format!("no secret held for {}", requester))
                })?;
                unwrap_key(secret, wrapped)?
            }
            EncryptionMode::Cluster => {
                let cluster = state
                    .cluster
                    .as_ref()
                    .ok_or_else(|| KeyError::KeyUnavailable("no cluster key".to_string()))?;
                if metadata.key_ref.as_deref() != Some(cluster.info.key_id.as_str()) {
                    return Err(KeyError::KeyUnavailable(
                        "cluster key has been replaced".to_string(),
                    ));
                }
                if !cluster.info.members.contains(requester) {
                    return Err(KeyError::KeyUnavailable(format!(
                        "{} is not a cluster member",
                        requester
                    )));
                }
                cluster.key
            }
        };

        open(&key, &nonce, ciphertext)
    }
}

fn derive_key(shared: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], KeyError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info, &mut okm)
        .map_err(|_| KeyError::Encryption("key derivation failed".to_string()))?;
    Ok(okm)
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), KeyError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| KeyError::Encryption("invalid key".to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| KeyError::Encryption("AES-GCM seal failed".to_string()))?;
    Ok((nonce, ciphertext))
}

fn open(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| KeyError::Decryption("invalid key".to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KeyError::Decryption("authentication failed".to_string()))
}

fn wrap_key(recipient: &PublicKey, content_key: &[u8; KEY_LEN]) -> Result<WrappedKey, KeyError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let kek = derive_key(ephemeral.diffie_hellman(recipient).as_bytes(), WRAP_INFO)?;
    let (nonce, ciphertext) = seal(&kek, content_key)?;
    Ok(WrappedKey {
        ephemeral_public: hex::encode(ephemeral_public.as_bytes()),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    })
}

fn unwrap_key(secret: &StaticSecret, wrapped: &WrappedKey) -> Result<[u8; KEY_LEN], KeyError> {
    let ephemeral = PublicKey::from(decode_key(&wrapped.ephemeral_public)?);
    let kek = derive_key(secret.diffie_hellman(&ephemeral).as_bytes(), WRAP_INFO)?;
    let nonce = decode_nonce(Some(&wrapped.nonce))?;
    let sealed =
        hex::decode(&wrapped.ciphertext).map_err(|e| KeyError::Decryption(e.to_string()))?;
    let raw = open(&kek, &nonce, &sealed)?;
    raw.try_into()
        .map_err(|_| KeyError::Decryption("wrapped key has wrong length".to_string()))
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let raw = hex::decode(encoded).map_err(|e| KeyError::Corrupt(e.to_string()))?;
    raw.try_into()
        .map_err(|_| KeyError::Corrupt("key material has wrong length".to_string()))
}

fn decode_nonce(encoded: Option<&str>) -> Result<[u8; NONCE_LEN], KeyError> {
    let encoded = encoded.ok_or_else(|| KeyError::Decryption("missing nonce".to_string()))?;
    let raw = hex::decode(encoded).map_err(|e| KeyError::Decryption(e.to_string()))?;
    raw.try_into()
        .map_err(|_| KeyError::Decryption("nonce has wrong length".to_string()))
}
