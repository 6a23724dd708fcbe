//! Encrypted per-job credential storage.
//!
//! Layout of the vault directory:
//!
//! ```text
//! <dir>/.keycheck          sealed constant proving which master key owns the vault
//! <dir>/<job>.creds.json   {"version": 1, "fields": {"<name>": "<base64 sealed value>"}}
//! ```
//!
//! Each field is sealed with the master key and bound to
//! `v<version>:<job>:<field>` as associated data, so a value copied into
//! another job's file or field fails authentication.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::{is_valid_job_key, VaultConfig};
use crate::crypto::{self, CryptoError, EncryptionKey};
use crate::store::write_atomic;

/// Credential file format version written by this build.
pub const CURRENT_VERSION: u32 = 1;

const KEYCHECK_FILE: &str = ".keycheck";
const KEYCHECK_PLAINTEXT: &[u8] = b"balance-sentry vault key check";
const KEYCHECK_AAD: &[u8] = b"keycheck";
const CREDS_SUFFIX: &str = ".creds.json";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid master key: {0}")]
    InvalidKey(String),
    #[error("corrupt credentials for `{job}`: {reason}")]
    CorruptCiphertext { job: String, reason: String },
    #[error("missing credentials for `{job}`: {reason}")]
    MissingCredentials { job: String, reason: String },
    #[error("encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("vault io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Serialize, Deserialize)]
struct CredentialFile {
    version: u32,
    fields: BTreeMap<String, String>,
}

/// Produce a new master key in the form accepted by [`CredentialVault::unlock`].
pub fn generate_master_key() -> Result<Zeroizing<String>, VaultError> {
    Ok(EncryptionKey::generate()?.to_encoded())
}

// ---------------------------------------------------------------------------
// CredentialVault
// ---------------------------------------------------------------------------

/// An unlocked vault. Holds the master key for the life of the process.
pub struct CredentialVault {
    dir: PathBuf,
    key: EncryptionKey,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Validate `master_key` against the vault in `config.dir`.
    ///
    /// A present key-check token must open with this key. Without one, any
    /// existing credential file is decrypted instead, and the token is written
    /// so later unlocks are checked directly.
    pub fn unlock(config: &VaultConfig, master_key: &str) -> Result<Self, VaultError> {
        let key = EncryptionKey::from_encoded(master_key)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        let vault = Self {
            dir: config.dir.clone(),
            key,
        };

        let keycheck = vault.dir.join(KEYCHECK_FILE);
        match std::fs::read_to_string(&keycheck) {
            Ok(encoded) => vault.verify_keycheck(&encoded)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                vault.check_existing_credentials()?;
                if let Err(e) = vault.write_keycheck(&keycheck) {
                    tracing::warn!(
                        dir = %vault.dir.display(),
                        error = %e,
                        "could not write vault key check"
                    );
                }
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(dir = %vault.dir.display(), "credential vault unlocked");
        Ok(vault)
    }

    fn verify_keycheck(&self, encoded: &str) -> Result<(), VaultError> {
        let sealed = STANDARD
            .decode(encoded.trim())
            .map_err(|_| VaultError::InvalidKey("key check token is malformed".into()))?;
        match crypto::decrypt(&self.key, &sealed, KEYCHECK_AAD) {
            Ok(plain) if plain.as_slice() == KEYCHECK_PLAINTEXT => Ok(()),
            _ => Err(VaultError::InvalidKey(
                "master key does not match this vault".into(),
            )),
        }
    }

    fn check_existing_credentials(&self) -> Result<(), VaultError> {
        let Some(job) = self.list()?.into_iter().next() else {
            return Ok(());
        };
        let file = self.read_file(&job)?;
        if let Some((field, value)) = file.fields.iter().next() {
            self.open_field(&job, file.version, field, value)
                .map_err(|_| VaultError::InvalidKey("master key does not match this vault".into()))?;
        }
        Ok(())
    }

    fn write_keycheck(&self, path: &Path) -> Result<(), VaultError> {
        let sealed = crypto::encrypt(&self.key, KEYCHECK_PLAINTEXT, KEYCHECK_AAD)?;
        write_atomic(path, STANDARD.encode(sealed).as_bytes(), Some(0o600))?;
        Ok(())
    }

    fn creds_path(&self, job: &str) -> PathBuf {
        self.dir.join(format!("{job}{CREDS_SUFFIX}"))
    }

    fn read_file(&self, job: &str) -> Result<CredentialFile, VaultError> {
        if !is_valid_job_key(job) {
            return Err(VaultError::MissingCredentials {
                job: job.into(),
                reason: "invalid job key".into(),
            });
        }
        let text = match std::fs::read_to_string(self.creds_path(job)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VaultError::MissingCredentials {
                    job: job.into(),
                    reason: "no credentials provisioned".into(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let file: CredentialFile =
            serde_json::from_str(&text).map_err(|e| VaultError::CorruptCiphertext {
                job: job.into(),
                reason: format!("unreadable credential file: {e}"),
            })?;
        if file.version != CURRENT_VERSION {
            return Err(VaultError::CorruptCiphertext {
                job: job.into(),
                reason: format!("unsupported version {}", file.version),
            });
        }
        Ok(file)
    }

    fn open_field(
        &self,
        job: &str,
        version: u32,
        field: &str,
        encoded: &str,
    ) -> Result<Zeroizing<String>, VaultError> {
        let corrupt = |reason: String| VaultError::CorruptCiphertext {
            job: job.into(),
            reason,
        };
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|_| corrupt(format!("field `{field}` is not base64")))?;
        let plain = crypto::decrypt(&self.key, &sealed, aad(version, job, field).as_bytes())
            .map_err(|_| corrupt(format!("field `{field}` failed authentication")))?;
        let text = std::str::from_utf8(&plain)
            .map_err(|_| corrupt(format!("field `{field}` is not UTF-8")))?;
        Ok(Zeroizing::new(text.to_owned()))
    }

    /// Decrypt the credentials for `job`. Every name in `required` must be
    /// present.
    pub fn retrieve(
        &self,
        job: &str,
        required: &[String],
    ) -> Result<DecryptedCredentialSet, VaultError> {
        let file = self.read_file(job)?;
        if let Some(missing) = required.iter().find(|f| !file.fields.contains_key(*f)) {
            return Err(VaultError::MissingCredentials {
                job: job.into(),
                reason: format!("field `{missing}` not provisioned"),
            });
        }

        let mut fields = BTreeMap::new();
        for (name, encoded) in &file.fields {
            let value = self.open_field(job, file.version, name, encoded)?;
            fields.insert(name.clone(), value);
        }
        tracing::debug!(job, fields = fields.len(), "credentials decrypted");
        Ok(DecryptedCredentialSet {
            job: job.into(),
            fields,
        })
    }

    /// Encrypt `fields` and replace the credential file for `job`.
    pub fn store(&self, job: &str, fields: &BTreeMap<String, String>) -> Result<(), VaultError> {
        if !is_valid_job_key(job) {
            return Err(VaultError::MissingCredentials {
                job: job.into(),
                reason: "invalid job key".into(),
            });
        }
        let mut sealed = BTreeMap::new();
        for (name, value) in fields {
            let ct = crypto::encrypt(
                &self.key,
                value.as_bytes(),
                aad(CURRENT_VERSION, job, name).as_bytes(),
            )?;
            sealed.insert(name.clone(), STANDARD.encode(ct));
        }
        let file = CredentialFile {
            version: CURRENT_VERSION,
            fields: sealed,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(io::Error::other)?;
        write_atomic(&self.creds_path(job), &json, Some(0o600))?;
        tracing::info!(job, fields = fields.len(), "credentials stored");
        Ok(())
    }

    /// Job keys with a credential file, sorted.
    pub fn list(&self) -> Result<Vec<String>, VaultError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut jobs = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(job) = name.to_str().and_then(|n| n.strip_suffix(CREDS_SUFFIX)) {
                if is_valid_job_key(job) {
                    jobs.push(job.to_string());
                }
            }
        }
        jobs.sort();
        Ok(jobs)
    }

    /// Field names provisioned for `job`, without decrypting anything.
    pub fn provisioned_fields(&self, job: &str) -> Result<Vec<String>, VaultError> {
        Ok(self.read_file(job)?.fields.into_keys().collect())
    }
}

fn aad(version: u32, job: &str, field: &str) -> String {
    format!("v{version}:{job}:{field}")
}

// ---------------------------------------------------------------------------
// DecryptedCredentialSet
// ---------------------------------------------------------------------------

/// Plaintext credentials for one job run.
///
/// Deliberately neither `Clone` nor `Serialize`. Values are zeroed when the
/// set is dropped or [`released`](Self::release).
pub struct DecryptedCredentialSet {
    job: String,
    fields: BTreeMap<String, Zeroizing<String>>,
}

impl DecryptedCredentialSet {
    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// JSON object of field to value, for handing to a child process.
    pub fn to_json(&self) -> Zeroizing<String> {
        let map: BTreeMap<&str, &str> = self
            .fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        // A map of strings always serializes.
        Zeroizing::new(serde_json::to_string(&map).unwrap_or_default())
    }

    /// Drop the set, zeroing every value.
    pub fn release(self) {
        tracing::trace!(job = %self.job, "credentials released");
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn from_pairs(job: &str, pairs: &[(&str, &str)]) -> Self {
        Self {
            job: job.into(),
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Zeroizing::new(v.to_string())))
                .collect(),
        }
    }
}

impl fmt::Debug for DecryptedCredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedCredentialSet")
            .field("job", &self.job)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
