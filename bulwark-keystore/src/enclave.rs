//! The enclave: one policy table, one identity index, one key store
//! binding, one cache. Every authoritative operation lives here.

use bulwark_envelope::{Algorithm, Ciphertext, Context, SecretKey, KEY_LEN};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::audit::AuditLog;
use crate::cache::{CacheExpiry, KeyCache};
use crate::error::KesError;
use crate::identity::{Identity, IdentityIndex};
use crate::policy::{glob_match, Policy, PolicyInfo};
use crate::record::KeyRecord;
use crate::store::{valid_name, KeyStore, NameIter, StoreStatus};

/// Reserved backend namespace for mirrored policies. `#` is outside the
/// key-name alphabet, so no user key can collide with it.
const POLICY_PREFIX: &str = "#policy#";

/// Creation metadata of a stored key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Identity,
}

// ---------------------------------------------------------------------------
// Enclave
// ---------------------------------------------------------------------------

pub struct Enclave {
    name: String,
    admin: Identity,
    store: Arc<dyn KeyStore>,
    cache: Arc<KeyCache>,
    policies: RwLock<HashMap<String, Policy>>,
    identities: IdentityIndex,
    audit: AuditLog,
    persist_policies: bool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Enclave {
    pub fn new(
        name: impl Into<String>,
        admin: Identity,
        store: Arc<dyn KeyStore>,
        expiry: CacheExpiry,
    ) -> Self {
        Self {
            name: name.into(),
            admin,
            store,
            cache: Arc::new(KeyCache::new(expiry)),
            policies: RwLock::new(HashMap::new()),
            identities: IdentityIndex::new(),
            audit: AuditLog::new(),
            persist_policies: false,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Mirror policies into the backend under the reserved namespace.
    pub fn with_policy_persistence(mut self) -> Self {
        self.persist_policies = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn admin(&self) -> &Identity {
        &self.admin
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring the enclave online: load mirrored policies, pre-create the
    /// declared keys, start the cache sweeper.
    pub async fn start(&self, warm: &[String]) -> Result<(), KesError> {
        if self.persist_policies {
            self.load_persisted_policies().await?;
        }
        for name in warm {
            match self.create_key(name, &self.admin).await {
                Ok(()) => tracing::info!(key = %name, enclave = %self.name, "created declared key"),
                Err(KesError::KeyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let handle = Arc::clone(&self.cache).spawn_sweeper(self.store.clone());
        *self.sweeper.lock() = Some(handle);
        Ok(())
    }

    /// Take the enclave offline. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Backend reachability, for the status endpoint.
    pub async fn status(&self) -> StoreStatus {
        self.store.status().await
    }

    // -----------------------------------------------------------------------
    // Authorization
    // -----------------------------------------------------------------------

    /// The authorization gate. Never suspends.
    ///
    /// Admin bypasses policy evaluation; `unknown` is always denied; every
    /// failure is the same [`KesError::NotAuthorized`], so a caller cannot
    /// tell a denied path from a missing policy.
    pub fn verify_request(&self, identity: &Identity, path: &str) -> Result<(), KesError> {
        if identity.is_unknown() {
            return Err(KesError::NotAuthorized);
        }
        if *identity == self.admin {
            return Ok(());
        }
        let policy_name = self.identities.get(identity).ok_or(KesError::NotAuthorized)?;
        let policies = self.policies.read();
        let policy = policies.get(&policy_name).ok_or(KesError::NotAuthorized)?;
        policy.verify(path)
    }

    // -----------------------------------------------------------------------
    // Key operations
    // -----------------------------------------------------------------------

    /// Generate a fresh key and store it under `name`.
    pub async fn create_key(&self, name: &str, created_by: &Identity) -> Result<(), KesError> {
        check_name(name)?;
        let key = SecretKey::generate(Algorithm::native())?;
        let record = KeyRecord::new(&key, created_by.clone());
        self.store.create(name, record.to_vec()).await?;
        Ok(())
    }

    /// Store client-provided key material under `name`.
    pub async fn import_key(
        &self,
        name: &str,
        material: [u8; KEY_LEN],
        created_by: &Identity,
    ) -> Result<(), KesError> {
        check_name(name)?;
        let key = SecretKey::new(material, Algorithm::native());
        let record = KeyRecord::new(&key, created_by.clone());
        self.store.create(name, record.to_vec()).await?;
        Ok(())
    }

    /// Produce a fresh 32-byte data key: plaintext plus its sealed form.
    pub async fn generate_key(
        &self,
        name: &str,
        context: &Context,
    ) -> Result<(Vec<u8>, Ciphertext), KesError> {
        check_name(name)?;
        let key = self.cache.get(&self.store, name).await?;
        let mut plaintext = vec![0u8; KEY_LEN];
        getrandom::getrandom(&mut plaintext).map_err(|_| KesError::Crypto)?;
        let sealed = key.seal(&plaintext, context)?;
        Ok((plaintext, sealed))
    }

    pub async fn encrypt_key(
        &self,
        name: &str,
        plaintext: &[u8],
        context: &Context,
    ) -> Result<Ciphertext, KesError> {
        check_name(name)?;
        let key = self.cache.get(&self.store, name).await?;
        Ok(key.seal(plaintext, context)?)
    }

    pub async fn decrypt_key(
        &self,
        name: &str,
        sealed: &Ciphertext,
        context: &Context,
    ) -> Result<Vec<u8>, KesError> {
        check_name(name)?;
        let key = self.cache.get(&self.store, name).await?;
        Ok(key.open(sealed, context)?)
    }

    /// Delete `name` from the backend, then drop it from the cache. A
    /// failed backend delete leaves the cache entry intact.
    pub async fn delete_key(&self, name: &str) -> Result<(), KesError> {
        check_name(name)?;
        self.store.delete(name).await?;
        self.cache.evict(name);
        Ok(())
    }

    /// Creation metadata without touching the cache.
    pub async fn describe_key(&self, name: &str) -> Result<KeyInfo, KesError> {
        check_name(name)?;
        let blob = self.store.get(name).await?;
        let record = KeyRecord::from_slice(&blob)?;
        Ok(KeyInfo {
            name: name.to_string(),
            created_at: record.created_at,
            created_by: record.created_by,
        })
    }

    /// Names matching `pattern`, passed through from the backend iterator.
    /// Reserved entries are filtered out.
    pub async fn list_keys(&self, pattern: &str) -> Result<NameIter, KesError> {
        let mut iter = self.store.list().await?;
        let names: Vec<String> = iter
            .by_ref()
            .filter(|n| !n.starts_with('#') && glob_match(pattern, n))
            .collect();
        Ok(match iter.err().cloned() {
            Some(err) => NameIter::with_err(names, err),
            None => NameIter::new(names),
        })
    }

    // -----------------------------------------------------------------------
    // Policy operations
    // -----------------------------------------------------------------------

    pub fn get_policy(&self, name: &str) -> Result<Policy, KesError> {
        self.policies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KesError::PolicyNotFound(name.into()))
    }

    pub fn describe_policy(&self, name: &str) -> Result<PolicyInfo, KesError> {
        Ok(self.get_policy(name)?.info())
    }

    /// Install or replace `name`. Replacement drops the old record first,
    /// both in memory and in the mirror.
    pub async fn set_policy(&self, name: &str, policy: Policy) -> Result<(), KesError> {
        check_name(name)?;
        if self.persist_policies {
            let mirror = format!("{}{}", POLICY_PREFIX, name);
            let blob = serde_json::to_vec(&policy)
                .map_err(|e| KesError::Store(format!("encode policy: {}", e)))?;
            self.store.delete(&mirror).await?;
            self.store.create(&mirror, blob).await?;
        }
        self.policies.write().insert(name.to_string(), policy);
        Ok(())
    }

    /// Remove `name` and every identity bound to it.
    pub async fn delete_policy(&self, name: &str) -> Result<(), KesError> {
        check_name(name)?;
        if self.policies.write().remove(name).is_none() {
            return Err(KesError::PolicyNotFound(name.into()));
        }
        self.identities.forget_policy(name);
        if self.persist_policies {
            self.store
                .delete(&format!("{}{}", POLICY_PREFIX, name))
                .await?;
        }
        Ok(())
    }

    pub fn list_policies(&self, pattern: &str) -> Vec<(String, PolicyInfo)> {
        self.policies
            .read()
            .iter()
            .filter(|(name, _)| glob_match(pattern, name))
            .map(|(name, policy)| (name.clone(), policy.info()))
            .collect()
    }

    async fn load_persisted_policies(&self) -> Result<(), KesError> {
        let names: Vec<String> = self.store.list().await?.collect();
        for stored in names.iter().filter(|n| n.starts_with(POLICY_PREFIX)) {
            let name = &stored[POLICY_PREFIX.len()..];
            if self.policies.read().contains_key(name) {
                continue; // configured policies win over mirrored ones
            }
            let blob = self.store.get(stored).await?;
            match serde_json::from_slice::<Policy>(&blob) {
                Ok(policy) => {
                    self.policies.write().insert(name.to_string(), policy);
                }
                Err(e) => {
                    tracing::warn!(policy = %name, error = %e, "skipping corrupt mirrored policy")
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Identity operations
    // -----------------------------------------------------------------------

    /// Bind `identity` to `policy`. The policy must exist.
    pub fn assign_policy(&self, policy: &str, identity: Identity) -> Result<(), KesError> {
        if !self.policies.read().contains_key(policy) {
            return Err(KesError::PolicyNotFound(policy.into()));
        }
        self.identities.assign(policy, identity)
    }

    pub fn forget_identity(&self, identity: &Identity) {
        self.identities.forget(identity);
    }

    pub fn identity_policy(&self, identity: &Identity) -> Option<String> {
        self.identities.get(identity)
    }

    pub fn list_identities(&self, pattern: &str) -> Vec<Identity> {
        self.identities
            .list()
            .into_iter()
            .filter(|i| glob_match(pattern, i.as_str()))
            .collect()
    }
}

impl Drop for Enclave {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_name(name: &str) -> Result<(), KesError> {
    if valid_name(name) {
        Ok(())
    } else {
        Err(KesError::InvalidName(name.into()))
    }
}
