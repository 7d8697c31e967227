//! # Bulwark Keystore
//!
//! Everything between the HTTP surface and the external key store:
//! policies, the identity index, the backend contract with its in-memory
//! and filesystem implementations, the dual-expiry plaintext cache, the
//! audit fan-out, and the [`Enclave`] that composes them.
//!
//! ## Quick Start
//!
//! ```ignore
//! use bulwark_envelope::Context;
//! use bulwark_keystore::*;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store: Arc<dyn KeyStore> = Arc::new(MemStore::new());
//! let admin = Identity::new("admin-digest").unwrap();
//! let enclave = Enclave::new("default", admin.clone(), store, CacheExpiry::default());
//!
//! enclave.create_key("my-key", &admin).await.unwrap();
//! let (plaintext, sealed) = enclave.generate_key("my-key", &Context::new()).await.unwrap();
//! let opened = enclave.decrypt_key("my-key", &sealed, &Context::new()).await.unwrap();
//! assert_eq!(opened, plaintext);
//! # });
//! ```

pub mod audit;
pub mod cache;
pub mod enclave;
pub mod error;
pub mod identity;
pub mod policy;
pub mod record;
pub mod store;

pub use audit::{AuditLog, AuditRecord, AuditRequest, AuditResponse, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use cache::{CacheExpiry, KeyCache};
pub use enclave::{Enclave, KeyInfo};
pub use error::{KesError, StoreError};
pub use identity::{Identity, IdentityIndex};
pub use policy::{glob_match, Policy, PolicyInfo};
pub use record::KeyRecord;
pub use store::{valid_name, FsStore, KeyStore, MemStore, NameIter, StoreState, StoreStatus};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_envelope::Context;
    use std::sync::Arc;

    fn admin() -> Identity {
        Identity::new("admin-digest").unwrap()
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn test_enclave() -> Enclave {
        let store: Arc<dyn KeyStore> = Arc::new(MemStore::new());
        Enclave::new("default", admin(), store, CacheExpiry::default())
    }

    fn ro_policy() -> Policy {
        Policy::new(
            vec!["/v1/key/decrypt/x*".into()],
            vec!["/v1/key/decrypt/x-secret".into()],
            admin(),
        )
        .unwrap()
    }

    // === Key lifecycle ===

    #[tokio::test]
    async fn create_generate_decrypt() {
        let enclave = test_enclave();
        enclave.create_key("k1", &admin()).await.unwrap();

        let ctx: Context = [("b", "1"), ("a", "2")].into_iter().collect();
        let (plaintext, sealed) = enclave.generate_key("k1", &ctx).await.unwrap();
        assert_eq!(plaintext.len(), 32);

        let reordered: Context = [("a", "2"), ("b", "1")].into_iter().collect();
        let opened = enclave.decrypt_key("k1", &sealed, &reordered).await.unwrap();
        assert_eq!(opened, plaintext);
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let enclave = test_enclave();
        enclave.create_key("k", &admin()).await.unwrap();
        assert!(matches!(
            enclave.create_key("k", &admin()).await,
            Err(KesError::KeyExists(_))
        ));
    }

    #[tokio::test]
    async fn import_roundtrip() {
        let enclave = test_enclave();
        enclave.import_key("imported", [7u8; 32], &admin()).await.unwrap();
        let sealed = enclave
            .encrypt_key("imported", b"data", &Context::new())
            .await
            .unwrap();
        let pt = enclave
            .decrypt_key("imported", &sealed, &Context::new())
            .await
            .unwrap();
        assert_eq!(pt, b"data");
    }

    #[tokio::test]
    async fn decrypt_with_wrong_context_fails() {
        let enclave = test_enclave();
        enclave.create_key("k", &admin()).await.unwrap();
        let ctx: Context = [("tenant", "a")].into_iter().collect();
        let sealed = enclave.encrypt_key("k", b"data", &ctx).await.unwrap();
        assert!(matches!(
            enclave.decrypt_key("k", &sealed, &Context::new()).await,
            Err(KesError::Decrypt)
        ));
    }

    #[tokio::test]
    async fn delete_then_decrypt_fails() {
        let enclave = test_enclave();
        enclave.create_key("k", &admin()).await.unwrap();
        let sealed = enclave.encrypt_key("k", b"x", &Context::new()).await.unwrap();
        enclave.delete_key("k").await.unwrap();
        assert!(matches!(
            enclave.decrypt_key("k", &sealed, &Context::new()).await,
            Err(KesError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let enclave = test_enclave();
        enclave.create_key("k", &admin()).await.unwrap();
        enclave.delete_key("k").await.unwrap();
        enclave.delete_key("k").await.unwrap();
    }

    #[tokio::test]
    async fn invalid_names_rejected_at_boundary() {
        let enclave = test_enclave();
        for bad in ["", "a/b", "a b", &"x".repeat(81)] {
            assert!(matches!(
                enclave.create_key(bad, &admin()).await,
                Err(KesError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn list_keys_filters_by_pattern() {
        let enclave = test_enclave();
        for name in ["app-one", "app-two", "other"] {
            enclave.create_key(name, &admin()).await.unwrap();
        }
        let mut names: Vec<_> = enclave.list_keys("app-*").await.unwrap().collect();
        names.sort();
        assert_eq!(names, vec!["app-one", "app-two"]);

        let all: Vec<_> = enclave.list_keys("*").await.unwrap().collect();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn describe_key_reports_creator() {
        let enclave = test_enclave();
        enclave.create_key("k", &admin()).await.unwrap();
        let info = enclave.describe_key("k").await.unwrap();
        assert_eq!(info.name, "k");
        assert_eq!(info.created_by, admin());
    }

    // === Authorization ===

    #[tokio::test]
    async fn admin_bypasses_policy() {
        let enclave = test_enclave();
        assert!(enclave.verify_request(&admin(), "/v1/key/delete/anything").is_ok());
    }

    #[tokio::test]
    async fn unknown_is_always_denied() {
        let enclave = test_enclave();
        assert!(matches!(
            enclave.verify_request(&Identity::unknown(), "/v1/status"),
            Err(KesError::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn policy_gates_requests() {
        let enclave = test_enclave();
        enclave.set_policy("ro", ro_policy()).await.unwrap();
        enclave.assign_policy("ro", id("client-1")).unwrap();

        assert!(enclave
            .verify_request(&id("client-1"), "/v1/key/decrypt/x-public")
            .is_ok());
        // Deny dominates allow.
        assert!(enclave
            .verify_request(&id("client-1"), "/v1/key/decrypt/x-secret")
            .is_err());
        // Outside the allow set.
        assert!(enclave
            .verify_request(&id("client-1"), "/v1/key/create/x-public")
            .is_err());
    }

    #[tokio::test]
    async fn unassigned_identity_is_denied() {
        let enclave = test_enclave();
        assert!(enclave
            .verify_request(&id("nobody"), "/v1/status")
            .is_err());
    }

    #[tokio::test]
    async fn deleting_policy_revokes_access() {
        let enclave = test_enclave();
        enclave.set_policy("ro", ro_policy()).await.unwrap();
        enclave.assign_policy("ro", id("client-1")).unwrap();
        enclave.delete_policy("ro").await.unwrap();
        assert!(enclave
            .verify_request(&id("client-1"), "/v1/key/decrypt/x-public")
            .is_err());
        assert!(enclave.identity_policy(&id("client-1")).is_none());
    }

    // === Policy table ===

    #[tokio::test]
    async fn policy_crud() {
        let enclave = test_enclave();
        enclave.set_policy("ro", ro_policy()).await.unwrap();

        let policy = enclave.get_policy("ro").unwrap();
        assert_eq!(policy.allow, vec!["/v1/key/decrypt/x*"]);

        let listed = enclave.list_policies("*");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "ro");

        enclave.delete_policy("ro").await.unwrap();
        assert!(matches!(
            enclave.get_policy("ro"),
            Err(KesError::PolicyNotFound(_))
        ));
        assert!(matches!(
            enclave.delete_policy("ro").await,
            Err(KesError::PolicyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn assign_requires_existing_policy() {
        let enclave = test_enclave();
        assert!(matches!(
            enclave.assign_policy("ghost", id("client-1")),
            Err(KesError::PolicyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn identities_listed_and_forgotten() {
        let enclave = test_enclave();
        enclave.set_policy("ro", ro_policy()).await.unwrap();
        enclave.assign_policy("ro", id("aa11")).unwrap();
        enclave.assign_policy("ro", id("bb22")).unwrap();

        let mut all = enclave.list_identities("*");
        all.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], id("aa11"));

        enclave.forget_identity(&id("aa11"));
        assert_eq!(enclave.list_identities("*").len(), 1);
    }

    // === Policy persistence ===

    #[tokio::test]
    async fn policies_survive_restart_when_mirrored() {
        let store: Arc<dyn KeyStore> = Arc::new(MemStore::new());

        let enclave = Enclave::new("default", admin(), store.clone(), CacheExpiry::default())
            .with_policy_persistence();
        enclave.set_policy("ro", ro_policy()).await.unwrap();
        enclave.stop();
        drop(enclave);

        let reborn = Enclave::new("default", admin(), store, CacheExpiry::default())
            .with_policy_persistence();
        reborn.start(&[]).await.unwrap();
        assert!(reborn.get_policy("ro").is_ok());
        reborn.stop();
    }

    #[tokio::test]
    async fn mirrored_policies_do_not_appear_as_keys() {
        let store: Arc<dyn KeyStore> = Arc::new(MemStore::new());
        let enclave = Enclave::new("default", admin(), store, CacheExpiry::default())
            .with_policy_persistence();
        enclave.set_policy("ro", ro_policy()).await.unwrap();
        enclave.create_key("real-key", &admin()).await.unwrap();

        let names: Vec<_> = enclave.list_keys("*").await.unwrap().collect();
        assert_eq!(names, vec!["real-key"]);
    }

    // === Startup warming ===

    #[tokio::test]
    async fn start_warms_declared_keys() {
        let enclave = test_enclave();
        enclave.create_key("preexisting", &admin()).await.unwrap();
        enclave
            .start(&["preexisting".into(), "fresh".into()])
            .await
            .unwrap();
        let mut names: Vec<_> = enclave.list_keys("*").await.unwrap().collect();
        names.sort();
        assert_eq!(names, vec!["fresh", "preexisting"]);
        enclave.stop();
    }
}
