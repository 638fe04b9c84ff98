//! The registry of long-term identity keys a process is willing to trust.
//!
//! A [`KeyRegistry`] has two phases. While *open*, keys may be registered.
//! The first lookup, membership check, or digest *freezes* it; after that
//! registration fails forever and reads take no lock.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use thiserror::Error;
use tracing::{debug, info};
use trust_common::sha256::{self, Hash};

use crate::p256::{self, KeyPair, PublicKey};

#[derive(Debug, Error)]
pub enum Error {
    #[error("key registry is locked; no more keys can be registered")]
    Locked,

    #[error("an identity key named '{0}' is already registered")]
    DuplicateName(String),

    #[error("an identity key with hash {0} is already registered")]
    DuplicateHash(Hash),

    #[error("no identity key named '{0}'")]
    NameNotFound(String),

    #[error("no identity key with hash {0}")]
    HashNotFound(Hash),

    #[error("invalid identity key: {0}")]
    Key(#[from] p256::Error),
}

/// A named ECDSA P-256 key pair. Its stable identifier is the SHA-256 hash
/// of the public key's `SubjectPublicKeyInfo` DER encoding.
pub struct IdentityKey {
    name: String,
    key_pair: KeyPair,
    hash: Hash,
}

/// Decides whether a peer's advertised long-term public key is trusted.
pub trait IdentityAuthenticator: Send + Sync {
    fn authenticate(&self, candidate: &PublicKey) -> bool;
}

pub struct KeyRegistry {
    /// `Some` while open. Taken exactly once, when freezing.
    open: Mutex<Option<Entries>>,
    frozen: OnceLock<Entries>,
}

#[derive(Default)]
struct Entries {
    /// Insertion order.
    keys: Vec<Arc<IdentityKey>>,
    by_name: HashMap<String, usize>,
    by_hash: HashMap<Hash, usize>,
}

// --- impl IdentityKey --- //

impl IdentityKey {
    /// Generate a fresh identity key.
    pub fn generate(name: impl Into<String>) -> Result<Self, Error> {
        Ok(Self::from_key_pair(name.into(), KeyPair::from_sysrng()?))
    }

    /// Load an identity key from a PKCS#8 DER document.
    pub fn from_pkcs8_der(
        name: impl Into<String>,
        der: &[u8],
    ) -> Result<Self, Error> {
        let key_pair = KeyPair::deserialize_pkcs8_der(der)?;
        Ok(Self::from_key_pair(name.into(), key_pair))
    }

    fn from_key_pair(name: String, key_pair: KeyPair) -> Self {
        let hash = key_pair.public_key().spki_hash();
        Self {
            name,
            key_pair,
            hash,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn public_key(&self) -> &PublicKey {
        self.key_pair.public_key()
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

// --- impl KeyRegistry --- //

impl KeyRegistry {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(Some(Entries::default())),
            frozen: OnceLock::new(),
        }
    }

    /// Register a key. The name and the hash must both be unused.
    pub fn register(&self, key: Arc<IdentityKey>) -> Result<(), Error> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = open.as_mut().ok_or(Error::Locked)?;

        if entries.by_name.contains_key(key.name()) {
            return Err(Error::DuplicateName(key.name().to_owned()));
        }
        if entries.by_hash.contains_key(key.hash()) {
            return Err(Error::DuplicateHash(*key.hash()));
        }

        debug!(
            name = key.name(),
            hash = %key.hash(),
            "registered identity key"
        );
        let idx = entries.keys.len();
        entries.by_name.insert(key.name().to_owned(), idx);
        entries.by_hash.insert(*key.hash(), idx);
        entries.keys.push(key);
        Ok(())
    }

    /// Find a key by name. Freezes the registry.
    pub fn lookup_name(&self, name: &str) -> Result<Arc<IdentityKey>, Error> {
        let entries = self.freeze();
        entries
            .by_name
            .get(name)
            .map(|&idx| entries.keys[idx].clone())
            .ok_or_else(|| Error::NameNotFound(name.to_owned()))
    }

    /// Find a key by hash. Freezes the registry.
    pub fn lookup_hash(&self, hash: &Hash) -> Result<Arc<IdentityKey>, Error> {
        let entries = self.freeze();
        entries
            .by_hash
            .get(hash)
            .map(|&idx| entries.keys[idx].clone())
            .ok_or(Error::HashNotFound(*hash))
    }

    /// Whether a key with this hash is registered. Freezes the registry.
    pub fn is_registered(&self, hash: &Hash) -> bool {
        self.freeze().by_hash.contains_key(hash)
    }

    /// SHA-256 over the concatenated hashes of all registered keys, in
    /// registration order. Freezes the registry.
    ///
    /// Binding this digest into attestation evidence commits a peer to the
    /// exact set of keys it trusts.
    pub fn registry_digest(&self) -> Hash {
        let mut ctx = sha256::Context::new();
        for key in &self.freeze().keys {
            ctx.update(key.hash().as_ref());
        }
        ctx.finish()
    }

    pub fn is_locked(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// Number of registered keys. Freezes the registry.
    pub fn len(&self) -> usize {
        self.freeze().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn freeze(&self) -> &Entries {
        self.frozen.get_or_init(|| {
            let entries = self
                .open
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .unwrap_or_default();
            info!(num_keys = entries.keys.len(), "key registry locked");
            entries
        })
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl IdentityAuthenticator for KeyRegistry {
    fn authenticate(&self, candidate: &PublicKey) -> bool {
        self.is_registered(&candidate.spki_hash())
    }
}

impl<T: IdentityAuthenticator + ?Sized> IdentityAuthenticator for Arc<T> {
    fn authenticate(&self, candidate: &PublicKey) -> bool {
        (**self).authenticate(candidate)
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    fn key(name: &str) -> Arc<IdentityKey> {
        Arc::new(IdentityKey::generate(name).unwrap())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = KeyRegistry::new();
        let (a, b) = (key("attest-server"), key("backup-server"));
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        assert!(!registry.is_locked());

        let found = registry.lookup_name("attest-server").unwrap();
        assert_eq!(found.hash(), a.hash());
        assert!(registry.is_locked());
        let found = registry.lookup_hash(b.hash()).unwrap();
        assert_eq!(found.name(), "backup-server");
        assert!(registry.is_registered(a.hash()));
        assert!(!registry.is_registered(&Hash::new([0; 32])));
        assert!(matches!(
            registry.lookup_name("nobody"),
            Err(Error::NameNotFound(_)),
        ));
        assert!(matches!(
            registry.lookup_hash(&Hash::new([0; 32])),
            Err(Error::HashNotFound(_)),
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicates_rejected() {
        let registry = KeyRegistry::new();
        let a = key("a");
        registry.register(a.clone()).unwrap();

        assert!(matches!(
            registry.register(key("a")),
            Err(Error::DuplicateName(name)) if name == "a",
        ));

        // same key material under a different name
        let same_key =
            IdentityKey::from_pkcs8_der("a2", a.key_pair().as_pkcs8_der())
                .unwrap();
        assert!(matches!(
            registry.register(Arc::new(same_key)),
            Err(Error::DuplicateHash(_)),
        ));

        // failed registrations don't leave anything behind
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_digest_is_insertion_order_and_locks() {
        let registry = KeyRegistry::new();
        let keys = [key("k0"), key("k1"), key("k2")];
        for k in &keys {
            registry.register(k.clone()).unwrap();
        }

        let expected = sha256::digest_many(&[
            keys[0].hash().as_ref(),
            keys[1].hash().as_ref(),
            keys[2].hash().as_ref(),
        ]);
        assert_eq!(registry.registry_digest(), expected);
        assert_eq!(registry.registry_digest(), expected);

        assert!(matches!(registry.register(key("k3")), Err(Error::Locked)));
        assert_eq!(registry.registry_digest(), expected);
    }

    #[test]
    fn test_empty_registry_digest() {
        let registry = KeyRegistry::new();
        assert_eq!(registry.registry_digest(), sha256::digest(b""));
        assert!(registry.is_empty());
        assert!(matches!(registry.register(key("late")), Err(Error::Locked)));
    }

    #[test]
    fn test_is_registered_locks() {
        let registry = KeyRegistry::new();
        assert!(!registry.is_registered(&Hash::new([1; 32])));
        assert!(matches!(registry.register(key("late")), Err(Error::Locked)));
    }

    #[test]
    fn test_authenticator() {
        let registry = Arc::new(KeyRegistry::new());
        let trusted = key("trusted");
        registry.register(trusted.clone()).unwrap();
        let untrusted = key("untrusted");

        let auth: Arc<dyn IdentityAuthenticator> = registry;
        assert!(auth.authenticate(trusted.public_key()));
        assert!(!auth.authenticate(untrusted.public_key()));
    }

    /// Registrations racing the freeze either land before it (and show up in
    /// the frozen set) or fail with `Locked`.
    #[test]
    fn test_concurrent_register_and_freeze() {
        let registry = Arc::new(KeyRegistry::new());
        let keys = (0..16)
            .map(|i| key(&format!("key-{i}")))
            .collect::<Vec<_>>();

        let handles = keys
            .iter()
            .cloned()
            .map(|k| {
                let registry = registry.clone();
                thread::spawn(move || registry.register(k).is_ok())
            })
            .collect::<Vec<_>>();
        let digest = registry.registry_digest();
        let registered = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();

        assert_eq!(registry.len(), registered);
        assert_eq!(registry.registry_digest(), digest);
        for k in &keys {
            let found = registry.is_registered(k.hash());
            assert_eq!(found, registry.lookup_name(k.name()).is_ok());
        }
    }
}
