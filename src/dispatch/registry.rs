//! Process-wide record of claimed signatures and trampolines.
//!
//! A claim is the only way to obtain a dispatcher. It is never given back
//! once the dispatcher is installed, so a signature can be patched by at
//! most one owner for the life of the process.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::error::{BranchError, BranchResult};

#[derive(Default)]
struct Registry {
    by_signature: HashMap<TypeId, usize>,
    by_address: HashMap<usize, &'static str>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

/// Proof that `key` and its trampoline `address` belong to the holder.
#[derive(Debug)]
pub struct Claim {
    key: TypeId,
    name: &'static str,
    address: usize,
}

impl Claim {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn address(&self) -> usize {
        self.address
    }

    /// Give the claim back. Only valid before anything was patched.
    pub(crate) fn release(self) {
        let mut registry = registry().lock().unwrap_or_else(PoisonError::into_inner);
        registry.by_signature.remove(&self.key);
        registry.by_address.remove(&self.address);
        tracing::debug!(signature = self.name, "released dispatcher claim");
    }
}

/// Register `key` with its trampoline `address`.
///
/// Fails if the signature already has an owner, or if another signature
/// claimed the same trampoline address.
pub fn claim(key: TypeId, name: &'static str, address: usize) -> BranchResult<Claim> {
    let mut registry = registry().lock().unwrap_or_else(PoisonError::into_inner);

    if registry.by_signature.contains_key(&key) {
        return Err(BranchError::MultipleInstance { signature: name });
    }
    if let Some(owner) = registry.by_address.get(&address) {
        tracing::warn!(
            signature = name,
            owner = *owner,
            address,
            "trampoline address already claimed by another signature"
        );
        return Err(BranchError::MultipleInstance { signature: name });
    }

    registry.by_signature.insert(key, address);
    registry.by_address.insert(address, name);
    Ok(Claim { key, name, address })
}

pub fn is_claimed(key: TypeId) -> bool {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .by_signature
        .contains_key(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Keys private to these tests, never used as dispatcher signatures.
    struct KeyA;
    struct KeyB;
    struct KeyC;
    struct KeyD;

    #[test]
    fn test_claim_twice_fails() {
        let key = TypeId::of::<KeyA>();
        let first = claim(key, "KeyA", 0x10_0000).unwrap();
        assert!(is_claimed(key));
        assert_eq!(first.address(), 0x10_0000);

        let err = claim(key, "KeyA", 0x10_0000).unwrap_err();
        assert!(matches!(err, BranchError::MultipleInstance { signature: "KeyA" }));
    }

    #[test]
    fn test_address_collision_fails() {
        let _owner = claim(TypeId::of::<KeyB>(), "KeyB", 0x20_0000).unwrap();
        let err = claim(TypeId::of::<KeyC>(), "KeyC", 0x20_0000).unwrap_err();
        assert!(matches!(err, BranchError::MultipleInstance { signature: "KeyC" }));
        assert!(!is_claimed(TypeId::of::<KeyC>()));
    }

    #[test]
    fn test_release_allows_reclaim() {
        let key = TypeId::of::<KeyD>();
        let first = claim(key, "KeyD", 0x30_0000).unwrap();
        assert_eq!(first.name(), "KeyD");
        first.release();
        assert!(!is_claimed(key));

        let second = claim(key, "KeyD", 0x30_0000).unwrap();
        assert_eq!(second.address(), 0x30_0000);
    }
}
