//! End-to-end flows across the key manager, vault, cache and pending queue.

use std::sync::Arc;

use ledgervault_core::platform::memory::{
    MemoryBlobStore, MemoryKeystore, MemoryLedger, MemorySlotLocks, MemorySlotStore,
    StaticIdentityProvider,
};
use ledgervault_core::platform::{
    BlobStore, DeviceKeystore, IdentityProvider, SlotLockManager, SlotStore,
};
use ledgervault_core::{
    CacheConfig, Credential, KeyManager, PendingQueue, PendingState, PendingWriteExecutor,
    SecureCache, SessionManager, UnlockSource, Vault, VaultConfig, VaultExecutor,
};

const ADDRESS: &str = "0xa11ce";

struct World {
    ledger: MemoryLedger,
    provider: Arc<StaticIdentityProvider>,
    vault: Arc<Vault>,
    keys: KeyManager,
    config: VaultConfig,
}

fn world() -> World {
    let _ = ledgervault_core::init_tracing("ledgervault_core=debug");
    let config = VaultConfig::from_json(
        r#"{"cache": {"memory_kib": 64, "iterations": 1}, "queue": {"max_attempts": 2}}"#,
    )
    .unwrap();
    let ledger = MemoryLedger::new(ADDRESS);
    let provider = Arc::new(StaticIdentityProvider::new(ADDRESS, "oauth-salt"));
    let vault = Arc::new(Vault::new(
        Arc::new(ledger.clone()),
        Arc::new(MemoryBlobStore::new()) as Arc<dyn BlobStore>,
    ));
    let keys = KeyManager::new(
        Arc::clone(&provider) as Arc<dyn IdentityProvider>,
        config.key_lifecycle.clone(),
    );
    World {
        ledger,
        provider,
        vault,
        keys,
        config,
    }
}

#[tokio::test]
async fn save_two_accounts_then_read_both() {
    let w = world();
    let owner = w.vault.open_owner(ADDRESS, None).await.unwrap();
    let master = w.keys.get_or_derive(ADDRESS).await.unwrap();

    let alice = Credential::new("example.com", "alice", "p1");
    let bob = Credential::new("example.com", "bob", "p2");
    w.vault.save(&alice, &master, &owner).await.unwrap();
    w.vault.save(&bob, &master, &owner).await.unwrap();

    let got = w
        .vault
        .get("EXAMPLE.com", &master, &owner)
        .await
        .unwrap()
        .expect("entry exists");
    assert_eq!(got.credentials, vec![alice, bob]);
    assert!(w.vault.exists("example.com", &master, &owner).await.unwrap());
    assert!(!w.vault.exists("example.org", &master, &owner).await.unwrap());
}

#[tokio::test]
async fn fingerprints_survive_a_new_session() {
    let w = world();
    let owner = w.vault.open_owner(ADDRESS, None).await.unwrap();
    {
        let master = w.keys.get_or_derive(ADDRESS).await.unwrap();
        w.vault
            .save(&Credential::new("example.com", "u", "p"), &master, &owner)
            .await
            .unwrap();
    }
    w.keys.clear().await;

    // Fresh manager, same identity proof.
    let keys = KeyManager::new(
        Arc::clone(&w.provider) as Arc<dyn IdentityProvider>,
        w.config.key_lifecycle.clone(),
    );
    let master = keys.get_or_derive(ADDRESS).await.unwrap();
    let got = w
        .vault
        .get("example.com", &master, &owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.credentials, vec![Credential::new("example.com", "u", "p")]);
    assert_eq!(w.provider.calls(), 2);
}

#[tokio::test]
async fn queued_write_is_retried_then_applied_once() {
    let w = world();
    let owner = w.vault.open_owner(ADDRESS, None).await.unwrap();

    let slots = Arc::new(MemorySlotStore::new());
    let keystore = Arc::new(MemoryKeystore::new());
    let locks = Arc::new(MemorySlotLocks::new());
    let requester = PendingQueue::new(
        Arc::clone(&slots) as Arc<dyn SlotStore>,
        Arc::clone(&keystore) as Arc<dyn DeviceKeystore>,
        Arc::clone(&locks) as Arc<dyn SlotLockManager>,
        w.config.queue.clone(),
    );
    let id = requester
        .enqueue(Credential::new("example.com", "queued", "secret"))
        .unwrap();

    // The signing side opens the same transport.
    let executor_queue = PendingQueue::new(
        Arc::clone(&slots) as Arc<dyn SlotStore>,
        Arc::clone(&keystore) as Arc<dyn DeviceKeystore>,
        Arc::clone(&locks) as Arc<dyn SlotLockManager>,
        w.config.queue.clone(),
    );
    let executor = VaultExecutor::new(Arc::clone(&w.vault), w.keys.clone(), owner.clone());

    w.ledger.fail_next_writes(1);
    let report = executor_queue.drain_once(&executor).await.unwrap();
    assert_eq!(report.failed, 1);
    let entries = requester.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].state, PendingState::Queued);

    let report = executor_queue.drain_once(&executor).await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(requester.list().unwrap().is_empty());

    let report = executor_queue.drain_once(&executor).await.unwrap();
    assert_eq!(report.attempted, 0);

    let master = w.keys.get_or_derive(ADDRESS).await.unwrap();
    let got = w
        .vault
        .get("example.com", &master, &owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        got.credentials,
        vec![Credential::new("example.com", "queued", "secret")]
    );
}

#[tokio::test]
async fn executor_without_identity_keeps_entry() {
    let w = world();
    let owner = w.vault.open_owner(ADDRESS, None).await.unwrap();
    w.provider.set_available(false);

    let queue = PendingQueue::new(
        Arc::new(MemorySlotStore::new()),
        Arc::new(MemoryKeystore::new()),
        Arc::new(MemorySlotLocks::new()),
        w.config.queue.clone(),
    );
    queue
        .enqueue(Credential::new("example.com", "u", "p"))
        .unwrap();
    let executor: Arc<dyn PendingWriteExecutor> = Arc::new(VaultExecutor::new(
        Arc::clone(&w.vault),
        w.keys.clone(),
        owner,
    ));

    let report = queue.drain_once(executor.as_ref()).await.unwrap();
    assert_eq!(report.failed, 1);
    let entry = &queue.list().unwrap()[0];
    assert!(entry.last_error.as_deref().unwrap().contains("derivation"));
}

#[tokio::test]
async fn session_unlock_survives_reload_and_tampering() {
    let w = world();
    let session_slots = Arc::new(MemorySlotStore::new());
    let cache = Arc::new(SecureCache::new(
        Arc::clone(&session_slots) as Arc<dyn SlotStore>,
        Arc::new(MemorySlotStore::new()),
        CacheConfig {
            memory_kib: 64,
            iterations: 1,
            ..CacheConfig::default()
        },
    ));

    let device = Arc::new(MemoryKeystore::new());
    let first = SessionManager::new(
        w.keys.clone(),
        Arc::clone(&cache),
        Arc::clone(&device) as Arc<dyn DeviceKeystore>,
    );
    assert_eq!(first.unlock(ADDRESS).await.unwrap(), UnlockSource::Derived);

    let reload = SessionManager::new(
        KeyManager::new(
            Arc::clone(&w.provider) as Arc<dyn IdentityProvider>,
            w.config.key_lifecycle.clone(),
        ),
        Arc::clone(&cache),
        Arc::clone(&device) as Arc<dyn DeviceKeystore>,
    );
    assert_eq!(reload.unlock(ADDRESS).await.unwrap(), UnlockSource::Restored);
    assert_eq!(w.provider.calls(), 1);

    for name in session_slots.list() {
        let mut bytes = session_slots.read(&name).unwrap().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        session_slots.write_atomic(&name, &bytes).unwrap();
    }
    let tampered = SessionManager::new(
        KeyManager::new(
            Arc::clone(&w.provider) as Arc<dyn IdentityProvider>,
            w.config.key_lifecycle.clone(),
        ),
        Arc::clone(&cache),
        Arc::clone(&device) as Arc<dyn DeviceKeystore>,
    );
    assert_eq!(tampered.unlock(ADDRESS).await.unwrap(), UnlockSource::Derived);
    assert_eq!(w.provider.calls(), 2);
}
