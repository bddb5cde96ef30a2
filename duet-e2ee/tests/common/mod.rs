//! Shared test utilities for the key bootstrap integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use duet_api::{PartnerKeyStatus, SharedKeyStatus};
use duet_core::error::{DuetError, DuetResult};
use duet_e2ee::{E2eeBootstrap, KeyService, KeyStorageManager, PollPolicy, Sleeper};

/// Small modulus so the suites stay fast.
pub const TEST_RSA_BITS: usize = 1024;

#[derive(Default)]
struct Directory {
    public_keys: HashMap<String, String>,
    shared_copies: HashMap<String, String>,
    pairings: HashMap<String, (String, String)>,
    partner_key_override: Option<String>,
}

impl Directory {
    fn partner_of(&self, user_id: &str) -> Option<String> {
        self.pairings.values().find_map(|(a, b)| {
            if a == user_id {
                Some(b.clone())
            } else if b == user_id {
                Some(a.clone())
            } else {
                None
            }
        })
    }
}

/// In-memory stand-in for the key directory and key-exchange store.
#[derive(Clone, Default)]
pub struct MemoryKeyServer {
    directory: Arc<Mutex<Directory>>,
}

impl MemoryKeyServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pairing between two users.
    pub fn pair(&self, pairing_id: &str, a: &str, b: &str) {
        self.directory
            .lock()
            .unwrap()
            .pairings
            .insert(pairing_id.into(), (a.into(), b.into()));
    }

    /// A service handle authenticated as `user_id`.
    pub fn client(&self, user_id: &str) -> Arc<PartyHandle> {
        Arc::new(PartyHandle {
            user_id: user_id.into(),
            directory: self.directory.clone(),
            calls: CallCounts::default(),
            offline: AtomicBool::new(false),
        })
    }

    pub fn public_key_of(&self, user_id: &str) -> Option<String> {
        self.directory.lock().unwrap().public_keys.get(user_id).cloned()
    }

    /// Serve this value as every partner key lookup result.
    pub fn override_partner_key(&self, value: &str) {
        self.directory.lock().unwrap().partner_key_override = Some(value.into());
    }

    /// Store an arbitrary encrypted copy for a user.
    pub fn put_shared_copy(&self, user_id: &str, value: &str) {
        self.directory
            .lock()
            .unwrap()
            .shared_copies
            .insert(user_id.into(), value.into());
    }

    /// Drop every uploaded copy, as the server does on unpairing.
    pub fn clear_shared_copies(&self) {
        self.directory.lock().unwrap().shared_copies.clear();
    }
}

#[derive(Default)]
pub struct CallCounts {
    pub publish: AtomicU32,
    pub partner_key: AtomicU32,
    pub upload: AtomicU32,
    pub own_copy: AtomicU32,
}

impl CallCounts {
    pub fn total(&self) -> u32 {
        self.publish.load(Ordering::SeqCst)
            + self.partner_key.load(Ordering::SeqCst)
            + self.upload.load(Ordering::SeqCst)
            + self.own_copy.load(Ordering::SeqCst)
    }
}

/// One party's authenticated view of [`MemoryKeyServer`].
pub struct PartyHandle {
    user_id: String,
    directory: Arc<Mutex<Directory>>,
    pub calls: CallCounts,
    offline: AtomicBool,
}

impl PartyHandle {
    /// Make every call fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> DuetResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(DuetError::Http("connection failed: connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyService for PartyHandle {
    async fn publish_public_key(&self, public_key: &str) -> DuetResult<()> {
        self.calls.publish.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.directory
            .lock()
            .unwrap()
            .public_keys
            .insert(self.user_id.clone(), public_key.into());
        Ok(())
    }

    async fn partner_public_key(&self, pairing_id: &str) -> DuetResult<PartnerKeyStatus> {
        self.calls.partner_key.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let dir = self.directory.lock().unwrap();
        if let Some(forced) = &dir.partner_key_override {
            return Ok(PartnerKeyStatus {
                has_key: true,
                public_key: Some(forced.clone()),
            });
        }
        let (a, b) = dir.pairings.get(pairing_id).ok_or(DuetError::ServerError {
            status: 404,
            message: format!("no pairing {pairing_id}"),
        })?;
        let partner = if *a == self.user_id { b } else { a };
        let public_key = dir.public_keys.get(partner).cloned();
        Ok(PartnerKeyStatus {
            has_key: public_key.is_some(),
            public_key,
        })
    }

    async fn upload_shared_keys(&self, for_self: &str, for_partner: &str) -> DuetResult<()> {
        self.calls.upload.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut dir = self.directory.lock().unwrap();
        let partner = dir.partner_of(&self.user_id).ok_or(DuetError::ServerError {
            status: 409,
            message: "caller is not paired".into(),
        })?;
        dir.shared_copies.insert(self.user_id.clone(), for_self.into());
        dir.shared_copies.insert(partner, for_partner.into());
        Ok(())
    }

    async fn own_shared_key(&self) -> DuetResult<SharedKeyStatus> {
        self.calls.own_copy.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let copy = self
            .directory
            .lock()
            .unwrap()
            .shared_copies
            .get(&self.user_id)
            .cloned();
        Ok(SharedKeyStatus {
            has_shared_key: copy.is_some(),
            encrypted_shared_key: copy,
        })
    }
}

/// Records requested naps without waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    naps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn naps(&self) -> Vec<Duration> {
        self.naps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.naps.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Polls often enough that two concurrent parties meet quickly.
pub fn fast_poll() -> PollPolicy {
    PollPolicy::new(300, Duration::from_millis(10))
}

/// A bootstrap for `handle` over fresh in-memory storage.
pub fn create_party(handle: Arc<PartyHandle>) -> E2eeBootstrap {
    create_party_with_storage(handle, KeyStorageManager::in_memory())
}

pub fn create_party_with_storage(
    handle: Arc<PartyHandle>,
    storage: KeyStorageManager,
) -> E2eeBootstrap {
    E2eeBootstrap::new(handle, storage)
        .with_rsa_bits(TEST_RSA_BITS)
        .with_partner_poll(fast_poll())
        .with_shared_poll(fast_poll())
}

/// Two parties of pairing `p1`: `alice` sorts lower than `bob`.
pub fn create_pair() -> (MemoryKeyServer, Arc<PartyHandle>, Arc<PartyHandle>) {
    let server = MemoryKeyServer::new();
    server.pair("p1", "alice", "bob");
    let alice = server.client("alice");
    let bob = server.client("bob");
    (server, alice, bob)
}
