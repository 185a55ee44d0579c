//! Scripted in-memory pool backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Barrier;

use pg_pool_manager::config::{DatabaseSettings, DbConfig};
use pg_pool_manager::identity::{AccessToken, IdentityError, TokenProvider};
use pg_pool_manager::infrastructure::backoff::BackoffConfig;
use pg_pool_manager::postgres::{
    BackendError, ConnectionPool, PoolBackend, PoolEvents, PoolManager, PoolOptions,
};

/// What the next `acquire` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Borrow {
    Ok,
    PoolFailure,
    Unexpected,
}

#[derive(Default)]
pub struct BackendLog {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub acquires: AtomicUsize,
    pub connection_strings: Mutex<Vec<String>>,
    script: Mutex<VecDeque<Borrow>>,
    fail_open: Mutex<Option<(usize, String)>>,
    fail_close: Mutex<Option<String>>,
    failure_gate: Mutex<Option<Arc<Barrier>>>,
}

impl BackendLog {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Queue borrow outcomes; once drained every borrow succeeds.
    pub fn script(&self, outcomes: &[Borrow]) {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
    }

    /// Every open fails.
    pub fn fail_open(&self, message: &str) {
        self.fail_open_after(0, message);
    }

    /// Opens fail once `successful` pools have been opened.
    pub fn fail_open_after(&self, successful: usize, message: &str) {
        *self.fail_open.lock().unwrap() = Some((successful, message.to_string()));
    }

    pub fn fail_close(&self, message: &str) {
        *self.fail_close.lock().unwrap() = Some(message.to_string());
    }

    /// Clear open and close failures.
    pub fn recover(&self) {
        *self.fail_open.lock().unwrap() = None;
        *self.fail_close.lock().unwrap() = None;
    }

    /// Failing borrows wait on this barrier before reporting the failure.
    pub fn gate_failures(&self, parties: usize) {
        *self.failure_gate.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
    }

    fn next_borrow(&self) -> Borrow {
        self.script.lock().unwrap().pop_front().unwrap_or(Borrow::Ok)
    }
}

pub struct MemoryBackend {
    pub log: Arc<BackendLog>,
    capacity: usize,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> (Self, Arc<BackendLog>) {
        let log = Arc::new(BackendLog::default());
        (
            Self {
                log: log.clone(),
                capacity,
            },
            log,
        )
    }
}

#[async_trait::async_trait]
impl PoolBackend for MemoryBackend {
    type Pool = MemoryPool;

    async fn open(
        &self,
        connection_string: &str,
        _options: &PoolOptions,
    ) -> Result<MemoryPool, BackendError> {
        if let Some((successful, message)) = self.log.fail_open.lock().unwrap().clone() {
            if self.log.opens() >= successful {
                return Err(BackendError::Pool(message));
            }
        }

        self.log.opens.fetch_add(1, Ordering::SeqCst);
        self.log
            .connection_strings
            .lock()
            .unwrap()
            .push(connection_string.to_string());

        Ok(MemoryPool {
            log: self.log.clone(),
            capacity: self.capacity,
            idle: AtomicUsize::new(self.capacity),
            next_id: AtomicUsize::new(1),
        })
    }
}

pub struct MemoryPool {
    log: Arc<BackendLog>,
    capacity: usize,
    idle: AtomicUsize,
    next_id: AtomicUsize,
}

/// Stand-in for a database connection.
#[derive(Debug)]
pub struct MemoryConnection {
    pub id: usize,
    pub pings: usize,
}

#[async_trait::async_trait]
impl ConnectionPool for MemoryPool {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, BackendError> {
        self.log.acquires.fetch_add(1, Ordering::SeqCst);

        let outcome = self.log.next_borrow();
        if outcome != Borrow::Ok {
            let gate = self.log.failure_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.wait().await;
            }
        }

        match outcome {
            Borrow::Ok => {
                self.idle.fetch_sub(1, Ordering::SeqCst);
                Ok(MemoryConnection {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst),
                    pings: 0,
                })
            }
            Borrow::PoolFailure => Err(BackendError::Pool(
                "terminating connection due to administrator command".to_string(),
            )),
            Borrow::Unexpected => Err(BackendError::Unexpected("decoder exploded".to_string())),
        }
    }

    fn release(&self, _conn: MemoryConnection) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    async fn ping(&self, conn: &mut MemoryConnection) -> Result<(), BackendError> {
        conn.pings += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        match self.log.fail_close.lock().unwrap().clone() {
            Some(message) => Err(BackendError::Pool(message)),
            None => Ok(()),
        }
    }

    fn size(&self) -> u32 {
        self.capacity as u32
    }

    fn idle(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }
}

/// Token provider that counts calls.
#[derive(Default)]
pub struct CountingTokenProvider {
    pub calls: AtomicUsize,
}

impl CountingTokenProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenProvider for CountingTokenProvider {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, IdentityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken::expiring_in("entra-token", 3600))
    }
}

/// Captures manager log lines.
#[derive(Default)]
pub struct RecordingEvents {
    pub infos: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl PoolEvents for RecordingEvents {
    fn info(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

pub fn example_settings() -> DatabaseSettings {
    DatabaseSettings {
        server: Some("db.local".to_string()),
        port: 5432,
        db: Some("app".to_string()),
        user: Some("svc".to_string()),
        password: Some("secret".to_string()),
        encryption_key: Some("k1".to_string()),
        ..DatabaseSettings::default()
    }
}

pub struct TestEnvironment {
    pub manager: Arc<PoolManager<MemoryBackend>>,
    pub log: Arc<BackendLog>,
    pub tokens: Arc<CountingTokenProvider>,
    pub events: Arc<RecordingEvents>,
}

pub fn create_test_environment(settings: DatabaseSettings, capacity: usize) -> TestEnvironment {
    let tokens = Arc::new(CountingTokenProvider::default());
    let events = Arc::new(RecordingEvents::default());
    let config = Arc::new(
        DbConfig::new(settings.clone(), tokens.clone())
            .unwrap()
            .with_events(events.clone()),
    );
    let (backend, log) = MemoryBackend::new(capacity);

    let manager = PoolManager::from_settings(config, backend, &settings)
        .with_backoff(BackoffConfig::none())
        .with_events(events.clone());

    TestEnvironment {
        manager: Arc::new(manager),
        log,
        tokens,
        events,
    }
}
