//! In-memory gateway doubles.
//!
//! Used by the lifecycle, audit, and API tests; small enough to keep in
//! the library so every crate can share them.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::compute::{ComputeGateway, PowerState};
use crate::error::{GatewayError, GatewayResult};
use crate::object_store::ObjectStore;

/// Scriptable compute plane.
///
/// Successful start/shelve calls flip the reported power state, so the
/// fake behaves like a tiny compute plane unless a status is forced.
#[derive(Debug)]
pub struct FakeCompute {
    power: Mutex<PowerState>,
    status_error: Mutex<Option<GatewayError>>,
    start_results: Mutex<VecDeque<GatewayResult<()>>>,
    shelve_results: Mutex<VecDeque<GatewayResult<()>>>,
    delay: Mutex<Duration>,
    start_calls: AtomicUsize,
    shelve_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl FakeCompute {
    pub fn new(power: PowerState) -> Self {
        Self {
            power: Mutex::new(power),
            status_error: Mutex::new(None),
            start_results: Mutex::new(VecDeque::new()),
            shelve_results: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            start_calls: AtomicUsize::new(0),
            shelve_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    /// Force the reported power state.
    pub fn set_power(&self, power: PowerState) {
        *lock(&self.power) = power;
    }

    pub fn power(&self) -> PowerState {
        lock(&self.power).clone()
    }

    /// Make status queries fail until cleared with `None`.
    pub fn set_status_error(&self, error: Option<GatewayError>) {
        *lock(&self.status_error) = error;
    }

    /// Queue the result of the next start call (default: success).
    pub fn push_start_result(&self, result: GatewayResult<()>) {
        lock(&self.start_results).push_back(result);
    }

    /// Queue the result of the next shelve call (default: success).
    pub fn push_shelve_result(&self, result: GatewayResult<()>) {
        lock(&self.shelve_results).push_back(result);
    }

    /// Make start and shelve calls take `delay` before returning.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn shelve_calls(&self) -> usize {
        self.shelve_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ComputeGateway for FakeCompute {
    async fn start_instance(&self) -> GatewayResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let result = lock(&self.start_results).pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.set_power(PowerState::Active);
        }
        result
    }

    async fn shelve_instance(&self) -> GatewayResult<()> {
        self.shelve_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let result = lock(&self.shelve_results).pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.set_power(PowerState::Shelved);
        }
        result
    }

    async fn instance_status(&self) -> GatewayResult<PowerState> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.status_error).clone() {
            return Err(err);
        }
        Ok(self.power())
    }
}

/// Object store that keeps objects in a map and can fail on demand.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    fail_next: AtomicUsize,
    put_calls: AtomicUsize,
    keys_seen: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` put calls.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Every key passed to `put_object`, failed attempts included.
    pub fn keys_seen(&self) -> Vec<String> {
        lock(&self.keys_seen).clone()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn get(&self, container: &str, key: &str) -> Option<Bytes> {
        lock(&self.objects)
            .get(&(container.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, container: &str, key: &str, payload: Bytes) -> GatewayResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.keys_seen).push(key.to_string());

        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(GatewayError::failed("put_object", "injected failure"));
        }

        lock(&self.objects).insert((container.to_string(), key.to_string()), payload);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
