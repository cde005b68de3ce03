use dashmap::DashMap;
use devflow_sdk::{Value, ValueFilter};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default per-subscription delivery buffer size.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 128;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The subscriber fell behind and coalescing could not absorb the
    /// burst; the subscription has been cancelled.
    #[error("subscriber overflow: delivery buffer exhausted")]
    SubscriberOverflow,
    /// The subscription was cancelled or the storage closed.
    #[error("subscription closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    Open,
    Overflowed,
    Cancelled,
}

struct SubQueue {
    items: VecDeque<Value>,
    state: SubState,
}

struct SubShared {
    filter: ValueFilter,
    capacity: usize,
    queue: Mutex<SubQueue>,
    notify: Notify,
}

impl SubShared {
    /// Enqueue a live change, shedding slow consumers: when the buffer is
    /// full the oldest pending change for the same row is replaced; if no
    /// such entry exists the subscription is cancelled with an overflow.
    fn push(&self, value: Value) {
        {
            let mut q = self.queue.lock().expect("lock poisoned");
            if q.state != SubState::Open {
                return;
            }
            if q.items.len() >= self.capacity {
                let pos = q.items.iter().position(|queued| {
                    queued.device_name() == value.device_name() && queued.name() == value.name()
                });
                match pos {
                    Some(pos) => {
                        q.items.remove(pos);
                        q.items.push_back(value);
                    }
                    None => {
                        warn!(
                            device = value.device_name(),
                            register = value.name(),
                            capacity = self.capacity,
                            "subscriber too slow, cancelling subscription"
                        );
                        q.items.clear();
                        q.state = SubState::Overflowed;
                    }
                }
            } else {
                q.items.push_back(value);
            }
        }
        self.notify.notify_one();
    }

    fn cancel(&self) {
        {
            let mut q = self.queue.lock().expect("lock poisoned");
            if q.state == SubState::Open {
                q.state = SubState::Cancelled;
            }
        }
        self.notify.notify_one();
    }
}

/// Consumer side of a storage subscription.
///
/// Yields the filtered snapshot taken at subscribe time first, then every
/// matching live change in store order per row.
pub struct Subscription {
    shared: Arc<SubShared>,
}

impl Subscription {
    /// Pop the next value without waiting.
    pub fn try_recv(&self) -> Option<Value> {
        self.shared
            .queue
            .lock()
            .expect("lock poisoned")
            .items
            .pop_front()
    }

    /// Receive the next value. Returns `Err(Closed)` after cancellation and
    /// `Err(SubscriberOverflow)` exactly once when the subscription was shed.
    pub async fn recv(&self) -> Result<Value, StorageError> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut q = self.shared.queue.lock().expect("lock poisoned");
                if let Some(v) = q.items.pop_front() {
                    return Ok(v);
                }
                match q.state {
                    SubState::Open => {}
                    SubState::Overflowed => {
                        q.state = SubState::Cancelled;
                        return Err(StorageError::SubscriberOverflow);
                    }
                    SubState::Cancelled => return Err(StorageError::Closed),
                }
            }
            notified.await;
        }
    }
}

/// Keyed latest-value map with filtered fan-out subscriptions.
///
/// One logical writer per row is assumed (the owning driver); concurrent
/// fills on distinct rows are safe. Two instances are wired at startup: the
/// state storage (driver measurements) and the command storage (writes
/// travelling towards drivers).
pub struct ValueStorage {
    rows: DashMap<(String, String), Value>,
    subscriptions: RwLock<Vec<Weak<SubShared>>>,
    closed: AtomicBool,
    log_debug: bool,
}

impl ValueStorage {
    pub fn new(log_debug: bool) -> Arc<Self> {
        Arc::new(Self {
            rows: DashMap::new(),
            subscriptions: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            log_debug,
        })
    }

    /// Store a value and broadcast it to every matching subscription.
    ///
    /// Idempotent when the row already holds an equal value (same variant,
    /// bit-identical payload). Unknown rows are created, which is how lazily
    /// discovered registers enter the catalog. The value's timestamp is
    /// assigned here, at store time.
    pub fn fill(&self, value: Value) {
        let value = value.stamped_now();
        if !value.type_matches_register() {
            warn!(
                device = value.device_name(),
                register = value.name(),
                "dropping value whose payload does not match the register type"
            );
            return;
        }

        // Broadcast happens under the subscription read lock so that
        // subscribe (write lock) observes either the row update plus the
        // delivery, or neither.
        let subs = self.subscriptions.read().expect("lock poisoned");

        let key = (value.device_name().to_string(), value.name().to_string());
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if e.get().payload().bit_eq(value.payload()) {
                    return;
                }
                e.insert(value.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(value.clone());
            }
        }

        if self.log_debug {
            debug!(
                device = value.device_name(),
                register = value.name(),
                value = %value.payload(),
                "fill"
            );
        }

        for weak in subs.iter() {
            if let Some(sub) = weak.upgrade() {
                if sub.filter.matches(&value) {
                    sub.push(value.clone());
                }
            }
        }
    }

    /// Snapshot of all rows matching the filter, consistent per row.
    pub fn get_slice(&self, filter: &ValueFilter) -> Vec<Value> {
        let mut out: Vec<Value> = self
            .rows
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| {
            a.device_name()
                .cmp(b.device_name())
                .then(a.register().sort().cmp(&b.register().sort()))
                .then(a.name().cmp(b.name()))
        });
        out
    }

    /// Latest value of a single row.
    pub fn get(&self, device: &str, register: &str) -> Option<Value> {
        self.rows
            .get(&(device.to_string(), register.to_string()))
            .map(|e| e.value().clone())
    }

    /// Subscribe with the default buffer size.
    pub fn subscribe(&self, cancel: CancellationToken, filter: ValueFilter) -> Subscription {
        self.subscribe_with_buffer(cancel, filter, DEFAULT_SUBSCRIPTION_BUFFER)
    }

    /// Subscribe with an explicit delivery buffer size. The current filtered
    /// snapshot is delivered before any subsequent live change, each change
    /// exactly once.
    pub fn subscribe_with_buffer(
        &self,
        cancel: CancellationToken,
        filter: ValueFilter,
        buffer: usize,
    ) -> Subscription {
        let shared = Arc::new(SubShared {
            filter,
            capacity: buffer.max(1),
            queue: Mutex::new(SubQueue {
                items: VecDeque::new(),
                state: SubState::Open,
            }),
            notify: Notify::new(),
        });

        if self.closed.load(Ordering::Acquire) {
            shared.cancel();
            return Subscription { shared };
        }

        {
            // Write lock excludes fills: snapshot plus registration is atomic.
            let mut subs = self.subscriptions.write().expect("lock poisoned");
            subs.retain(|w| w.strong_count() > 0);

            let snapshot = self.get_slice(&shared.filter);
            {
                let mut q = shared.queue.lock().expect("lock poisoned");
                q.items.extend(snapshot);
            }
            subs.push(Arc::downgrade(&shared));
        }
        shared.notify.notify_one();

        let cancel_shared = Arc::downgrade(&shared);
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(sub) = cancel_shared.upgrade() {
                sub.cancel();
            }
        });

        Subscription { shared }
    }

    /// Remove all rows of a device. Called by the runner on final shutdown.
    pub fn remove_device(&self, device: &str) {
        self.rows.retain(|(d, _), _| d != device);
    }

    /// Stop accepting new subscriptions and cancel the existing ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let subs = self.subscriptions.read().expect("lock poisoned");
        for weak in subs.iter() {
            if let Some(sub) = weak.upgrade() {
                sub.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_sdk::{Register, RegisterType, ValuePayload};
    use std::sync::Arc as StdArc;

    fn number_register(device: &str, name: &str) -> Register {
        Register::number(
            StdArc::from(device),
            "Essential",
            name,
            name,
            None,
            0,
            false,
            Default::default(),
        )
    }

    fn numeric(device: &str, name: &str, v: f64) -> Value {
        Value::numeric(number_register(device, name), v)
    }

    #[tokio::test]
    async fn fill_then_get_slice_preserves_type() {
        let storage = ValueStorage::new(false);
        storage.fill(numeric("a", "Power", 1.0));
        storage.fill(Value::text(
            Register::text(StdArc::from("a"), "Product", "Model", "Model", 1, false),
            "BMV-702",
        ));

        let slice = storage.get_slice(&ValueFilter::all());
        assert_eq!(slice.len(), 2);
        for v in slice {
            assert_eq!(v.payload().register_type(), v.register().register_type());
        }
    }

    #[tokio::test]
    async fn equal_fill_is_idempotent() {
        let storage = ValueStorage::new(false);
        let cancel = CancellationToken::new();
        let sub = storage.subscribe(cancel.clone(), ValueFilter::all());

        storage.fill(numeric("a", "Power", 1.0));
        storage.fill(numeric("a", "Power", 1.0)); // same payload, no broadcast
        storage.fill(numeric("a", "Power", 2.0));

        assert_eq!(sub.recv().await.unwrap().payload(), &ValuePayload::Numeric(1.0));
        assert_eq!(sub.recv().await.unwrap().payload(), &ValuePayload::Numeric(2.0));
        cancel.cancel();
    }

    #[tokio::test]
    async fn subscribe_delivers_snapshot_then_deltas() {
        let storage = ValueStorage::new(false);
        storage.fill(numeric("a", "Power", 1.0));
        storage.fill(numeric("b", "Power", 2.0));

        let cancel = CancellationToken::new();
        let sub = storage.subscribe(cancel.clone(), ValueFilter::device("a"));
        storage.fill(numeric("a", "Power", 3.0));
        storage.fill(numeric("b", "Power", 4.0)); // filtered out

        let first = sub.recv().await.unwrap();
        assert_eq!(first.device_name(), "a");
        assert_eq!(first.payload(), &ValuePayload::Numeric(1.0));
        let second = sub.recv().await.unwrap();
        assert_eq!(second.payload(), &ValuePayload::Numeric(3.0));
        cancel.cancel();
        assert_eq!(sub.recv().await.unwrap_err(), StorageError::Closed);
    }

    #[tokio::test]
    async fn same_row_bursts_coalesce() {
        let storage = ValueStorage::new(false);
        let cancel = CancellationToken::new();
        let sub = storage.subscribe_with_buffer(cancel.clone(), ValueFilter::all(), 2);

        for i in 1..=5 {
            storage.fill(numeric("a", "Power", i as f64));
        }

        // at most the last two values for the row, subscription stays alive
        assert_eq!(sub.recv().await.unwrap().payload(), &ValuePayload::Numeric(4.0));
        assert_eq!(sub.recv().await.unwrap().payload(), &ValuePayload::Numeric(5.0));

        storage.fill(numeric("a", "Power", 6.0));
        assert_eq!(sub.recv().await.unwrap().payload(), &ValuePayload::Numeric(6.0));
    }

    #[tokio::test]
    async fn distinct_row_bursts_cancel_with_overflow() {
        let storage = ValueStorage::new(false);
        let cancel = CancellationToken::new();
        let sub = storage.subscribe_with_buffer(cancel.clone(), ValueFilter::all(), 2);

        for i in 0..5 {
            storage.fill(numeric("a", &format!("Reg{i}"), 1.0));
        }

        let mut result = Ok(());
        for _ in 0..5 {
            match sub.recv().await {
                Ok(_) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        assert_eq!(result.unwrap_err(), StorageError::SubscriberOverflow);
    }

    #[tokio::test]
    async fn remove_device_clears_rows() {
        let storage = ValueStorage::new(false);
        storage.fill(numeric("a", "Power", 1.0));
        storage.fill(numeric("b", "Power", 2.0));
        storage.remove_device("a");

        let slice = storage.get_slice(&ValueFilter::all());
        assert_eq!(slice.len(), 1);
        assert_eq!(slice[0].device_name(), "b");
    }

    #[tokio::test]
    async fn mismatching_payload_is_dropped() {
        let storage = ValueStorage::new(false);
        let reg = number_register("a", "Power");
        storage.fill(Value::new(reg.clone(), ValuePayload::Text("oops".into())));
        assert!(storage.get("a", "Power").is_none());
        assert_eq!(reg.register_type(), RegisterType::Number);
    }
}
