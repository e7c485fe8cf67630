use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ResolveError, Result};

type SharedOutcome<V> = Shared<BoxFuture<'static, Result<V>>>;
type StartCall<V> = oneshot::Sender<BoxFuture<'static, Result<V>>>;

/// Llamada en vuelo para una clave.
struct InFlightCall<V> {
    id: u64,
    outcome: SharedOutcome<V>,
    waiters: Arc<AtomicUsize>,
}

type CallMap<K, V> = Arc<Mutex<HashMap<K, InFlightCall<V>>>>;

/// Singleflight Coordinator.
///
/// Concurrent `execute` calls for the same key share one underlying call.
/// The map lock is held only to check-or-insert the shared handle: the
/// leader's closure is invoked after the lock is released and its future is
/// handed to the already running flight task.
///
/// The call itself runs on its own task: a waiter that goes away (client
/// disconnect) drops only its handle, and the remaining waiters still get
/// the outcome. Outcomes are not retained once fanned out, so a failed key
/// is retried fresh by the next caller.
pub struct Singleflight<K, V> {
    calls: CallMap<K, V>,
    next_id: AtomicU64,
}

impl<K, V> Singleflight<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Runs `f` for `key` unless a call is already in flight, in which case
    /// the caller joins it.
    ///
    /// `timeout` bounds the shared call: when it elapses every current waiter
    /// receives [`ResolveError::Timeout`].
    pub async fn execute<F, Fut>(&self, key: K, timeout: Duration, f: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (outcome, start, _waiter) = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(call) => {
                    let waiter = Waiter::join(&call.waiters);
                    debug!("🔗 {} ya en vuelo, esperando resultado ({} waiters)", key, waiter.position);
                    (call.outcome.clone(), None, waiter)
                }
                None => {
                    let (start, call) = self.launch(key.clone(), timeout);
                    let waiter = Waiter::join(&call.waiters);
                    let outcome = call.outcome.clone();
                    calls.insert(key, call);
                    (outcome, Some(start), waiter)
                }
            }
        };

        if let Some(start) = start {
            // El task de la llamada sigue vivo hasta recibir el future
            let _ = start.send(f().boxed());
        }

        outcome.await
    }

    /// Número de llamadas en vuelo.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Callers currently waiting on the in-flight call for `key`.
    pub fn waiting(&self, key: &K) -> usize {
        self.calls
            .lock()
            .get(key)
            .map_or(0, |call| call.waiters.load(Ordering::Acquire))
    }

    fn launch(&self, key: K, timeout: Duration) -> (StartCall<V>, InFlightCall<V>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let waiters = Arc::new(AtomicUsize::new(0));
        let guard = FlightGuard {
            calls: Arc::clone(&self.calls),
            key,
            id,
            waiters: Arc::clone(&waiters),
        };
        let (start, call) = oneshot::channel::<BoxFuture<'static, Result<V>>>();

        let handle = tokio::spawn(async move {
            let result = match call.await {
                Ok(call) => match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("⏰ {} superó el timeout de {:?}", guard.key, timeout);
                        Err(ResolveError::Timeout(timeout))
                    }
                },
                // El líder hizo panic antes de entregar la llamada
                Err(_) => Err(ResolveError::upstream("resolver call was never started")),
            };
            drop(guard);
            result
        });

        let outcome = async move {
            handle.await.unwrap_or_else(|e| {
                Err(ResolveError::upstream(format!("resolver task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        (
            start,
            InFlightCall {
                id,
                outcome,
                waiters,
            },
        )
    }
}

impl<K, V> Default for Singleflight<K, V>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Registro de un caller esperando; se descuenta al soltarlo.
struct Waiter {
    waiters: Arc<AtomicUsize>,
    position: usize,
}

impl Waiter {
    fn join(waiters: &Arc<AtomicUsize>) -> Self {
        let position = waiters.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            waiters: Arc::clone(waiters),
            position,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Retira la llamada del mapa al terminar, incluso si el resolver hace panic.
struct FlightGuard<K, V>
where
    K: Eq + Hash + Display,
{
    calls: CallMap<K, V>,
    key: K,
    id: u64,
    waiters: Arc<AtomicUsize>,
}

impl<K, V> Drop for FlightGuard<K, V>
where
    K: Eq + Hash + Display,
{
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        if calls.get(&self.key).is_some_and(|call| call.id == self.id) {
            calls.remove(&self.key);
        }
        debug!(
            "📣 {} completado, resultado para {} waiters",
            self.key,
            self.waiters.load(Ordering::Acquire)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use pretty_assertions::assert_eq;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn counting_call(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        result: Result<String>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_call() {
        let flights = Arc::new(Singleflight::<String, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks = (0..50).map(|_| {
            let flights = Arc::clone(&flights);
            let f = counting_call(&calls, Duration::from_millis(50), Ok("value".to_string()));
            tokio::spawn(async move { flights.execute("k".to_string(), TIMEOUT, f).await })
        });
        let outcomes = join_all(tasks).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for outcome in outcomes {
            assert_eq!(outcome.unwrap(), Ok("value".to_string()));
        }
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reaches_every_waiter_and_is_not_kept() {
        let flights = Arc::new(Singleflight::<String, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = ResolveError::upstream("connection reset");

        let tasks = (0..10).map(|_| {
            let flights = Arc::clone(&flights);
            let f = counting_call(&calls, Duration::from_millis(20), Err(failure.clone()));
            tokio::spawn(async move { flights.execute("k".to_string(), TIMEOUT, f).await })
        });
        for outcome in join_all(tasks).await {
            assert_eq!(outcome.unwrap(), Err(failure.clone()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // El siguiente intento vuelve a llamar
        let retry = flights
            .execute(
                "k".to_string(),
                TIMEOUT,
                counting_call(&calls, Duration::ZERO, Ok("ok".to_string())),
            )
            .await;
        assert_eq!(retry, Ok("ok".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_all_waiters() {
        let flights = Arc::new(Singleflight::<String, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let timeout = Duration::from_secs(1);

        let tasks = (0..5).map(|_| {
            let flights = Arc::clone(&flights);
            let f = counting_call(&calls, Duration::from_secs(60), Ok("late".to_string()));
            tokio::spawn(async move { flights.execute("slow".to_string(), timeout, f).await })
        });
        for outcome in join_all(tasks).await {
            assert_eq!(outcome.unwrap(), Err(ResolveError::Timeout(timeout)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_does_not_cancel_call() {
        let flights = Arc::new(Singleflight::<String, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let flights = Arc::clone(&flights);
            let f = counting_call(&calls, Duration::from_millis(100), Ok("shared".to_string()));
            tokio::spawn(async move { flights.execute("k".to_string(), TIMEOUT, f).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = {
            let flights = Arc::clone(&flights);
            let f = counting_call(&calls, Duration::ZERO, Ok("other".to_string()));
            tokio::spawn(async move { flights.execute("k".to_string(), TIMEOUT, f).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        assert_eq!(second.await.unwrap(), Ok("shared".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiters_are_not_counted() {
        let flights = Arc::new(Singleflight::<String, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let flights = Arc::clone(&flights);
                let f = counting_call(&calls, Duration::from_millis(100), Ok("v".to_string()));
                tokio::spawn(async move { flights.execute("k".to_string(), TIMEOUT, f).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flights.waiting(&"k".to_string()), 4);

        tasks[2].abort();
        tasks[3].abort();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flights.waiting(&"k".to_string()), 2);

        for task in tasks {
            if let Ok(outcome) = task.await {
                assert_eq!(outcome, Ok("v".to_string()));
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.waiting(&"k".to_string()), 0);
    }

    #[tokio::test]
    async fn test_call_is_built_outside_the_map_lock() {
        let flights = Arc::new(Singleflight::<String, String>::new());

        // in_flight() toma el mismo lock: no debe bloquearse dentro de `f`
        let inner = Arc::clone(&flights);
        let outcome = flights
            .execute("k".to_string(), TIMEOUT, move || {
                let seen = inner.in_flight();
                async move { Ok(seen.to_string()) }
            })
            .await;

        assert_eq!(outcome, Ok("1".to_string()));
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_call_is_reported_and_cleared() {
        let flights = Singleflight::<String, String>::new();

        let outcome = flights
            .execute("boom".to_string(), TIMEOUT, || async {
                let exploded: Option<String> = None;
                Ok::<_, ResolveError>(exploded.expect("resolver exploded"))
            })
            .await;

        assert!(matches!(outcome, Err(ResolveError::UpstreamUnavailable(_))));
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let flights = Singleflight::<String, String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            flights.execute(
                "a".to_string(),
                TIMEOUT,
                counting_call(&calls, Duration::from_millis(5), Ok("a".to_string())),
            ),
            flights.execute(
                "b".to_string(),
                TIMEOUT,
                counting_call(&calls, Duration::from_millis(5), Ok("b".to_string())),
            ),
        );

        assert_eq!(a, Ok("a".to_string()));
        assert_eq!(b, Ok("b".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
