//! Safe executor for plugin operations
//!
//! Every mutating lifecycle operation runs through [`SafeExecutor::execute`]:
//! operations are serialized behind one lock, each runs in its own task so a
//! panic in plugin code becomes [`PluginError::RuntimeFault`], and each is
//! bounded by a ceiling after which it is cancelled and aborted. The lock is
//! handed back to the caller inside [`Execution`] so the result can be
//! committed before the next operation starts.
//!
//! Calls that must not block lifecycle work (endpoint invocations, health
//! probes, shutdown hooks) use [`SafeExecutor::isolate`], which applies the
//! same fault and timeout containment without taking the lock.
//!
//! A timed-out call returns to its caller no later than its ceiling plus the
//! cancel grace. Code that ignores cancellation and blocks a worker thread
//! may keep running after that; it is detached, not waited for.

use crate::core::error::{PluginError, PluginResult};
use crate::core::logging::operation_span;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

/// Default time an aborted task gets to run its drop glue
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Successful result of a serialized operation
///
/// Holds the executor lock until dropped.
pub struct Execution<T> {
    pub value: T,
    pub generation: u64,
    _guard: OwnedMutexGuard<()>,
}

impl<T> Execution<T> {
    /// Take the value and release the lock
    pub fn into_value(self) -> T {
        self.value
    }
}

/// Serializing, fault-containing executor
#[derive(Debug)]
pub struct SafeExecutor {
    lock: Arc<Mutex<()>>,
    generation: AtomicU64,
    track_memory: bool,
    cancel_grace: Duration,
}

impl SafeExecutor {
    pub fn new(track_memory: bool) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            generation: AtomicU64::new(0),
            track_memory,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Bound how long a timed-out operation may keep the caller waiting
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    /// Generation of the most recently started operation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run `op` exclusively, contained and bounded by `timeout`
    ///
    /// `op` receives a token that is cancelled when the ceiling is hit.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        timeout: Duration,
        op: F,
    ) -> PluginResult<Execution<T>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = PluginResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let span = operation_span(operation, generation);

        let before = self.memory_sample().await;
        let started = Instant::now();
        let token = CancellationToken::new();
        let result = contain(operation, timeout, self.cancel_grace, token.clone(), op(token))
            .instrument(span.clone())
            .await;
        let after = self.memory_sample().await;

        span.in_scope(|| {
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                memory_before = before,
                memory_after = after,
                memory_delta = memory_delta(before, after),
                ok = result.is_ok(),
                "Operation finished"
            )
        });

        result.map(|value| Execution {
            value,
            generation,
            _guard: guard,
        })
    }

    /// Run `fut` with fault and timeout containment but no serialization
    pub async fn isolate<T, Fut>(&self, operation: &str, timeout: Duration, fut: Fut) -> PluginResult<T>
    where
        Fut: Future<Output = PluginResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        contain(operation, timeout, self.cancel_grace, CancellationToken::new(), fut).await
    }

    async fn memory_sample(&self) -> Option<u64> {
        if !self.track_memory {
            return None;
        }
        tokio::task::spawn_blocking(process_memory).await.ok().flatten()
    }
}

impl Default for SafeExecutor {
    fn default() -> Self {
        Self::new(false)
    }
}

async fn contain<T, Fut>(
    operation: &str,
    timeout: Duration,
    grace: Duration,
    token: CancellationToken,
    fut: Fut,
) -> PluginResult<T>
where
    Fut: Future<Output = PluginResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(fut.in_current_span());
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(join_failure(operation, join_error)),
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "Operation timed out; cancelling");
            token.cancel();
            handle.abort();
            if tokio::time::timeout(grace, handle).await.is_err() {
                error!(
                    operation,
                    grace_ms = grace.as_millis() as u64,
                    "Cancelled operation did not stop within grace period; detaching it"
                );
            }
            Err(PluginError::Timeout {
                operation: operation.to_string(),
                after_ms: timeout.as_millis() as u64,
            })
        }
    }
}

fn join_failure(operation: &str, join_error: JoinError) -> PluginError {
    if join_error.is_panic() {
        let message = panic_message(join_error.into_panic());
        error!(operation, panic = %message, "Plugin code panicked");
        PluginError::runtime_fault(format!("{operation} panicked: {message}"))
    } else {
        PluginError::Cancelled(operation.to_string())
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic payload".to_string(),
        },
    }
}

/// Resident memory of this process in bytes
fn process_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let system = sysinfo::System::new_all();
    system.process(pid).map(|process| process.memory())
}

fn memory_delta(before: Option<u64>, after: Option<u64>) -> Option<i64> {
    match (before, after) {
        (Some(before), Some(after)) => Some(after as i64 - before as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[tokio::test]
    async fn test_panic_becomes_runtime_fault() {
        let executor = SafeExecutor::default();
        let result = executor
            .execute("load", Duration::from_secs(1), |_| async {
                if true {
                    panic!("plugin exploded");
                }
                Ok(())
            })
            .await;
        match result {
            Err(PluginError::RuntimeFault(message)) => assert!(message.contains("plugin exploded")),
            Err(other) => panic!("Expected RuntimeFault, got {other:?}"),
            Ok(_) => panic!("Expected RuntimeFault"),
        }

        // Lock was released
        let ok = executor
            .execute("load", Duration::from_secs(1), |_| async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(ok.into_value(), 7);
    }

    #[tokio::test]
    async fn test_timeout_cancels_operation() {
        let executor = SafeExecutor::default();
        let observed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&observed);

        let result = executor
            .execute("reload", Duration::from_millis(50), move |token| async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        seen.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(PluginError::Timeout { ref operation, after_ms: 50 }) if operation == "reload"
        ));
        assert!(executor.generation() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_returns_within_ceiling_plus_grace() {
        let executor = SafeExecutor::default().with_cancel_grace(Duration::from_millis(100));
        let started = Instant::now();

        // Blocks its worker thread, so neither cancel nor abort can stop it
        let result = executor
            .execute("load", Duration::from_millis(50), |_| async {
                std::thread::sleep(Duration::from_secs(3));
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PluginError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        // The lock is usable again right away
        executor
            .execute("load", Duration::from_secs(1), |_| async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_operations_are_serialized() {
        let executor = Arc::new(SafeExecutor::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let executor = Arc::clone(&executor);
            let in_flight = Arc::clone(&in_flight);
            let overlaps = Arc::clone(&overlaps);
            tasks.push(tokio::spawn(async move {
                executor
                    .execute("enable", Duration::from_secs(5), move |_| async move {
                        if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .map(Execution::into_value)
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(executor.generation(), 8);
    }

    #[tokio::test]
    async fn test_lock_held_until_execution_dropped() {
        let executor = Arc::new(SafeExecutor::default());
        let execution = executor
            .execute("load", Duration::from_secs(1), |_| async { Ok(()) })
            .await
            .unwrap();

        let second = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .execute("unload", Duration::from_secs(1), |_| async { Ok(()) })
                    .await
                    .map(|e| e.generation)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(execution);
        assert_eq!(second.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_isolate_contains_panic_without_lock() {
        let executor = SafeExecutor::default();
        let held = executor
            .execute("load", Duration::from_secs(1), |_| async { Ok(()) })
            .await
            .unwrap();

        let result: PluginResult<()> = executor
            .isolate("invoke", Duration::from_secs(1), async {
                if true {
                    panic!("handler bug");
                }
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(PluginError::RuntimeFault(_))));
        drop(held);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }
}
