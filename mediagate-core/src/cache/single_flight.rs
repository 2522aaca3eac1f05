//! Single-flight coalescing of concurrent identical computations.
//!
//! Concurrent cache misses for the same key would each invoke the provider
//! and duplicate minutes of downstream work. A [`FlightGroup`] collapses
//! them: the first caller for a key becomes the leader and runs the
//! computation; everyone else arriving before it settles awaits the shared
//! result over a `watch` channel. The in-flight entry is removed once the
//! computation settles, so later requests start a fresh flight.

use std::future::Future;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::error::GatewayError;

/// Settled result shared with followers. The error side is a message
/// rather than the full error so the payload stays cheaply cloneable.
type SharedResult<V> = Result<V, String>;

type Slot<V> = watch::Receiver<Option<SharedResult<V>>>;

/// Deduplicates concurrent identical in-flight computations.
pub struct FlightGroup<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    inflight: DashMap<K, Slot<V>>,
}

enum Role<V: Clone> {
    Leader(watch::Sender<Option<SharedResult<V>>>),
    Follower(Slot<V>),
}

impl<K, V> FlightGroup<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Run `compute` for `key`, sharing its result with every concurrent
    /// caller of the same key.
    ///
    /// If the leader is dropped before settling (client disconnect during
    /// dispatch), followers receive a provider failure instead of hanging.
    pub async fn run<F, Fut>(&self, key: K, compute: F) -> Result<V, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GatewayError>>,
    {
        // The entry guard must not be held across an await.
        let role = match self.inflight.entry(key.clone()) {
            Entry::Occupied(occupied) => Role::Follower(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Leader(tx) => {
                // Removes the in-flight entry on every exit path, including
                // cancellation of the leader future; dropping `tx` with no
                // value sent wakes followers with a closed-channel error.
                let _slot = FlightSlot {
                    inflight: &self.inflight,
                    key: &key,
                };

                let result = compute().await;
                let shared = match &result {
                    Ok(value) => Ok(value.clone()),
                    Err(err) => Err(err.to_string()),
                };
                // Send fails only when no follower is subscribed.
                let _ = tx.send(Some(shared));
                result
            }
            Role::Follower(mut rx) => {
                debug!("Joining in-flight computation");
                match rx.wait_for(|slot| slot.is_some()).await {
                    Ok(settled) => match (*settled).clone() {
                        Some(Ok(value)) => Ok(value),
                        Some(Err(msg)) => Err(GatewayError::Provider(msg)),
                        None => Err(GatewayError::Provider(
                            "in-flight computation was cancelled".into(),
                        )),
                    },
                    // Sender dropped without settling: the leader was
                    // cancelled mid-computation.
                    Err(_) => Err(GatewayError::Provider(
                        "in-flight computation was cancelled".into(),
                    )),
                }
            }
        }
    }
}

impl<K, V> Default for FlightGroup<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct FlightSlot<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    inflight: &'a DashMap<K, Slot<V>>,
    key: &'a K,
}

impl<K, V> Drop for FlightSlot<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.inflight.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let group: Arc<FlightGroup<String, u64>> = Arc::new(FlightGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("key".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_compute_independently() {
        let group: FlightGroup<String, u64> = FlightGroup::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = group
                .run("key".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(result.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_followers_see_leader_failure() {
        let group: Arc<FlightGroup<String, u64>> = Arc::new(FlightGroup::new());

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("key".to_string(), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(GatewayError::Provider("engine exploded".into()))
                    })
                    .await
            })
        };
        // Let the leader register its flight before the follower joins.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = group
            .run("key".to_string(), || async {
                panic!("follower must not compute");
            })
            .await;

        assert!(matches!(follower, Err(GatewayError::Provider(_))));
        assert!(leader.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_leader_fails_followers_fast() {
        let group: Arc<FlightGroup<String, u64>> = Arc::new(FlightGroup::new());

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("key".to_string(), || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("key".to_string(), || async {
                        panic!("follower must not compute");
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let result = tokio::time::timeout(Duration::from_secs(1), follower)
            .await
            .expect("follower must settle promptly after leader cancellation")
            .unwrap();
        assert!(matches!(result, Err(GatewayError::Provider(_))));
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let group: Arc<FlightGroup<String, u64>> = Arc::new(FlightGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run(format!("key-{i}"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(i)
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
