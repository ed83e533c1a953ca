//! SingleFlight: at most one fetch in flight per key.
//!
//! The first caller to claim a key becomes the leader and must complete it;
//! later callers subscribe to the leader's broadcast and share its result.
//! A leader dropped without completing broadcasts an error, so followers never
//! wait forever on a fetch that was abandoned.

use crate::vfs::error::SharedError;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

type Outcome<V> = Result<V, SharedError>;
type InFlightMap<K, V> = Arc<Mutex<HashMap<K, broadcast::Sender<Outcome<V>>>>>;

pub enum Claim<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    Leader(Leader<K, V>),
    Follower(Follower<V>),
}

pub struct SingleFlight<K, V> {
    in_flight: InFlightMap<K, V>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` unless `ready()` reports it is already available.
    ///
    /// `ready` runs under the in-flight lock, so a leader that publishes its
    /// result before completing can never be missed by a concurrent claim.
    pub fn claim_unless(&self, key: K, ready: impl FnOnce() -> bool) -> Option<Claim<K, V>> {
        let mut guard = self.in_flight.lock().unwrap();
        if ready() {
            return None;
        }
        Some(self.claim_locked(&mut guard, key))
    }

    #[cfg(test)]
    fn claim(&self, key: K) -> Claim<K, V> {
        let mut guard = self.in_flight.lock().unwrap();
        self.claim_locked(&mut guard, key)
    }

    fn claim_locked(
        &self,
        guard: &mut HashMap<K, broadcast::Sender<Outcome<V>>>,
        key: K,
    ) -> Claim<K, V> {
        if let Some(tx) = guard.get(&key) {
            return Claim::Follower(Follower { rx: tx.subscribe() });
        }
        // a single result is ever sent
        let (tx, _) = broadcast::channel(1);
        guard.insert(key.clone(), tx);
        Claim::Leader(Leader {
            key: Some(key),
            in_flight: self.in_flight.clone(),
        })
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

pub struct Leader<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    key: Option<K>,
    in_flight: InFlightMap<K, V>,
}

impl<K, V> Leader<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Release the key and hand `result` to every follower.
    pub fn complete(mut self, result: Outcome<V>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Outcome<V>) {
        let Some(key) = self.key.take() else {
            return;
        };
        let tx = self.in_flight.lock().unwrap().remove(&key);
        if let Some(tx) = tx {
            // no receivers means nobody is waiting
            let _ = tx.send(result);
        }
    }
}

impl<K, V> Drop for Leader<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if self.key.is_some() {
            self.finish(Err(Arc::new(anyhow::anyhow!("fetch abandoned by its leader"))));
        }
    }
}

pub struct Follower<V> {
    rx: broadcast::Receiver<Outcome<V>>,
}

impl<V: Clone> Follower<V> {
    pub async fn wait(mut self) -> Outcome<V> {
        match self.rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(Arc::new(anyhow::anyhow!("singleflight channel closed"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_followers_share_leader_result() {
        let sf: SingleFlight<u64, String> = SingleFlight::new();
        let Claim::Leader(leader) = sf.claim(1) else {
            panic!("first claim must lead");
        };
        let mut followers = Vec::new();
        for _ in 0..5 {
            match sf.claim(1) {
                Claim::Follower(f) => followers.push(tokio::spawn(f.wait())),
                Claim::Leader(_) => panic!("second claim must follow"),
            }
        }
        assert_eq!(sf.in_flight_count(), 1);
        leader.complete(Ok("v".to_string()));
        for f in followers {
            assert_eq!(f.await.unwrap().unwrap(), "v");
        }
        assert_eq!(sf.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_leader_fails_followers() {
        let sf: SingleFlight<u64, u32> = SingleFlight::new();
        let leader = sf.claim(7);
        let Claim::Follower(follower) = sf.claim(7) else {
            panic!("expected follower");
        };
        drop(leader);
        assert!(follower.wait().await.is_err());
        assert!(matches!(sf.claim(7), Claim::Leader(_)));
    }

    #[test]
    fn test_ready_key_is_not_claimed() {
        let sf: SingleFlight<u64, u32> = SingleFlight::new();
        assert!(sf.claim_unless(3, || true).is_none());
        assert_eq!(sf.in_flight_count(), 0);
    }
}
