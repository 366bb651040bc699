//! Blocking registry: key -> value, where a lookup for a key that has no value yet waits
//! (bounded) for a later `put`.
//!
//! Frames for one image can arrive on different connections with no ordering guarantee, so a
//! DATA or HEADER frame may be looked up before its START has been published. Each slot is
//! either pending (a list of parked waiters) or resolved (a value). One mutex covers the
//! check-then-install step; every waiter parks on its own oneshot channel, so the mutex is
//! never held while waiting.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

enum Entry<V> {
    Pending(Vec<oneshot::Sender<V>>),
    Resolved(V),
}

pub struct Registry<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `value` unconditionally and release every caller parked in `get` for `key`.
    /// Returns the resolved value this one replaced, if any.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let mut entries = self.lock();
        match entries.insert(key, Entry::Resolved(value.clone())) {
            Some(Entry::Pending(waiters)) => {
                for tx in waiters {
                    // Receiver gone means that waiter already timed out.
                    let _ = tx.send(value.clone());
                }
                None
            }
            Some(Entry::Resolved(prev)) => Some(prev),
            None => None,
        }
    }

    /// Return the value for `key`, waiting up to `timeout` for a `put` if there is none yet.
    /// `None` means nothing was published in time.
    pub async fn get(&self, key: &K, timeout: Duration) -> Option<V> {
        let rx = {
            let mut entries = self.lock();
            let (tx, rx) = oneshot::channel();
            match entries.get_mut(key) {
                Some(Entry::Resolved(v)) => return Some(v.clone()),
                Some(Entry::Pending(waiters)) => {
                    waiters.retain(|w| !w.is_closed());
                    waiters.push(tx);
                }
                None => {
                    entries.insert(key.clone(), Entry::Pending(vec![tx]));
                }
            }
            rx
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(v)) => Some(v),
            _ => {
                self.prune_pending(key);
                None
            }
        }
    }

    /// Delete the entry for `key`. Parked waiters are not woken: they stay parked under the
    /// key until their own timeout or a later `put`.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        match entries.remove(key) {
            Some(Entry::Resolved(v)) => Some(v),
            Some(Entry::Pending(mut waiters)) => {
                waiters.retain(|w| !w.is_closed());
                if !waiters.is_empty() {
                    entries.insert(key.clone(), Entry::Pending(waiters));
                }
                None
            }
            None => None,
        }
    }

    /// Remove the resolved value for `key` only if `pred` accepts it.
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut entries = self.lock();
        let accept = match entries.get(key) {
            Some(Entry::Resolved(v)) => pred(v),
            _ => false,
        };
        if !accept {
            return None;
        }
        match entries.remove(key) {
            Some(Entry::Resolved(v)) => Some(v),
            _ => None,
        }
    }

    /// Point-in-time copy of the resolved entries. Pending placeholders are excluded.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.lock()
            .iter()
            .filter_map(|(k, e)| match e {
                Entry::Resolved(v) => Some((k.clone(), v.clone())),
                Entry::Pending(_) => None,
            })
            .collect()
    }

    /// Drop a pending placeholder once no live waiter is left on it.
    fn prune_pending(&self, key: &K) {
        let mut entries = self.lock();
        if let Some(Entry::Pending(waiters)) = entries.get_mut(key) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                entries.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn pending_waiters(&self, key: &K) -> Option<usize> {
        match self.lock().get(key) {
            Some(Entry::Pending(w)) => Some(w.iter().filter(|t| !t.is_closed()).count()),
            _ => None,
        }
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
