//! Per-key async mutexes. A key's entry lives only while some task holds or waits on
//! it, so the map stays as small as the number of keys in flight.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    holders: usize,
}

type Slots<K> = Arc<Mutex<HashMap<K, Slot>>>;

pub struct KeyedLocks<K> {
    slots: Slots<K>,
}

impl<K> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits for exclusive access to `key`. Dropping the guard, or dropping the future
    /// while it is still waiting, gives the slot up.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let lock = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                holders: 0,
            });
            slot.holders += 1;
            slot.lock.clone()
        };
        let registration = Registration {
            slots: self.slots.clone(),
            key,
        };

        let guard = lock.lock_owned().await;
        KeyedGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

struct Registration<K: Eq + Hash> {
    slots: Slots<K>,
    key: K,
}

impl<K: Eq + Hash> Drop for Registration<K> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        let unused = match slots.get_mut(&self.key) {
            Some(slot) => {
                slot.holders -= 1;
                slot.holders == 0
            }
            None => false,
        };
        if unused {
            slots.remove(&self.key);
        }
    }
}

pub struct KeyedGuard<K: Eq + Hash> {
    _guard: OwnedMutexGuard<()>,
    _registration: Registration<K>,
}
