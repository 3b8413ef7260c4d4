//! Key-level creation locks.
//!
//! Several threads can race to create the same cache metadata entry (a file
//! id, a data-set record). The lock map gives the first arrival the right
//! to create; everyone else blocks on that key's waiter and receives the
//! value the creator published. Keys are independent: creation of one key
//! never blocks another.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::Result;

struct Waiter<V> {
    slot: Mutex<Option<Result<V>>>,
    ready: Condvar,
}

pub struct LockKeyMap<K, V> {
    inflight: Mutex<HashMap<K, Arc<Waiter<V>>>>,
}

impl<K, V> LockKeyMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `create` exactly once per concurrent burst for `key`; late
    /// arrivals wait and observe the published result. The entry is removed
    /// once published, so a failed creation can be retried by the next
    /// caller.
    pub fn get_or_create(&self, key: K, create: impl FnOnce() -> Result<V>) -> Result<V> {
        let (waiter, creator) = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(&key) {
                Some(waiter) => (waiter.clone(), false),
                None => {
                    let waiter = Arc::new(Waiter {
                        slot: Mutex::new(None),
                        ready: Condvar::new(),
                    });
                    inflight.insert(key.clone(), waiter.clone());
                    (waiter, true)
                }
            }
        };

        if creator {
            let result = create();
            {
                let mut slot = waiter.slot.lock().unwrap();
                *slot = Some(result.clone());
            }
            waiter.ready.notify_all();
            self.inflight.lock().unwrap().remove(&key);
            result
        } else {
            let mut slot = waiter.slot.lock().unwrap();
            while slot.is_none() {
                slot = waiter.ready.wait(slot).unwrap();
            }
            slot.as_ref().unwrap().clone()
        }
    }
}

impl<K, V> Default for LockKeyMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
