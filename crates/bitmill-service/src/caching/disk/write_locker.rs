use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

#[derive(Default)]
struct WriteLock {
    held: Mutex<bool>,
    released: Condvar,
}

struct Entry {
    lock: Arc<WriteLock>,
    interested: usize,
}

/// Serializes writes of the same key.
///
/// Per-key locks are created on demand, and dropped again once no writer is interested in
/// them anymore.
#[derive(Default)]
pub(crate) struct DiskCacheWriteLocker {
    locks: Mutex<HashMap<String, Entry>>,
}

impl DiskCacheWriteLocker {
    /// Blocks until no other writer holds the lock for `key`.
    pub fn acquire(&self, key: &str) -> WriteGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = locks.entry(key.to_owned()).or_insert_with(|| Entry {
                lock: Arc::default(),
                interested: 0,
            });
            entry.interested += 1;
            Arc::clone(&entry.lock)
        };

        let mut held = lock.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = lock
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
        drop(held);

        WriteGuard {
            locker: self,
            key: key.to_owned(),
            lock,
        }
    }

    fn release(&self, key: &str, lock: &WriteLock) {
        *lock.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        lock.released.notify_one();

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = locks.get_mut(key) {
            entry.interested -= 1;
            if entry.interested == 0 {
                locks.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Releases the per-key lock when dropped.
pub(crate) struct WriteGuard<'a> {
    locker: &'a DiskCacheWriteLocker,
    key: String,
    lock: Arc<WriteLock>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.locker.release(&self.key, &self.lock);
    }
}
