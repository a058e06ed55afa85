//! Striped in-process locks keyed by entity id.
//!
//! Serializes read-modify-write on one budget or milestone inside this
//! process. Other replicas are held off by the store's version check.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const DEFAULT_STRIPES: usize = 64;

pub struct EntityLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for EntityLocks {
    fn default() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }
}

impl EntityLocks {
    pub fn with_stripes(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Held for the whole operation; two ids may share a stripe.
    pub async fn lock(&self, id: Uuid) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[index].lock().await
    }
}
