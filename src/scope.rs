//! Instance scopes: per-factory-id caches with disposal tracking.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{DiError, DiResult};
use crate::factory::FactoryId;
use crate::hash_trie::HashTrie;
use crate::Object;

#[cfg(feature = "logging")]
use tracing::debug;

/// Teardown hook for a scoped instance.
pub type DisposerFn = Arc<dyn Fn(&Object) + Send + Sync>;

/// An id-to-instance cache bounded by a container or by a single top-level
/// resolution.
///
/// `get_or_add` constructs at most once per factory id: each id owns a
/// `OnceCell` fetched under the scope mutex, so concurrent callers for the
/// same id block on the cell while distinct ids (including nested scoped
/// dependencies) initialize independently.
pub struct Scope {
    id: u64,
    items: Mutex<HashTrie<FactoryId, Arc<OnceCell<Object>>>>,
    disposers: Mutex<Vec<(Object, DisposerFn)>>,
    disposed: AtomicBool,
}

impl Scope {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "logging")]
        debug!(target: "armature_ioc", scope_id = id, "opening scope");

        Self {
            id,
            items: Mutex::new(HashTrie::new()),
            disposers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Fetch the instance for `id`, constructing it with `create` if absent.
    ///
    /// `create` runs at most once per id; a failed construction leaves the
    /// slot empty so a later caller may retry. The disposer is tracked only
    /// for the call that actually constructed the instance.
    pub fn get_or_add(
        &self,
        id: FactoryId,
        create: impl FnOnce() -> DiResult<Object>,
        disposer: Option<&DisposerFn>,
    ) -> DiResult<Object> {
        let cell = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_disposed() {
                return Err(DiError::ScopeIsDisposed { scope: self.to_string() });
            }
            match items.get(&id) {
                Some(cell) => cell.clone(),
                None => {
                    let cell = Arc::new(OnceCell::new());
                    *items = items.insert(id, cell.clone());
                    cell
                }
            }
        };

        let mut created = false;
        let object = cell
            .get_or_try_init(|| {
                let object = create()?;
                created = true;
                Ok::<_, DiError>(object)
            })?
            .clone();

        if created {
            if let Some(disposer) = disposer {
                self.disposers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((object.clone(), disposer.clone()));
            }
        }
        Ok(object)
    }

    /// Tear the scope down, running disposers in insertion order.
    ///
    /// Idempotent: only the first call observes the disposer list.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "logging")]
        debug!(target: "armature_ioc", scope_id = self.id, "disposing scope");

        {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            *items = HashTrie::new();
        }
        let disposers =
            std::mem::take(&mut *self.disposers.lock().unwrap_or_else(PoisonError::into_inner));
        for (object, dispose) in disposers {
            dispose(&object);
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope-{}", self.id)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn object(value: u32) -> Object {
        Arc::new(value)
    }

    #[test]
    fn constructs_once_per_id() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let scope = Scope::new();

        let a = scope
            .get_or_add(7, || {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(object(1))
            }, None)
            .unwrap();
        let b = scope.get_or_add(7, || Ok(object(2)), None).unwrap();

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn failed_construction_can_retry() {
        let scope = Scope::new();
        let err = scope.get_or_add(1, || {
            Err(DiError::unable_to_resolve("nope"))
        }, None);
        assert!(err.is_err());

        let ok = scope.get_or_add(1, || Ok(object(3)), None).unwrap();
        assert_eq!(*ok.downcast::<u32>().unwrap(), 3);
    }

    #[test]
    fn dispose_runs_disposers_once_in_order() {
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();

        for id in 0..3u32 {
            let order = Arc::clone(&order);
            let disposer: DisposerFn = Arc::new(move |obj| {
                let value = *obj.clone().downcast::<u32>().unwrap();
                order.lock().unwrap().push(value);
            });
            scope.get_or_add(id, || Ok(object(id)), Some(&disposer)).unwrap();
        }

        scope.dispose();
        scope.dispose();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn disposed_scope_rejects_access() {
        let scope = Scope::new();
        scope.dispose();
        let err = scope.get_or_add(1, || Ok(object(1)), None).unwrap_err();
        assert!(matches!(err, DiError::ScopeIsDisposed { .. }));
    }

    #[test]
    fn concurrent_get_or_add_is_single_construction() {
        let scope = Arc::new(Scope::new());
        let calls = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let scope = Arc::clone(&scope);
            let calls = Arc::clone(&calls);
            handles.push(std::thread::spawn(move || {
                scope
                    .get_or_add(42, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(object(9))
                    }, None)
                    .unwrap()
            }));
        }
        let results: Vec<Object> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
    }
}
