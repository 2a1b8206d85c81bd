//! Persistent hash-keyed AVL trie backing the resolution caches.
//!
//! The trie is purely functional: `insert` and `remove` return a new root
//! sharing unchanged subtrees with the old one. Writers publish new roots
//! through [`AtomicTrie`] with a bounded compare-and-swap loop, so readers
//! load a consistent snapshot without taking any lock.

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::{DiError, DiResult};

/// Retry bound for the atomic root swap.
const MAX_SWAP_RETRIES: usize = 50;

static HASHER: Lazy<ahash::RandomState> =
    Lazy::new(|| ahash::RandomState::with_seeds(0x9e37, 0x79b9, 0x7f4a, 0x7c15));

/// Hash a key with the process-wide deterministic hasher.
///
/// Hashes are stored inside trie nodes and must match across snapshots,
/// so the hasher seeds are fixed for the process lifetime.
#[inline]
pub(crate) fn hash_of<T: Hash>(value: &T) -> u64 {
    HASHER.hash_one(value)
}

/// Key contract for trie storage.
///
/// Integer keys hash to themselves, which keeps in-order traversal in key
/// order for id-keyed tries (the factory-expression cache relies on this).
pub trait TrieKey: Eq + Clone {
    fn trie_hash(&self) -> u64;
}

impl TrieKey for u32 {
    #[inline]
    fn trie_hash(&self) -> u64 {
        u64::from(*self)
    }
}

impl TrieKey for usize {
    #[inline]
    fn trie_hash(&self) -> u64 {
        *self as u64
    }
}

struct Node<K, V> {
    hash: u64,
    key: K,
    value: V,
    /// Entries whose key hashes collide with `hash`
    conflicts: Vec<(K, V)>,
    left: HashTrie<K, V>,
    right: HashTrie<K, V>,
    height: u32,
}

/// Immutable AVL tree balanced by key hash, with per-node conflict lists.
pub struct HashTrie<K, V> {
    root: Option<Arc<Node<K, V>>>,
}

impl<K, V> Clone for HashTrie<K, V> {
    fn clone(&self) -> Self {
        Self { root: self.root.clone() }
    }
}

impl<K, V> Default for HashTrie<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> HashTrie<K, V> {
    #[inline]
    pub fn new() -> Self {
        Self { root: None }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    #[inline]
    fn height(&self) -> u32 {
        self.root.as_ref().map_or(0, |n| n.height)
    }
}

impl<K: TrieKey, V: Clone> HashTrie<K, V> {
    /// Look up a value by key.
    pub fn get(&self, key: &K) -> Option<&V> {
        let hash = key.trie_hash();
        let mut current = self.root.as_ref();
        while let Some(node) = current {
            if hash < node.hash {
                current = node.left.root.as_ref();
            } else if hash > node.hash {
                current = node.right.root.as_ref();
            } else if node.key == *key {
                return Some(&node.value);
            } else {
                return node.conflicts.iter().find(|(k, _)| k == key).map(|(_, v)| v);
            }
        }
        None
    }

    /// Return a new trie with `key` bound to `value`.
    ///
    /// An existing binding for the same key is replaced.
    pub fn insert(&self, key: K, value: V) -> Self {
        let hash = key.trie_hash();
        self.inserted(hash, key, value)
    }

    fn inserted(&self, hash: u64, key: K, value: V) -> Self {
        let Some(node) = self.root.as_ref() else {
            return make_node(hash, key, value, Vec::new(), Self::new(), Self::new());
        };
        if hash < node.hash {
            balanced(
                node.hash,
                node.key.clone(),
                node.value.clone(),
                node.conflicts.clone(),
                node.left.inserted(hash, key, value),
                node.right.clone(),
            )
        } else if hash > node.hash {
            balanced(
                node.hash,
                node.key.clone(),
                node.value.clone(),
                node.conflicts.clone(),
                node.left.clone(),
                node.right.inserted(hash, key, value),
            )
        } else if node.key == key {
            make_node(hash, key, value, node.conflicts.clone(), node.left.clone(), node.right.clone())
        } else {
            let mut conflicts = node.conflicts.clone();
            match conflicts.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => conflicts.push((key, value)),
            }
            make_node(
                hash,
                node.key.clone(),
                node.value.clone(),
                conflicts,
                node.left.clone(),
                node.right.clone(),
            )
        }
    }

    /// Return a new trie without a binding for `key`.
    pub fn remove(&self, key: &K) -> Self {
        let hash = key.trie_hash();
        self.removed(hash, key)
    }

    fn removed(&self, hash: u64, key: &K) -> Self {
        let Some(node) = self.root.as_ref() else {
            return self.clone();
        };
        if hash < node.hash {
            balanced(
                node.hash,
                node.key.clone(),
                node.value.clone(),
                node.conflicts.clone(),
                node.left.removed(hash, key),
                node.right.clone(),
            )
        } else if hash > node.hash {
            balanced(
                node.hash,
                node.key.clone(),
                node.value.clone(),
                node.conflicts.clone(),
                node.left.clone(),
                node.right.removed(hash, key),
            )
        } else if node.key == *key {
            if let Some(((pk, pv), rest)) = node.conflicts.split_first() {
                // Promote a conflict entry into the vacated node slot
                return make_node(
                    hash,
                    pk.clone(),
                    pv.clone(),
                    rest.to_vec(),
                    node.left.clone(),
                    node.right.clone(),
                );
            }
            self.without_node(node)
        } else {
            let mut conflicts = node.conflicts.clone();
            conflicts.retain(|(k, _)| k != key);
            make_node(
                hash,
                node.key.clone(),
                node.value.clone(),
                conflicts,
                node.left.clone(),
                node.right.clone(),
            )
        }
    }

    fn without_node(&self, node: &Node<K, V>) -> Self {
        if node.right.is_empty() {
            return node.left.clone();
        }
        if node.left.is_empty() {
            return node.right.clone();
        }
        let successor = node.right.leftmost();
        balanced(
            successor.hash,
            successor.key.clone(),
            successor.value.clone(),
            successor.conflicts.clone(),
            node.left.clone(),
            node.right.removed(successor.hash, &successor.key),
        )
    }

    fn leftmost(&self) -> &Arc<Node<K, V>> {
        let mut node = self.root.as_ref().expect("leftmost of empty trie");
        while let Some(left) = node.left.root.as_ref() {
            node = left;
        }
        node
    }

    /// In-order traversal: entries sorted by hash, conflicts following
    /// their node's main entry.
    pub fn for_each(&self, f: &mut impl FnMut(&K, &V)) {
        if let Some(node) = self.root.as_ref() {
            node.left.for_each(f);
            f(&node.key, &node.value);
            for (k, v) in &node.conflicts {
                f(k, v);
            }
            node.right.for_each(f);
        }
    }

    /// Collect all entries in traversal order.
    pub fn entries(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        self.for_each(&mut |k, v| out.push((k.clone(), v.clone())));
        out
    }
}

fn make_node<K, V>(
    hash: u64,
    key: K,
    value: V,
    conflicts: Vec<(K, V)>,
    left: HashTrie<K, V>,
    right: HashTrie<K, V>,
) -> HashTrie<K, V> {
    let height = 1 + left.height().max(right.height());
    HashTrie {
        root: Some(Arc::new(Node { hash, key, value, conflicts, left, right, height })),
    }
}

fn balanced<K: TrieKey, V: Clone>(
    hash: u64,
    key: K,
    value: V,
    conflicts: Vec<(K, V)>,
    left: HashTrie<K, V>,
    right: HashTrie<K, V>,
) -> HashTrie<K, V> {
    let lh = left.height();
    let rh = right.height();
    if lh > rh + 1 {
        let l = left.root.as_ref().expect("left-heavy trie has a left node");
        if l.left.height() >= l.right.height() {
            // Single right rotation
            let new_right = make_node(hash, key, value, conflicts, l.right.clone(), right);
            make_node(l.hash, l.key.clone(), l.value.clone(), l.conflicts.clone(), l.left.clone(), new_right)
        } else {
            // Left-right double rotation
            let lr = l.right.root.as_ref().expect("left-right subtree present");
            let new_left = make_node(
                l.hash,
                l.key.clone(),
                l.value.clone(),
                l.conflicts.clone(),
                l.left.clone(),
                lr.left.clone(),
            );
            let new_right = make_node(hash, key, value, conflicts, lr.right.clone(), right);
            make_node(lr.hash, lr.key.clone(), lr.value.clone(), lr.conflicts.clone(), new_left, new_right)
        }
    } else if rh > lh + 1 {
        let r = right.root.as_ref().expect("right-heavy trie has a right node");
        if r.right.height() >= r.left.height() {
            // Single left rotation
            let new_left = make_node(hash, key, value, conflicts, left, r.left.clone());
            make_node(r.hash, r.key.clone(), r.value.clone(), r.conflicts.clone(), new_left, r.right.clone())
        } else {
            // Right-left double rotation
            let rl = r.left.root.as_ref().expect("right-left subtree present");
            let new_left = make_node(hash, key, value, conflicts, left, rl.left.clone());
            let new_right = make_node(
                r.hash,
                r.key.clone(),
                r.value.clone(),
                r.conflicts.clone(),
                rl.right.clone(),
                r.right.clone(),
            );
            make_node(rl.hash, rl.key.clone(), rl.value.clone(), rl.conflicts.clone(), new_left, new_right)
        }
    } else {
        make_node(hash, key, value, conflicts, left, right)
    }
}

/// Atomically swappable trie root.
///
/// Readers `load` the current snapshot without blocking; writers rebuild
/// from the latest snapshot and publish by compare-and-swap, retrying on
/// contention. Redundant rebuilds under contention are idempotent.
pub struct AtomicTrie<K, V> {
    root: ArcSwap<HashTrie<K, V>>,
}

impl<K, V> Default for AtomicTrie<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> AtomicTrie<K, V> {
    pub fn new() -> Self {
        Self { root: ArcSwap::from_pointee(HashTrie::new()) }
    }

    /// Load the current snapshot.
    #[inline]
    pub fn load(&self) -> Arc<HashTrie<K, V>> {
        self.root.load_full()
    }
}

impl<K: TrieKey, V: Clone> AtomicTrie<K, V> {
    /// Publish `update(current)` as the new root.
    ///
    /// Bounded retry loop; fails with `RetryExhausted` rather than
    /// livelocking under pathological contention.
    pub fn swap(&self, update: impl Fn(&HashTrie<K, V>) -> HashTrie<K, V>) -> DiResult<()> {
        for _ in 0..MAX_SWAP_RETRIES {
            let current = self.root.load();
            let next = Arc::new(update(&current));
            let previous = self.root.compare_and_swap(&*current, next);
            if Arc::ptr_eq(&previous, &current) {
                return Ok(());
            }
        }
        Err(DiError::RetryExhausted { attempts: MAX_SWAP_RETRIES })
    }
}
