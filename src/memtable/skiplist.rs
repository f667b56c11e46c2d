//! Arena-backed concurrent skip list.
//!
//! Nodes live in a `Vec` owned by the list; forward links are indices into
//! that arena. Slot `0` is the head sentinel and carries `max_level` links.
//! Removed nodes are returned to a free list and their slots reused by the
//! next insert, so no node is ever shared or leaked.
//!
//! All structural access goes through one `RwLock`:
//! - `get`, `len` and iteration take the shared lock,
//! - `set` and `delete` take the exclusive lock.
//!
//! An [`Iter`] keeps the shared lock for its whole lifetime. Writers block
//! until it is dropped, so the list cannot change under a live cursor.

use std::marker::PhantomData;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::error;

use super::MemtableError;
use crate::key::{KeyOrder, Lexicographic};

const HEAD: usize = 0;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Shape parameters of a [`SkipList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipListConfig {
    /// Upper bound on the number of levels a node may occupy.
    pub max_level: usize,

    /// A node is promoted to the next level with probability `1 / ratio`.
    pub ratio: u32,

    /// Seed for the level generator. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SkipListConfig {
    fn default() -> Self {
        Self {
            max_level: 32,
            ratio: 4,
            seed: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

struct Node<V> {
    key: Vec<u8>,
    value: Option<V>,
    next: Vec<Option<usize>>,
}

struct Inner<V> {
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
    current_level: usize,
    len: usize,
    rng: StdRng,
}

impl<V> Inner<V> {
    /// Walks from the head down to level 0.
    ///
    /// Returns the per-level predecessors of `key` and the level-0 successor
    /// of the last predecessor, i.e. the first node whose key is `>= key`.
    fn find<O: KeyOrder>(&self, key: &[u8], max_level: usize) -> (Vec<usize>, Option<usize>) {
        let mut update = vec![HEAD; max_level];
        let mut prev = HEAD;
        let mut candidate = None;

        for level in (0..self.current_level).rev() {
            let mut next = self.nodes[prev].next[level];
            while let Some(idx) = next {
                if !O::less(&self.nodes[idx].key, key) {
                    break;
                }
                prev = idx;
                next = self.nodes[idx].next[level];
            }
            update[level] = prev;
            candidate = next;
        }

        (update, candidate)
    }

    fn matches(&self, candidate: Option<usize>, key: &[u8]) -> Option<usize> {
        candidate.filter(|&idx| self.nodes[idx].key.as_slice() == key)
    }

    fn random_level(&mut self, max_level: usize, ratio: u32) -> usize {
        let mut level = 1;
        while level < max_level && self.rng.random_ratio(1, ratio) {
            level += 1;
        }
        level
    }

    fn alloc(&mut self, node: Node<V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SkipList
// ------------------------------------------------------------------------------------------------

/// A sorted map from byte-string keys to `V`, ordered by `O`.
pub struct SkipList<V, O: KeyOrder = Lexicographic> {
    inner: RwLock<Inner<V>>,
    max_level: usize,
    ratio: u32,
    _order: PhantomData<O>,
}

impl<V: Clone, O: KeyOrder> SkipList<V, O> {
    /// Creates an empty list.
    ///
    /// `max_level` is clamped to at least 1 and `ratio` to at least 2.
    pub fn new(config: SkipListConfig) -> Self {
        let max_level = config.max_level.max(1);
        let ratio = config.ratio.max(2);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let head = Node {
            key: Vec::new(),
            value: None,
            next: vec![None; max_level],
        };

        Self {
            inner: RwLock::new(Inner {
                nodes: vec![head],
                free: Vec::new(),
                current_level: 0,
                len: 0,
                rng,
            }),
            max_level,
            ratio,
            _order: PhantomData,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner<V>>, MemtableError> {
        self.inner.read().map_err(|_| {
            error!("Skip list lock poisoned (read)");
            MemtableError::Internal("RwLock poisoned".into())
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner<V>>, MemtableError> {
        self.inner.write().map_err(|_| {
            error!("Skip list lock poisoned (write)");
            MemtableError::Internal("RwLock poisoned".into())
        })
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<V>, MemtableError> {
        let guard = self.read()?;
        let (_, candidate) = guard.find::<O>(key, self.max_level);
        Ok(guard
            .matches(candidate, key)
            .and_then(|idx| guard.nodes[idx].value.clone()))
    }

    /// Inserts or overwrites `key`. Returns the value it replaced.
    pub fn set(&self, key: Vec<u8>, value: V) -> Result<Option<V>, MemtableError> {
        let mut guard = self.write()?;
        let (mut update, candidate) = guard.find::<O>(&key, self.max_level);

        if let Some(idx) = guard.matches(candidate, &key) {
            return Ok(guard.nodes[idx].value.replace(value));
        }

        let level = guard.random_level(self.max_level, self.ratio);
        if level > guard.current_level {
            for slot in update.iter_mut().take(level).skip(guard.current_level) {
                *slot = HEAD;
            }
            guard.current_level = level;
        }

        let idx = guard.alloc(Node {
            key,
            value: Some(value),
            next: vec![None; level],
        });

        for (lvl, &prev) in update.iter().enumerate().take(level) {
            let succ = guard.nodes[prev].next[lvl];
            guard.nodes[idx].next[lvl] = succ;
            guard.nodes[prev].next[lvl] = Some(idx);
        }

        guard.len += 1;
        Ok(None)
    }

    /// Unlinks `key` from every level. Returns the removed value, or
    /// `None` if the key was absent.
    pub fn delete(&self, key: &[u8]) -> Result<Option<V>, MemtableError> {
        let mut guard = self.write()?;
        let (update, candidate) = guard.find::<O>(key, self.max_level);

        let Some(idx) = guard.matches(candidate, key) else {
            return Ok(None);
        };

        let links = std::mem::take(&mut guard.nodes[idx].next);
        for (lvl, succ) in links.into_iter().enumerate() {
            let prev = update[lvl];
            if guard.nodes[prev].next[lvl] == Some(idx) {
                guard.nodes[prev].next[lvl] = succ;
            }
        }

        while guard.current_level > 0 && guard.nodes[HEAD].next[guard.current_level - 1].is_none()
        {
            guard.current_level -= 1;
        }

        let removed = guard.nodes[idx].value.take();
        guard.nodes[idx].key = Vec::new();
        guard.free.push(idx);
        guard.len -= 1;
        Ok(removed)
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize, MemtableError> {
        Ok(self.read()?.len)
    }

    /// `true` when the list holds no keys.
    pub fn is_empty(&self) -> Result<bool, MemtableError> {
        Ok(self.len()? == 0)
    }

    /// Number of levels currently in use.
    #[cfg(test)]
    pub(crate) fn current_level(&self) -> Result<usize, MemtableError> {
        Ok(self.read()?.current_level)
    }

    /// Forward cursor over level 0, in ascending key order.
    pub fn iter(&self) -> Result<Iter<'_, V>, MemtableError> {
        let guard = self.read()?;
        let next = guard.nodes[HEAD].next.first().copied().flatten();
        Ok(Iter { guard, next })
    }

    /// Consumes the list, returning every entry in ascending key order.
    #[cfg(test)]
    pub(crate) fn into_sorted_vec(self) -> Result<Vec<(Vec<u8>, V)>, MemtableError> {
        let mut inner = self.inner.into_inner().map_err(|_| {
            error!("Skip list lock poisoned (into_inner)");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        let mut out = Vec::with_capacity(inner.len);
        let mut next = inner.nodes[HEAD].next.first().copied().flatten();
        while let Some(idx) = next {
            let node = &mut inner.nodes[idx];
            next = node.next[0];
            if let Some(value) = node.value.take() {
                out.push((std::mem::take(&mut node.key), value));
            }
        }
        Ok(out)
    }

    /// Checks the level-ordering invariant. Test support only.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> bool {
        let Ok(guard) = self.read() else {
            return false;
        };

        let mut level0 = Vec::new();
        let mut next = guard.nodes[HEAD].next[0];
        while let Some(idx) = next {
            level0.push(idx);
            next = guard.nodes[idx].next[0];
        }
        if level0.len() != guard.len {
            return false;
        }

        for level in 0..guard.current_level {
            let mut prev: Option<&[u8]> = None;
            let mut next = guard.nodes[HEAD].next[level];
            while let Some(idx) = next {
                let key = guard.nodes[idx].key.as_slice();
                if prev.is_some_and(|p| !O::less(p, key)) || !level0.contains(&idx) {
                    return false;
                }
                prev = Some(key);
                next = guard.nodes[idx].next[level];
            }
        }

        (guard.current_level..self.max_level).all(|lvl| guard.nodes[HEAD].next[lvl].is_none())
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Level-0 cursor returned by [`SkipList::iter`].
///
/// Holds the list's shared lock until dropped.
pub struct Iter<'a, V> {
    guard: RwLockReadGuard<'a, Inner<V>>,
    next: Option<usize>,
}

impl<V: Clone> Iterator for Iter<'_, V> {
    type Item = (Vec<u8>, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let idx = self.next?;
            let node = &self.guard.nodes[idx];
            self.next = node.next[0];
            if let Some(value) = &node.value {
                return Some((node.key.clone(), value.clone()));
            }
        }
    }
}
