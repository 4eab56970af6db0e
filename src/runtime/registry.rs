//! Registry of live connections.
//!
//! Connections live in a slab and are threaded onto a circular doubly-linked
//! list through a sentinel slot that holds no connection. Links are slab
//! keys, so insert and remove are O(1) and a key stays valid for exactly as
//! long as its connection is registered.
//!
//! Traversal goes through a `PeerCursor`, which captures the successor of a
//! member before yielding it. The caller may therefore remove the member it
//! was just handed without derailing the walk.

use slab::Slab;

struct Node<T> {
    prev: usize,
    next: usize,
    /// `None` only for the sentinel.
    value: Option<T>,
}

/// Ring of registered values rooted at a sentinel.
pub struct ConnectionRegistry<T> {
    nodes: Slab<Node<T>>,
    head: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create an empty registry with room for `capacity` members.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Slab::with_capacity(capacity + 1);
        let entry = nodes.vacant_entry();
        let head = entry.key();
        entry.insert(Node {
            prev: head,
            next: head,
            value: None,
        });
        Self { nodes, head }
    }

    /// Link `value` directly after the sentinel and return its key.
    pub fn insert(&mut self, value: T) -> usize {
        let head = self.head;
        let next = self.nodes[head].next;
        let key = self.nodes.insert(Node {
            prev: head,
            next,
            value: Some(value),
        });
        self.nodes[next].prev = key;
        self.nodes[head].next = key;
        key
    }

    /// Unlink a member and hand back its value.
    ///
    /// Returns `None` for unknown keys and for the sentinel.
    pub fn remove(&mut self, key: usize) -> Option<T> {
        if key == self.head || !self.nodes.contains(key) {
            return None;
        }
        let node = self.nodes.remove(key);
        self.nodes[node.prev].next = node.next;
        self.nodes[node.next].prev = node.prev;
        node.value
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        self.nodes.get(key).and_then(|node| node.value.as_ref())
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        self.nodes.get_mut(key).and_then(|node| node.value.as_mut())
    }

    pub fn contains(&self, key: usize) -> bool {
        self.get(key).is_some()
    }

    /// Number of registered members (the sentinel is not counted).
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of all members in ring order, starting after the sentinel.
    pub fn keys(&self) -> Vec<usize> {
        let mut cursor = PeerCursor {
            stop: self.head,
            next: self.nodes[self.head].next,
        };
        std::iter::from_fn(|| cursor.next(self)).collect()
    }

    /// Walk every member except `key`, starting with its successor.
    ///
    /// `key` must be registered.
    pub fn peers_of(&self, key: usize) -> PeerCursor {
        debug_assert!(self.contains(key), "cursor from an unregistered key");
        PeerCursor {
            stop: key,
            next: self.nodes[key].next,
        }
    }
}

/// Removal-tolerant walk over the ring.
///
/// Not tied to a borrow of the registry, so the registry can be mutated
/// between steps. Removing the member most recently yielded is allowed;
/// removing any other member mid-walk (including the one the walk started
/// from) is not.
#[derive(Debug, Clone, Copy)]
pub struct PeerCursor {
    stop: usize,
    next: usize,
}

impl PeerCursor {
    /// Yield the next member key, skipping the sentinel.
    pub fn next<T>(&mut self, registry: &ConnectionRegistry<T>) -> Option<usize> {
        loop {
            if self.next == self.stop {
                return None;
            }
            let key = self.next;
            self.next = registry.nodes[key].next;
            if key != registry.head {
                return Some(key);
            }
        }
    }
}
