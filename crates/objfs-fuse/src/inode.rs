//! Inode management for the FUSE filesystem.
//!
//! The kernel refers to nodes by inode number. [`NodeTable`] maps those
//! numbers back to live [`Node`]s and tracks the FUSE `nlookup` count of
//! each, evicting a node when the kernel forgets its last reference.
//!
//! Inode numbers are path hashes, so a node produced by a new listing or
//! lookup may collide with one already in the table. The table keeps the
//! existing instance (refreshing its attributes) so that every caller shares
//! one node per path.

use crate::error::{FuseError, FuseResult};
use crate::identity::ROOT_INODE;
use crate::node::Node;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
struct TableEntry {
    node: Arc<Node>,
    /// Lookup count for proper `forget()` handling.
    nlookup: u64,
}

/// Thread-safe table of kernel-visible nodes.
#[derive(Debug)]
pub struct NodeTable {
    nodes: DashMap<u64, TableEntry>,
}

impl NodeTable {
    /// Creates a table holding the root node, which is never evicted.
    pub fn new(root: Arc<Node>) -> Self {
        let nodes = DashMap::new();
        nodes.insert(ROOT_INODE, TableEntry { node: root, nlookup: 1 });
        Self { nodes }
    }

    /// Recovers the node for an inode number.
    ///
    /// # Panics
    ///
    /// Panics if the stored node has an empty path.
    pub fn get(&self, ino: u64) -> FuseResult<Arc<Node>> {
        let node = self
            .nodes
            .get(&ino)
            .map(|e| Arc::clone(&e.node))
            .ok_or(FuseError::InvalidInode(ino))?;
        assert!(!node.path().is_empty(), "inode {ino} recovered with empty path");
        Ok(node)
    }

    /// Registers `node` and counts one kernel lookup on it.
    ///
    /// If the inode is already registered, an existing node of the same kind
    /// and path is kept and takes over the new node's attributes if they are
    /// fresh. A node whose kind changed (file became directory) is replaced.
    pub fn attach(&self, node: Arc<Node>) -> Arc<Node> {
        let ino = node.ino();
        let existing = match self.nodes.entry(ino) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.nlookup += 1;
                swap_if_changed(entry, &node)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TableEntry {
                    node: Arc::clone(&node),
                    nlookup: 1,
                });
                None
            }
        };
        settle(existing, node)
    }

    /// The registered node for `node`'s inode, without registering anything.
    ///
    /// Same reuse and replacement rules as [`attach`](Self::attach), but an
    /// unknown inode stays unknown and `node` is returned as is.
    pub fn share(&self, node: Arc<Node>) -> Arc<Node> {
        let existing = match self.nodes.get_mut(&node.ino()) {
            Some(mut entry) => swap_if_changed(&mut entry, &node),
            None => None,
        };
        settle(existing, node)
    }

    /// Decrements the lookup count; evicts the node when it reaches zero.
    ///
    /// Returns `true` if the node was evicted. The root is never evicted.
    pub fn forget(&self, ino: u64, nlookup: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let evicted = self
            .nodes
            .remove_if_mut(&ino, |_, entry| {
                entry.nlookup = entry.nlookup.saturating_sub(nlookup);
                entry.nlookup == 0
            })
            .is_some();
        if evicted {
            trace!(inode = ino, "Node evicted");
        }
        evicted
    }

    /// Drops the table's reference to `ino` regardless of its lookup count.
    ///
    /// Used after unlink; handles holding the node keep it alive.
    pub fn remove(&self, ino: u64) {
        if ino != ROOT_INODE {
            self.nodes.remove(&ino);
        }
    }

    pub fn nlookup(&self, ino: u64) -> Option<u64> {
        self.nodes.get(&ino).map(|e| e.nlookup)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Returns the entry's node if it still matches `node`, else installs `node`.
fn swap_if_changed(entry: &mut TableEntry, node: &Arc<Node>) -> Option<Arc<Node>> {
    if entry.node.is_dir() == node.is_dir() && entry.node.path() == node.path() {
        Some(Arc::clone(&entry.node))
    } else {
        debug!(inode = node.ino(), path = %node.path(), "Replacing node whose kind changed");
        entry.node = Arc::clone(node);
        None
    }
}

/// Attribute transfer happens outside the shard lock.
fn settle(existing: Option<Arc<Node>>, node: Arc<Node>) -> Arc<Node> {
    match existing {
        Some(existing) => {
            existing.adopt_attr(&node);
            existing
        }
        None => node,
    }
}
