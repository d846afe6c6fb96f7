//! # Node
//!
//! The in-memory, deserialized form of a leaf or branch page. Nodes only
//! exist inside a writable transaction: the first mutation along a tree path
//! materializes every page on that path into nodes, and commit serializes
//! them back out to freshly allocated pages (copy-on-write).
//!
//! Parent and child links would form a cyclic graph, so nodes live in a
//! per-transaction [`NodeArena`] and reference each other by [`NodeId`].
//! The transaction owns every node; ids never dangle because the arena only
//! grows for the transaction's lifetime.
//!
//! Key and value bytes are [`KvRef`]s: either a range borrowed from the
//! mapped file (zero-copy, the common case right after `read`) or an owned
//! heap buffer (anything the user inserted, and everything after
//! `dereference` runs ahead of a remap or spill).

use zerocopy::{FromZeros, IntoBytes};

use crate::error::Result;
use crate::page::{
    self, BranchElement, LeafElement, PageFlags, PageId, PageRef, BRANCH_ELEMENT_SIZE,
    LEAF_ELEMENT_SIZE, MIN_KEYS_PER_PAGE, PAGE_HEADER_SIZE,
};

/// Index of a node within its transaction's arena.
pub(crate) type NodeId = usize;

/// Key or value bytes, borrowed from the mmap or owned on the heap.
#[derive(Debug, Clone)]
pub(crate) enum KvRef {
    /// A byte range inside the mapped file.
    Mmap { pos: usize, len: usize },
    /// Heap-owned bytes.
    Heap(Vec<u8>),
}

impl Default for KvRef {
    fn default() -> Self {
        KvRef::Heap(Vec::new())
    }
}

impl KvRef {
    pub fn resolve<'a>(&'a self, data: &'a [u8]) -> &'a [u8] {
        match self {
            KvRef::Mmap { pos, len } => &data[*pos..*pos + *len],
            KvRef::Heap(bytes) => bytes,
        }
    }

    pub fn to_vec(&self, data: &[u8]) -> Vec<u8> {
        self.resolve(data).to_vec()
    }

    /// Converts a borrowed range into an owned buffer in place.
    pub fn make_owned(&mut self, data: &[u8]) {
        if let KvRef::Mmap { pos, len } = *self {
            *self = KvRef::Heap(data[pos..pos + len].to_vec());
        }
    }

    pub fn len(&self) -> usize {
        match self {
            KvRef::Mmap { len, .. } => *len,
            KvRef::Heap(bytes) => bytes.len(),
        }
    }
}

/// One entry of a node: a key/value pair on leaves, a key/child pointer on
/// branches.
#[derive(Debug, Clone, Default)]
pub(crate) struct Inode {
    pub flags: u32,
    pub pgid: PageId,
    pub key: KvRef,
    pub value: KvRef,
}

#[derive(Debug, Default)]
pub(crate) struct Node {
    /// Page this node was read from; 0 until first spill.
    pub pgid: PageId,
    pub is_leaf: bool,
    pub unbalanced: bool,
    pub spilled: bool,
    pub parent: Option<NodeId>,
    /// Materialized children only; untouched subtrees stay as page ids in
    /// `inodes`.
    pub children: Vec<NodeId>,
    /// First key as of the last read; used to find this node in its parent.
    pub bound_key: KvRef,
    /// Entries sorted by key ascending.
    pub inodes: Vec<Inode>,
}

impl Node {
    pub fn min_keys(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            2
        }
    }

    fn element_size(&self) -> usize {
        if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        }
    }

    /// Serialized size in bytes: header, element array, key/value payload.
    pub fn size(&self) -> usize {
        let elem = self.element_size();
        self.inodes
            .iter()
            .fold(PAGE_HEADER_SIZE, |acc, ino| {
                acc + elem + ino.key.len() + ino.value.len()
            })
    }

    /// Lower-bound index for `key` plus whether the match is exact.
    pub fn index_of(&self, data: &[u8], key: &[u8]) -> (usize, bool) {
        let mut lo = 0;
        let mut hi = self.inodes.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.inodes[mid].key.resolve(data) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let exact = lo < self.inodes.len() && self.inodes[lo].key.resolve(data) == key;
        (lo, exact)
    }

    /// Inserts or overwrites an entry. `old_key` locates the slot (it differs
    /// from `new_key` when a parent separator is being renamed).
    pub fn put(
        &mut self,
        data: &[u8],
        old_key: &[u8],
        new_key: Vec<u8>,
        value: Vec<u8>,
        pgid: PageId,
        flags: u32,
    ) {
        let (index, exact) = self.index_of(data, old_key);
        if !exact {
            self.inodes.insert(index, Inode::default());
        }
        let ino = &mut self.inodes[index];
        ino.flags = flags;
        ino.pgid = pgid;
        ino.key = KvRef::Heap(new_key);
        ino.value = KvRef::Heap(value);
    }

    /// Removes `key` if present and marks the node for rebalancing.
    pub fn del(&mut self, data: &[u8], key: &[u8]) {
        let (index, exact) = self.index_of(data, key);
        if !exact {
            return;
        }
        self.inodes.remove(index);
        self.unbalanced = true;
    }

    /// Populates the node from a page.
    pub fn read(&mut self, p: &PageRef<'_>) -> Result<()> {
        self.pgid = p.id;
        self.is_leaf = p.is_leaf();
        self.inodes = Vec::with_capacity(p.count);

        for i in 0..p.count {
            if self.is_leaf {
                let item = p.leaf_element(i)?;
                self.inodes.push(Inode {
                    flags: item.flags,
                    pgid: 0,
                    key: KvRef::Mmap {
                        pos: item.key_pos,
                        len: item.key.len(),
                    },
                    value: KvRef::Mmap {
                        pos: item.key_pos + item.key.len(),
                        len: item.value.len(),
                    },
                });
            } else {
                let item = p.branch_element(i)?;
                self.inodes.push(Inode {
                    flags: 0,
                    pgid: item.pgid,
                    key: KvRef::Mmap {
                        pos: item.key_pos,
                        len: item.key.len(),
                    },
                    value: KvRef::default(),
                });
            }
        }

        self.bound_key = match self.inodes.first() {
            Some(ino) => ino.key.clone(),
            None => KvRef::default(),
        };
        Ok(())
    }

    /// Serializes the node into a zeroed page buffer. The caller has already
    /// sized the buffer for [`Node::size`] and stamps id/overflow on the
    /// header; this writes the flags, count, element array and payload.
    pub fn write(&self, data: &[u8], buf: &mut [u8]) -> Result<()> {
        let hdr = page::header_mut(buf)?;
        hdr.set_page_flags(if self.is_leaf {
            PageFlags::LEAF
        } else {
            PageFlags::BRANCH
        });
        hdr.set_count(self.inodes.len() as u16);

        let elem_size = self.element_size();
        let mut kv_off = PAGE_HEADER_SIZE + elem_size * self.inodes.len();

        for (i, ino) in self.inodes.iter().enumerate() {
            let elem_off = PAGE_HEADER_SIZE + i * elem_size;
            let pos = (kv_off - elem_off) as u32;
            let key = ino.key.resolve(data);
            let value = ino.value.resolve(data);

            if self.is_leaf {
                let mut elem = LeafElement::new_zeroed();
                elem.set_flags(ino.flags);
                elem.set_pos(pos);
                elem.set_ksize(key.len() as u32);
                elem.set_vsize(value.len() as u32);
                buf[elem_off..elem_off + elem_size].copy_from_slice(elem.as_bytes());
            } else {
                let mut elem = BranchElement::new_zeroed();
                elem.set_pos(pos);
                elem.set_ksize(key.len() as u32);
                elem.set_pgid(ino.pgid);
                buf[elem_off..elem_off + elem_size].copy_from_slice(elem.as_bytes());
            }

            buf[kv_off..kv_off + key.len()].copy_from_slice(key);
            kv_off += key.len();
            buf[kv_off..kv_off + value.len()].copy_from_slice(value);
            kv_off += value.len();
        }
        Ok(())
    }

    /// Copies every mmap-backed reference onto the heap. Required before the
    /// mapping is replaced and before serialized nodes outlive their
    /// snapshot.
    pub fn dereference(&mut self, data: &[u8]) {
        self.bound_key.make_owned(data);
        for ino in &mut self.inodes {
            ino.key.make_owned(data);
            ino.value.make_owned(data);
        }
    }
}

/// Owning store for every node a write transaction materializes.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    /// Topmost ancestor of `id`.
    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            current = parent;
        }
        current
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent].children.retain(|&c| c != child);
    }

    /// Splits `node_id` into page-sized siblings, creating a synthetic parent
    /// if the node was the root. Returns the ordered sibling list (starting
    /// with `node_id` itself) and the number of cuts made.
    ///
    /// Nodes that fit a single page, or that hold too few inodes to populate
    /// two pages, come back unchanged.
    pub fn split(&mut self, node_id: NodeId, page_size: usize) -> (Vec<NodeId>, u64) {
        if self.nodes[node_id].inodes.len() <= MIN_KEYS_PER_PAGE * 2
            || self.nodes[node_id].size() < page_size
        {
            return (vec![node_id], 0);
        }

        let threshold = page_size / 2;
        let is_leaf = self.nodes[node_id].is_leaf;
        let elem_size = self.nodes[node_id].element_size();
        let taken = std::mem::take(&mut self.nodes[node_id].inodes);
        let total = taken.len();

        let mut result = vec![node_id];
        let mut current = node_id;
        let mut size = PAGE_HEADER_SIZE;
        let mut splits = 0u64;

        for (i, ino) in taken.into_iter().enumerate() {
            let elem = elem_size + ino.key.len() + ino.value.len();

            // Cut when the running size crosses the fill threshold, provided
            // both sides keep at least MIN_KEYS_PER_PAGE inodes.
            if self.nodes[current].inodes.len() >= MIN_KEYS_PER_PAGE
                && i <= total - MIN_KEYS_PER_PAGE
                && size + elem > threshold
            {
                let parent = match self.nodes[node_id].parent {
                    Some(p) => p,
                    None => {
                        let p = self.alloc(Node {
                            children: vec![node_id],
                            ..Node::default()
                        });
                        self.nodes[node_id].parent = Some(p);
                        p
                    }
                };

                let sibling = self.alloc(Node {
                    is_leaf,
                    parent: Some(parent),
                    ..Node::default()
                });
                self.nodes[parent].children.push(sibling);
                result.push(sibling);
                current = sibling;
                size = PAGE_HEADER_SIZE;
                splits += 1;
            }

            size += elem;
            self.nodes[current].inodes.push(ino);
        }

        (result, splits)
    }
}

impl std::ops::Index<NodeId> for NodeArena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}

impl std::ops::IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::page_at;

    fn leaf_with(entries: &[(&str, &str)]) -> Node {
        let mut n = Node {
            is_leaf: true,
            ..Node::default()
        };
        for (k, v) in entries {
            n.put(&[], k.as_bytes(), k.as_bytes().to_vec(), v.as_bytes().to_vec(), 0, 0);
        }
        n
    }

    #[test]
    fn put_keeps_keys_sorted_and_overwrites() {
        let mut n = Node {
            is_leaf: true,
            ..Node::default()
        };
        n.put(&[], b"baz", b"baz".to_vec(), b"2".to_vec(), 0, 0);
        n.put(&[], b"foo", b"foo".to_vec(), b"0".to_vec(), 0, 0);
        n.put(&[], b"bar", b"bar".to_vec(), b"1".to_vec(), 0, 0);
        n.put(&[], b"foo", b"foo".to_vec(), b"3".to_vec(), 0, 0);

        assert_eq!(n.inodes.len(), 3);
        assert_eq!(n.inodes[0].key.resolve(&[]), b"bar");
        assert_eq!(n.inodes[0].value.resolve(&[]), b"1");
        assert_eq!(n.inodes[1].key.resolve(&[]), b"baz");
        assert_eq!(n.inodes[1].value.resolve(&[]), b"2");
        assert_eq!(n.inodes[2].key.resolve(&[]), b"foo");
        assert_eq!(n.inodes[2].value.resolve(&[]), b"3");
    }

    #[test]
    fn del_removes_and_marks_unbalanced() {
        let mut n = leaf_with(&[("a", "1"), ("b", "2")]);
        assert!(!n.unbalanced);

        n.del(&[], b"a");
        assert_eq!(n.inodes.len(), 1);
        assert!(n.unbalanced);

        // Deleting a missing key is a no-op.
        let mut n = leaf_with(&[("a", "1")]);
        n.del(&[], b"zzz");
        assert_eq!(n.inodes.len(), 1);
        assert!(!n.unbalanced);
    }

    #[test]
    fn read_deserializes_a_leaf_page() {
        let mut data = vec![0u8; 4096];
        {
            let hdr = page::header_mut(&mut data).unwrap();
            hdr.set_page_flags(PageFlags::LEAF);
            hdr.set_count(2);
        }
        let mut elem = LeafElement::new_zeroed();
        elem.set_pos(32);
        elem.set_ksize(3);
        elem.set_vsize(4);
        data[16..32].copy_from_slice(elem.as_bytes());
        elem.set_pos(23);
        elem.set_ksize(10);
        elem.set_vsize(3);
        data[32..48].copy_from_slice(elem.as_bytes());
        data[48..55].copy_from_slice(b"barfooz");
        data[55..68].copy_from_slice(b"helloworldbye");

        let p = page_at(&data, 4096, 0).unwrap();
        let mut n = Node::default();
        n.read(&p).unwrap();

        assert!(n.is_leaf);
        assert_eq!(n.inodes.len(), 2);
        assert_eq!(n.inodes[0].key.resolve(&data), b"bar");
        assert_eq!(n.inodes[0].value.resolve(&data), b"fooz");
        assert_eq!(n.inodes[1].key.resolve(&data), b"helloworld");
        assert_eq!(n.inodes[1].value.resolve(&data), b"bye");
        assert_eq!(n.bound_key.resolve(&data), b"bar");
    }

    #[test]
    fn write_then_read_roundtrips() {
        let n = leaf_with(&[("susy", "que"), ("ricki", "lake"), ("john", "johnson")]);

        let mut buf = vec![0u8; 4096];
        n.write(&[], &mut buf).unwrap();

        let p = page_at(&buf, 4096, 0).unwrap();
        let mut n2 = Node::default();
        n2.read(&p).unwrap();

        assert_eq!(n2.inodes.len(), 3);
        assert_eq!(n2.inodes[0].key.resolve(&buf), b"john");
        assert_eq!(n2.inodes[0].value.resolve(&buf), b"johnson");
        assert_eq!(n2.inodes[1].key.resolve(&buf), b"ricki");
        assert_eq!(n2.inodes[1].value.resolve(&buf), b"lake");
        assert_eq!(n2.inodes[2].key.resolve(&buf), b"susy");
        assert_eq!(n2.inodes[2].value.resolve(&buf), b"que");
    }

    #[test]
    fn dereference_copies_mmap_refs_to_heap() {
        let n = leaf_with(&[("key", "value")]);
        let mut buf = vec![0u8; 4096];
        n.write(&[], &mut buf).unwrap();

        let p = page_at(&buf, 4096, 0).unwrap();
        let mut n2 = Node::default();
        n2.read(&p).unwrap();
        assert!(matches!(n2.inodes[0].key, KvRef::Mmap { .. }));

        n2.dereference(&buf);
        assert!(matches!(n2.inodes[0].key, KvRef::Heap(_)));
        assert_eq!(n2.inodes[0].key.resolve(&[]), b"key");
        assert_eq!(n2.inodes[0].value.resolve(&[]), b"value");
    }

    fn five_entry_node(arena: &mut NodeArena) -> NodeId {
        let mut n = Node {
            is_leaf: true,
            ..Node::default()
        };
        for i in 1..=5u8 {
            let key = format!("0000000{i}");
            n.put(
                &[],
                key.as_bytes(),
                key.clone().into_bytes(),
                b"0123456701234567".to_vec(),
                0,
                0,
            );
        }
        arena.alloc(n)
    }

    #[test]
    fn split_divides_at_fill_threshold() {
        let mut arena = NodeArena::new();
        let id = five_entry_node(&mut arena);

        let (nodes, splits) = arena.split(id, 100);

        assert_eq!(nodes.len(), 2);
        assert_eq!(splits, 1);
        assert_eq!(arena[nodes[0]].inodes.len(), 2);
        assert_eq!(arena[nodes[1]].inodes.len(), 3);

        // The root gained a synthetic parent holding both siblings.
        let parent = arena[id].parent.unwrap();
        assert_eq!(arena[parent].children, nodes);
        assert!(!arena[parent].is_leaf);
        assert_eq!(arena[nodes[1]].parent, Some(parent));
    }

    #[test]
    fn split_with_min_keys_is_a_noop() {
        let mut arena = NodeArena::new();
        let mut n = Node {
            is_leaf: true,
            ..Node::default()
        };
        for i in 1..=2u8 {
            let key = format!("0000000{i}");
            n.put(
                &[],
                key.as_bytes(),
                key.clone().into_bytes(),
                b"0123456701234567".to_vec(),
                0,
                0,
            );
        }
        let id = arena.alloc(n);

        let (nodes, splits) = arena.split(id, 20);
        assert_eq!(nodes, vec![id]);
        assert_eq!(splits, 0);
        assert_eq!(arena[id].inodes.len(), 2);
    }

    #[test]
    fn split_that_fits_one_page_is_a_noop() {
        let mut arena = NodeArena::new();
        let id = five_entry_node(&mut arena);

        let (nodes, _) = arena.split(id, 4096);
        assert_eq!(nodes, vec![id]);
        assert_eq!(arena[id].inodes.len(), 5);
        assert!(arena[id].parent.is_none());
    }

    #[test]
    fn size_counts_header_elements_and_payload() {
        let n = leaf_with(&[("ab", "cdef")]);
        assert_eq!(n.size(), PAGE_HEADER_SIZE + LEAF_ELEMENT_SIZE + 2 + 4);
    }
}
