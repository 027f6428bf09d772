//! Array-backed red-black tree index, grounded on
//! `StreamedCacheIndex`/`StreamedCacheIndexTreeEntry` in `streamed_cache.h`.
//!
//! Nodes live in a `Vec<Entry<K>>`; edges are array indices instead of
//! pointers. Index 0 is permanently reserved for the tree's root: a
//! rotation that would otherwise move a different node into slot 0
//! instead swaps the two slots' full records (payload *and* adjacency)
//! and patches the handful of third-party nodes that pointed at either
//! slot, so slot 0 always identifies the root without ever being
//! relinked to by name.
//!
//! Deletions run the standard CLRS fixup (the "double black" color used
//! transiently during that fixup is [`Color::DoubleBlack`]) but do not
//! physically shrink the array: the vacated slot is pushed onto a hole
//! list and reused by the next insert. Once the hole count reaches
//! `max_redundancy`, [`StreamedCacheIndex::rebuild_index`] compacts the
//! array, using [`locate_bin`] to binary-search each surviving index's
//! shift amount.

use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
    DoubleBlack,
}

#[derive(Debug, Clone)]
struct Entry<K> {
    key: K,
    offset: u64,
    color: Color,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

/// Array-backed red-black tree mapping keys to cache body offsets.
pub struct StreamedCacheIndex<K> {
    entries: Vec<Entry<K>>,
    root: Option<usize>,
    holes: Vec<usize>,
    max_redundancy: u32,
}

impl<K: StreamedCacheKeyOrd> StreamedCacheIndex<K> {
    pub fn new(max_redundancy: u32) -> Self {
        StreamedCacheIndex {
            entries: Vec::new(),
            root: None,
            holes: Vec::new(),
            max_redundancy,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.holes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current tombstone count, compacted away once it reaches
    /// `max_redundancy`.
    pub fn redundancy(&self) -> u32 {
        self.holes.len() as u32
    }

    pub fn max_redundancy(&self) -> u32 {
        self.max_redundancy
    }

    pub fn find(&self, key: &K) -> Option<u64> {
        self.find_index(key).map(|idx| self.entries[idx].offset)
    }

    fn find_index(&self, key: &K) -> Option<usize> {
        let mut cursor = self.root;
        while let Some(idx) = cursor {
            let entry = &self.entries[idx];
            cursor = match key.cmp(&entry.key) {
                std::cmp::Ordering::Equal => return Some(idx),
                std::cmp::Ordering::Less => entry.left,
                std::cmp::Ordering::Greater => entry.right,
            };
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.find_index(key).is_some()
    }

    /// Inserts `key -> offset`. Returns [`CacheError::DuplicateKey`] if the
    /// key is already present.
    pub fn insert(&mut self, key: K, offset: u64) -> Result<(), CacheError> {
        if self.contains(&key) {
            return Err(CacheError::DuplicateKey);
        }
        let idx = self.alloc_slot(Entry {
            key,
            offset,
            color: Color::Red,
            parent: None,
            left: None,
            right: None,
        });

        if self.root.is_none() {
            self.entries[idx].color = Color::Black;
            self.entries[idx].parent = None;
            self.root = Some(idx);
            return Ok(());
        }

        let mut cursor = self.root.unwrap();
        loop {
            let go_left = self.entries[idx].key < self.entries[cursor].key;
            let next = if go_left {
                self.entries[cursor].left
            } else {
                self.entries[cursor].right
            };
            match next {
                Some(n) => cursor = n,
                None => {
                    self.entries[idx].parent = Some(cursor);
                    if go_left {
                        self.entries[cursor].left = Some(idx);
                    } else {
                        self.entries[cursor].right = Some(idx);
                    }
                    break;
                }
            }
        }

        self.insert_fixup(idx);
        Ok(())
    }

    /// Removes `key`, returning its offset if present.
    pub fn remove(&mut self, key: &K) -> Option<u64> {
        let z = self.find_index(key)?;
        let offset = self.entries[z].offset;
        self.delete_node(z);
        self.holes.push(z);
        if self.holes.len() as u32 >= self.max_redundancy {
            self.rebuild_index();
        }
        Some(offset)
    }

    fn alloc_slot(&mut self, entry: Entry<K>) -> usize {
        match self.holes.pop() {
            Some(idx) => {
                self.entries[idx] = entry;
                idx
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        }
    }

    // ---- rotations ----

    fn rotate_left(&mut self, x: usize) {
        let y = self.entries[x].right.expect("rotate_left requires a right child");
        let t2 = self.entries[y].left;
        self.entries[x].right = t2;
        if let Some(t2) = t2 {
            self.entries[t2].parent = Some(x);
        }
        self.entries[y].parent = self.entries[x].parent;
        match self.entries[x].parent {
            None => self.root = Some(y),
            Some(p) if self.entries[p].left == Some(x) => self.entries[p].left = Some(y),
            Some(p) => self.entries[p].right = Some(y),
        }
        self.entries[y].left = Some(x);
        self.entries[x].parent = Some(y);
        self.enforce_root_at_zero();
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self.entries[x].left.expect("rotate_right requires a left child");
        let t2 = self.entries[y].right;
        self.entries[x].left = t2;
        if let Some(t2) = t2 {
            self.entries[t2].parent = Some(x);
        }
        self.entries[y].parent = self.entries[x].parent;
        match self.entries[x].parent {
            None => self.root = Some(y),
            Some(p) if self.entries[p].left == Some(x) => self.entries[p].left = Some(y),
            Some(p) => self.entries[p].right = Some(y),
        }
        self.entries[y].right = Some(x);
        self.entries[x].parent = Some(y);
        self.enforce_root_at_zero();
    }

    /// If the logical root (tracked in `self.root`) has drifted away from
    /// array slot 0, swaps the two slots' full records — payload and
    /// adjacency alike — and patches the bounded set of neighbors that
    /// pointed at either slot, rather than ever treating slot 0 as
    /// relinkable.
    fn enforce_root_at_zero(&mut self) {
        let root = self.root.expect("enforce_root_at_zero requires a root");
        if root == 0 {
            return;
        }

        let root_left = self.entries[root].left;
        let root_right = self.entries[root].right;
        let zero_left = self.entries[0].left;
        let zero_right = self.entries[0].right;

        self.entries.swap(0, root);

        let remap = |v: Option<usize>| match v {
            Some(0) => Some(root),
            Some(r) if r == root => Some(0),
            other => other,
        };
        for &slot in &[0usize, root] {
            self.entries[slot].parent = remap(self.entries[slot].parent);
            self.entries[slot].left = remap(self.entries[slot].left);
            self.entries[slot].right = remap(self.entries[slot].right);
        }
        self.entries[0].parent = None;

        for child in [root_left, root_right] {
            if let Some(c) = child {
                if c != 0 {
                    self.entries[c].parent = Some(0);
                }
            }
        }
        for child in [zero_left, zero_right] {
            if let Some(c) = child {
                if c != root {
                    self.entries[c].parent = Some(root);
                }
            }
        }

        self.root = Some(0);
    }

    // ---- insert fixup ----

    fn insert_fixup(&mut self, mut z: usize) {
        while let Some(parent) = self.entries[z].parent {
            if self.entries[parent].color != Color::Red {
                break;
            }
            let grandparent = self.entries[parent]
                .parent
                .expect("a red node always has a black grandparent");
            let parent_is_left = self.entries[grandparent].left == Some(parent);
            let uncle = if parent_is_left {
                self.entries[grandparent].right
            } else {
                self.entries[grandparent].left
            };

            if uncle.map_or(false, |u| self.entries[u].color == Color::Red) {
                self.entries[parent].color = Color::Black;
                self.entries[uncle.unwrap()].color = Color::Black;
                self.entries[grandparent].color = Color::Red;
                z = grandparent;
                continue;
            }

            if parent_is_left {
                if self.entries[parent].right == Some(z) {
                    z = parent;
                    self.rotate_left(z);
                }
                let parent = self.entries[z].parent.unwrap();
                let grandparent = self.entries[parent].parent.unwrap();
                self.entries[parent].color = Color::Black;
                self.entries[grandparent].color = Color::Red;
                self.rotate_right(grandparent);
            } else {
                if self.entries[parent].left == Some(z) {
                    z = parent;
                    self.rotate_right(z);
                }
                let parent = self.entries[z].parent.unwrap();
                let grandparent = self.entries[parent].parent.unwrap();
                self.entries[parent].color = Color::Black;
                self.entries[grandparent].color = Color::Red;
                self.rotate_left(grandparent);
            }
            break;
        }
        self.entries[self.root.unwrap()].color = Color::Black;
    }

    // ---- delete + fixup ----

    fn transplant(&mut self, u: usize, v: Option<usize>) {
        match self.entries[u].parent {
            None => self.root = v,
            Some(p) if self.entries[p].left == Some(u) => self.entries[p].left = v,
            Some(p) => self.entries[p].right = v,
        }
        if let Some(v) = v {
            self.entries[v].parent = self.entries[u].parent;
        }
    }

    fn minimum(&self, mut idx: usize) -> usize {
        while let Some(left) = self.entries[idx].left {
            idx = left;
        }
        idx
    }

    fn delete_node(&mut self, z: usize) {
        let mut y = z;
        let mut y_original_color = self.entries[y].color;
        let x: Option<usize>;
        let x_parent: Option<usize>;

        if self.entries[z].left.is_none() {
            x = self.entries[z].right;
            x_parent = self.entries[z].parent;
            self.transplant(z, self.entries[z].right);
        } else if self.entries[z].right.is_none() {
            x = self.entries[z].left;
            x_parent = self.entries[z].parent;
            self.transplant(z, self.entries[z].left);
        } else {
            y = self.minimum(self.entries[z].right.unwrap());
            y_original_color = self.entries[y].color;
            x = self.entries[y].right;
            if self.entries[y].parent == Some(z) {
                x_parent = Some(y);
            } else {
                x_parent = self.entries[y].parent;
                self.transplant(y, self.entries[y].right);
                self.entries[y].right = self.entries[z].right;
                if let Some(r) = self.entries[y].right {
                    self.entries[r].parent = Some(y);
                }
            }
            self.transplant(z, Some(y));
            self.entries[y].left = self.entries[z].left;
            if let Some(l) = self.entries[y].left {
                self.entries[l].parent = Some(y);
            }
            self.entries[y].color = self.entries[z].color;
        }

        if y_original_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }
        if let Some(root) = self.root {
            self.enforce_root_at_zero();
            let _ = root;
        }
    }

    fn color_of(&self, idx: Option<usize>) -> Color {
        idx.map(|i| self.entries[i].color).unwrap_or(Color::Black)
    }

    fn delete_fixup(&mut self, mut x: Option<usize>, mut x_parent: Option<usize>) {
        while x != self.root && self.color_of(x) != Color::Red {
            let parent = match x_parent {
                Some(p) => p,
                None => break,
            };
            let x_is_left = self.entries[parent].left == x;

            if x_is_left {
                let mut sibling = self.entries[parent].right.expect("x has a black sibling");
                if self.entries[sibling].color == Color::Red {
                    self.entries[sibling].color = Color::Black;
                    self.entries[parent].color = Color::Red;
                    self.rotate_left(parent);
                    sibling = self.entries[parent].right.expect("sibling restored after rotation");
                }
                let sib_left_black = self.color_of(self.entries[sibling].left) != Color::Red;
                let sib_right_black = self.color_of(self.entries[sibling].right) != Color::Red;
                if sib_left_black && sib_right_black {
                    self.entries[sibling].color = Color::Red;
                    x = Some(parent);
                    x_parent = self.entries[parent].parent;
                } else {
                    if sib_right_black {
                        if let Some(l) = self.entries[sibling].left {
                            self.entries[l].color = Color::Black;
                        }
                        self.entries[sibling].color = Color::Red;
                        self.rotate_right(sibling);
                        sibling = self.entries[parent].right.unwrap();
                    }
                    self.entries[sibling].color = self.entries[parent].color;
                    self.entries[parent].color = Color::Black;
                    if let Some(r) = self.entries[sibling].right {
                        self.entries[r].color = Color::Black;
                    }
                    self.rotate_left(parent);
                    x = self.root;
                    x_parent = None;
                }
            } else {
                let mut sibling = self.entries[parent].left.expect("x has a black sibling");
                if self.entries[sibling].color == Color::Red {
                    self.entries[sibling].color = Color::Black;
                    self.entries[parent].color = Color::Red;
                    self.rotate_right(parent);
                    sibling = self.entries[parent].left.expect("sibling restored after rotation");
                }
                let sib_right_black = self.color_of(self.entries[sibling].right) != Color::Red;
                let sib_left_black = self.color_of(self.entries[sibling].left) != Color::Red;
                if sib_right_black && sib_left_black {
                    self.entries[sibling].color = Color::Red;
                    x = Some(parent);
                    x_parent = self.entries[parent].parent;
                } else {
                    if sib_left_black {
                        if let Some(r) = self.entries[sibling].right {
                            self.entries[r].color = Color::Black;
                        }
                        self.entries[sibling].color = Color::Red;
                        self.rotate_left(sibling);
                        sibling = self.entries[parent].left.unwrap();
                    }
                    self.entries[sibling].color = self.entries[parent].color;
                    self.entries[parent].color = Color::Black;
                    if let Some(l) = self.entries[sibling].left {
                        self.entries[l].color = Color::Black;
                    }
                    self.rotate_right(parent);
                    x = self.root;
                    x_parent = None;
                }
            }
        }
        if let Some(x) = x {
            self.entries[x].color = Color::Black;
        }
    }

    /// Physically compacts the array, dropping holes and shifting every
    /// surviving entry down by the number of holes below it (found via
    /// [`locate_bin`]), then remapping every parent/left/right index.
    pub fn rebuild_index(&mut self) {
        if self.holes.is_empty() {
            return;
        }
        let mut holes = self.holes.clone();
        holes.sort_unstable();

        let shift = |idx: usize| -> usize { idx - locate_bin(&holes, idx) };

        let mut compacted = Vec::with_capacity(self.entries.len() - holes.len());
        let hole_set: std::collections::HashSet<usize> = holes.iter().copied().collect();
        for (old_idx, entry) in self.entries.iter().enumerate() {
            if hole_set.contains(&old_idx) {
                continue;
            }
            let mut remapped = entry.clone();
            remapped.parent = remapped.parent.map(shift);
            remapped.left = remapped.left.map(shift);
            remapped.right = remapped.right.map(shift);
            compacted.push(remapped);
        }

        self.root = self.root.map(shift);
        self.entries = compacted;
        self.holes.clear();
    }

    /// Renders the tree as Graphviz DOT, matching
    /// `StreamedCacheIndex::generateDOTRepresentation`.
    pub fn to_dot(&self) -> String
    where
        K: std::fmt::Debug,
    {
        let mut out = String::from("digraph cache_index {\n");
        let holes: std::collections::HashSet<usize> = self.holes.iter().copied().collect();
        for (idx, entry) in self.entries.iter().enumerate() {
            if holes.contains(&idx) {
                continue;
            }
            let color = match entry.color {
                Color::Red => "red",
                Color::Black => "black",
                Color::DoubleBlack => "grey",
            };
            out.push_str(&format!(
                "  n{idx} [label=\"{key:?}@{offset}\" color={color}];\n",
                idx = idx,
                key = entry.key,
                offset = entry.offset,
                color = color
            ));
            if let Some(l) = entry.left {
                out.push_str(&format!("  n{} -> n{} [label=L];\n", idx, l));
            }
            if let Some(r) = entry.right {
                out.push_str(&format!("  n{} -> n{} [label=R];\n", idx, r));
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Binary search over an ascending list of hole indices, returning how
/// many holes fall strictly below `idx` — the amount `idx` must shift down
/// by once those holes are compacted out.
pub(crate) fn locate_bin(sorted_holes: &[usize], idx: usize) -> usize {
    sorted_holes.partition_point(|&h| h < idx)
}

/// Bound required of cache keys: a stable total order, since it determines
/// the on-disk tree shape.
pub trait StreamedCacheKeyOrd: Ord + Clone {}
impl<T: Ord + Clone> StreamedCacheKeyOrd for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_black_heights_equal<K: StreamedCacheKeyOrd + std::fmt::Debug>(
        index: &StreamedCacheIndex<K>,
    ) {
        fn height<K: StreamedCacheKeyOrd>(
            index: &StreamedCacheIndex<K>,
            node: Option<usize>,
        ) -> usize {
            match node {
                None => 1,
                Some(idx) => {
                    let entry_black = index.entries[idx].color != Color::Red;
                    let left = height(index, index.entries[idx].left);
                    let right = height(index, index.entries[idx].right);
                    assert_eq!(left, right, "black-height mismatch at node {}", idx);
                    left + if entry_black { 1 } else { 0 }
                }
            }
        }
        height(index, index.root);
    }

    #[test]
    fn insert_and_find_round_trip() {
        let mut index: StreamedCacheIndex<u32> = StreamedCacheIndex::new(64);
        for i in 0..100u32 {
            index.insert(i, (i as u64) * 10).unwrap();
        }
        for i in 0..100u32 {
            assert_eq!(index.find(&i), Some((i as u64) * 10));
        }
        assert_black_heights_equal(&index);
        assert_eq!(index.root, Some(0));
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut index: StreamedCacheIndex<u32> = StreamedCacheIndex::new(64);
        index.insert(1, 100).unwrap();
        assert!(matches!(index.insert(1, 200), Err(CacheError::DuplicateKey)));
    }

    #[test]
    fn remove_then_compaction_preserves_lookups() {
        let mut index: StreamedCacheIndex<u32> = StreamedCacheIndex::new(4);
        for i in 0..20u32 {
            index.insert(i, i as u64).unwrap();
        }
        for i in (0..20u32).step_by(2) {
            assert_eq!(index.remove(&i), Some(i as u64));
        }
        assert_black_heights_equal(&index);
        for i in (1..20u32).step_by(2) {
            assert_eq!(index.find(&i), Some(i as u64));
        }
        for i in (0..20u32).step_by(2) {
            assert_eq!(index.find(&i), None);
        }
        assert_eq!(index.root, Some(0));
    }

    #[test]
    fn locate_bin_counts_holes_below() {
        let holes = vec![2, 5, 9];
        assert_eq!(locate_bin(&holes, 0), 0);
        assert_eq!(locate_bin(&holes, 3), 1);
        assert_eq!(locate_bin(&holes, 6), 2);
        assert_eq!(locate_bin(&holes, 10), 3);
    }
}
