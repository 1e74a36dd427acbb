// =============================================================================
// Tern OS - Translation Table Arena
// =============================================================================
// Owns every table of one address space. Tables are boxed so their addresses
// never move once a descriptor points at them; the arena itself only grows,
// since unmapping never gives table memory back.
//
// Next to each hardware table sits a shadow array of child handles. Walking
// down goes through the shadow, never through the physical address stored in
// a descriptor.
// =============================================================================

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;

use static_assertions::{assert_eq_size, const_assert_eq};

use super::descriptor::{Descriptor, ENTRIES};
use crate::hal::PhysAddr;

/// One 4 KiB translation table, exactly as the walker reads it.
#[repr(C, align(4096))]
pub struct Table {
    entries: [Descriptor; ENTRIES],
}

assert_eq_size!(Table, [u8; 4096]);
const_assert_eq!(core::mem::align_of::<Table>(), 4096);
assert_eq_size!(Descriptor, u64);

impl Table {
    const EMPTY: Table = Table { entries: [Descriptor::INVALID; ENTRIES] };
}

/// Handle to a table in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableId(usize);

struct Node {
    table: Box<Table>,
    children: Box<[Option<TableId>; ENTRIES]>,
}

impl Node {
    fn new() -> Self {
        Self {
            table: Box::new(Table::EMPTY),
            children: Box::new([None; ENTRIES]),
        }
    }
}

pub struct TableArena {
    nodes: Vec<Node>,
}

impl TableArena {
    /// A fresh arena holding only an empty root table.
    pub fn new() -> Self {
        let mut nodes = Vec::new();
        nodes.push(Node::new());
        Self { nodes }
    }

    pub const fn root(&self) -> TableId {
        TableId(0)
    }

    /// Number of tables, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Physical address of a table (identity mapped).
    pub fn phys(&self, id: TableId) -> PhysAddr {
        &*self.nodes[id.0].table as *const Table as PhysAddr
    }

    pub fn entry(&self, id: TableId, index: usize) -> Descriptor {
        // SAFETY: the pointer comes from a live reference into our own table
        unsafe { ptr::read_volatile(&self.nodes[id.0].table.entries[index]) }
    }

    /// Store a descriptor. The walker may observe the slot at any time, so
    /// the store is a single volatile 64-bit write.
    pub fn set_entry(&mut self, id: TableId, index: usize, descriptor: Descriptor) {
        let slot = &mut self.nodes[id.0].table.entries[index];
        // SAFETY: `slot` is a valid, aligned, exclusive reference
        unsafe { ptr::write_volatile(slot, descriptor) };
    }

    /// The table linked from `index` of `parent`, if any.
    pub fn child(&self, parent: TableId, index: usize) -> Option<TableId> {
        self.nodes[parent.0].children[index]
    }

    /// The table linked from `index` of `parent`, creating and linking a
    /// zeroed one when the slot is empty.
    ///
    /// Whatever leaf descriptor the slot held is replaced by the table link.
    pub fn child_or_alloc(&mut self, parent: TableId, index: usize) -> TableId {
        if let Some(child) = self.child(parent, index) {
            return child;
        }
        let child = TableId(self.nodes.len());
        self.nodes.push(Node::new());
        let table = Descriptor::table(self.phys(child));
        self.set_entry(parent, index, table);
        self.nodes[parent.0].children[index] = Some(child);
        child
    }
}

impl Default for TableArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_layout_matches_the_granule() {
        assert_eq!(core::mem::size_of::<Table>(), 4096);
        assert_eq!(core::mem::align_of::<Table>(), 4096);
        let table = Box::new(Table::EMPTY);
        assert_eq!(&*table as *const Table as usize % 4096, 0);
    }

    #[test]
    fn tables_are_page_aligned_and_linked_by_address() {
        let mut arena = TableArena::new();
        let root = arena.root();
        let child = arena.child_or_alloc(root, 7);

        assert_eq!(arena.phys(child) % 4096, 0);
        assert_eq!(arena.entry(root, 7), Descriptor::table(arena.phys(child)));
        assert_eq!(arena.child_or_alloc(root, 7), child);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn new_tables_start_invalid() {
        let mut arena = TableArena::new();
        let root = arena.root();
        let child = arena.child_or_alloc(root, 0);
        assert!((0..ENTRIES).all(|i| !arena.entry(child, i).is_valid()));
        assert_eq!(arena.child(child, 0), None);
    }
}
