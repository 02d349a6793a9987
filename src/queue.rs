use crate::dma::{Allocator, Dma};
use crate::error::Error;

/// A single NVMe ring in DMA memory, holding submissions or completions.
///
/// The ring always occupies exactly one host page; requesting more entries
/// than fit truncates the count to `page_size / entry_size`. Entries are
/// zeroed on creation, which is what makes phase-bit scanning of a fresh
/// completion ring sound.
#[derive(Debug)]
pub(crate) struct Queue<T> {
    memory: Dma<T>,
    entry_count: usize,
    next_index: usize,
}

impl<T: Copy> Queue<T> {
    pub(crate) fn new<A: Allocator>(
        allocator: &A,
        page_size: usize,
        max_entries: usize,
    ) -> Result<Self, Error> {
        let entry_size = core::mem::size_of::<T>();
        let entry_count = max_entries.min(page_size / entry_size);
        let memory = Dma::allocate(allocator, page_size / entry_size, page_size)?;
        Ok(Self {
            memory,
            entry_count,
            next_index: 0,
        })
    }

    /// The physical address of the ring, suitable for handing to the
    /// controller.
    pub(crate) fn device_address(&self) -> u64 {
        self.memory.device_address()
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// The index the next entry will be written to or read from.
    pub(crate) fn next_index(&self) -> usize {
        self.next_index
    }

    fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < self.entry_count);
        unsafe { self.memory.as_ptr().add(index) }
    }

    /// A copy of the entry at the cursor, without moving the cursor. The
    /// read is volatile: the controller writes these slots behind our back.
    pub(crate) fn peek(&self) -> T {
        unsafe { core::ptr::read_volatile(self.slot_ptr(self.next_index)) }
    }

    /// Stores `entry` at the cursor, without moving the cursor.
    pub(crate) fn write_slot(&mut self, entry: T) {
        unsafe { core::ptr::write_volatile(self.slot_ptr(self.next_index), entry) };
    }

    /// Moves the cursor forward and returns its new value.
    pub(crate) fn advance(&mut self) -> usize {
        self.next_index = (self.next_index + 1) % self.entry_count;
        self.next_index
    }

    pub(crate) fn free<A: Allocator>(self, allocator: &A) -> Result<(), Error> {
        self.memory.free(allocator)
    }

    /// Direct access to a ring slot, for tests that play the controller side.
    #[cfg(test)]
    pub(crate) fn read_slot(&self, index: usize) -> T {
        unsafe { core::ptr::read_volatile(self.slot_ptr(index)) }
    }

    #[cfg(test)]
    pub(crate) fn put_slot(&mut self, index: usize, entry: T) {
        unsafe { core::ptr::write_volatile(self.slot_ptr(index), entry) };
    }
}
