//! Lock-free MPMC queue, grounded on
//! `engine/core/concurrency/lock_free_queue.h` and
//! `engine/core/ring_buffer_allocator.h`.
//!
//! The queue is a Michael-Scott linked list whose nodes live in a
//! fixed-capacity ring buffer rather than the heap: `enqueue` allocates a
//! cell from the ring, links it in with a CAS loop, and `dequeue` unlinks
//! the head cell and frees it back to the ring. Head/tail are tagged
//! pointers (`counter << 32 | index`) so the ABA problem cannot resurrect a
//! freed-and-reused cell as the same pointer value.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NULL_INDEX: u32 = 0xFFFF_FFFF;

fn pack(counter: u32, index: u32) -> u64 {
    (counter as u64) << 32 | index as u64
}

fn unpack(tagged: u64) -> (u32, u32) {
    ((tagged >> 32) as u32, tagged as u32)
}

struct Cell<T> {
    value: Option<T>,
    next: AtomicU64,
    in_use: AtomicBool,
}

impl<T> Cell<T> {
    fn empty() -> Self {
        Cell {
            value: None,
            next: AtomicU64::new(pack(0, NULL_INDEX)),
            in_use: AtomicBool::new(false),
        }
    }
}

/// Fixed-capacity cell pool backing the queue's linked list. Cells are
/// reused: `allocate` spins forward over the ring looking for a free slot,
/// `free` marks a slot available again.
struct RingAllocator<T> {
    cells: Box<[std::cell::UnsafeCell<Cell<T>>]>,
    cursor: AtomicU64,
}

// SAFETY: access to `cells[i]` is only ever performed by the thread that
// holds the corresponding index after a successful CAS into the list, or
// during `allocate`/`free` which only touch `in_use` atomically.
unsafe impl<T: Send> Sync for RingAllocator<T> {}

impl<T> RingAllocator<T> {
    fn new(capacity: usize) -> Self {
        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(std::cell::UnsafeCell::new(Cell::empty()));
        }
        RingAllocator {
            cells: cells.into_boxed_slice(),
            cursor: AtomicU64::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Spins until a free cell is found, stores `value` in it, and returns
    /// its index.
    fn allocate(&self, value: T) -> u32 {
        let cap = self.capacity() as u64;
        loop {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % cap;
            let idx = start as usize;
            let cell = unsafe { &*self.cells[idx].get() };
            if cell
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let cell_mut = unsafe { &mut *self.cells[idx].get() };
                cell_mut.value = Some(value);
                cell_mut.next.store(pack(0, NULL_INDEX), Ordering::Release);
                return idx as u32;
            }
            std::hint::spin_loop();
        }
    }

    fn cell(&self, index: u32) -> &Cell<T> {
        unsafe { &*self.cells[index as usize].get() }
    }

    /// Returns a cell to the pool, dropping its stored value.
    fn free(&self, index: u32) {
        let cell = unsafe { &mut *self.cells[index as usize].get() };
        cell.value = None;
        cell.in_use.store(false, Ordering::Release);
    }
}

/// A lock-free multi-producer multi-consumer queue backed by a fixed-size
/// ring of cells, matching `LockFreeQueue<T>`'s semantics.
pub struct LockFreeQueue<T> {
    allocator: RingAllocator<T>,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    #[cfg(debug_assertions)]
    enqueued: AtomicU64,
    #[cfg(debug_assertions)]
    dequeued: AtomicU64,
}

impl<T> LockFreeQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let allocator = RingAllocator::new(capacity + 1);
        let dummy = allocator.allocate_dummy();
        LockFreeQueue {
            allocator,
            head: CachePadded::new(AtomicU64::new(pack(0, dummy))),
            tail: CachePadded::new(AtomicU64::new(pack(0, dummy))),
            #[cfg(debug_assertions)]
            enqueued: AtomicU64::new(0),
            #[cfg(debug_assertions)]
            dequeued: AtomicU64::new(0),
        }
    }

    pub fn enqueue(&self, value: T) {
        let new_index = self.allocator.allocate(value);
        loop {
            let tail_tagged = self.tail.load(Ordering::Acquire);
            let (tail_counter, tail_index) = unpack(tail_tagged);
            let tail_cell = self.allocator.cell(tail_index);
            let next_tagged = tail_cell.next.load(Ordering::Acquire);
            let (next_counter, next_index) = unpack(next_tagged);

            if tail_tagged == self.tail.load(Ordering::Acquire) {
                if next_index == NULL_INDEX {
                    let new_next = pack(next_counter.wrapping_add(1), new_index);
                    if tail_cell
                        .next
                        .compare_exchange(
                            next_tagged,
                            new_next,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        let new_tail = pack(tail_counter.wrapping_add(1), new_index);
                        let _ = self.tail.compare_exchange(
                            tail_tagged,
                            new_tail,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        );
                        #[cfg(debug_assertions)]
                        self.enqueued.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                } else {
                    let new_tail = pack(tail_counter.wrapping_add(1), next_index);
                    let _ = self.tail.compare_exchange(
                        tail_tagged,
                        new_tail,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
            }
        }
    }

    pub fn dequeue(&self) -> Option<T> {
        loop {
            let head_tagged = self.head.load(Ordering::Acquire);
            let tail_tagged = self.tail.load(Ordering::Acquire);
            let (head_counter, head_index) = unpack(head_tagged);
            let (tail_counter, tail_index) = unpack(tail_tagged);
            let head_cell = self.allocator.cell(head_index);
            let next_tagged = head_cell.next.load(Ordering::Acquire);
            let (next_counter, next_index) = unpack(next_tagged);

            if head_tagged != self.head.load(Ordering::Acquire) {
                continue;
            }

            if head_index == tail_index {
                if next_index == NULL_INDEX {
                    return None;
                }
                let new_tail = pack(tail_counter.wrapping_add(1), next_index);
                let _ = self.tail.compare_exchange(
                    tail_tagged,
                    new_tail,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            } else {
                if next_index == NULL_INDEX {
                    continue;
                }
                let next_cell = self.allocator.cell(next_index);
                let value = unsafe { (*self.cell_ptr(next_index)).value.take() };
                let new_head = pack(head_counter.wrapping_add(1), next_index);
                if self
                    .head
                    .compare_exchange(head_tagged, new_head, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.allocator.free(head_index);
                    #[cfg(debug_assertions)]
                    self.dequeued.fetch_add(1, Ordering::Relaxed);
                    let _ = next_cell;
                    return value;
                }
            }
        }
    }

    /// Raw pointer accessor used only to take ownership of a cell's value
    /// once it is known to be the winning dequeue; `dequeue` is the sole
    /// caller and only reads a cell still linked into the list.
    fn cell_ptr(&self, index: u32) -> *mut Cell<T> {
        self.allocator.cells[index as usize].get()
    }

    #[cfg(debug_assertions)]
    pub fn len_hint(&self) -> u64 {
        self.enqueued
            .load(Ordering::Relaxed)
            .saturating_sub(self.dequeued.load(Ordering::Relaxed))
    }
}

impl<T> RingAllocator<T> {
    /// Allocates the dummy head node used by an empty queue; it carries no
    /// value.
    fn allocate_dummy(&self) -> u32 {
        let cap = self.capacity() as u64;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % cap;
        let idx = start as usize;
        let cell = unsafe { &*self.cells[idx].get() };
        cell.in_use.store(true, Ordering::Release);
        idx as u32
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        let (_, head_index) = unpack(self.head.load(Ordering::Acquire));
        let (_, tail_index) = unpack(self.tail.load(Ordering::Acquire));
        debug_assert_eq!(
            head_index, tail_index,
            "queue dropped while non-empty: head and tail cells differ"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_thread_fifo_order() {
        let queue = LockFreeQueue::new(16);
        for i in 0..10 {
            queue.enqueue(i);
        }
        for i in 0..10 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn one_producer_many_consumers() {
        let queue = Arc::new(LockFreeQueue::new(1024));
        const ITEMS: u64 = 99_999;
        const CONSUMERS: usize = 7;
        let producing = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let producer = {
            let queue = Arc::clone(&queue);
            let producing = Arc::clone(&producing);
            thread::spawn(move || {
                for i in 0..ITEMS {
                    queue.enqueue(i);
                }
                producing.store(false, Ordering::Release);
            })
        };

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let producing = Arc::clone(&producing);
                thread::spawn(move || {
                    let mut count = 0u64;
                    loop {
                        match queue.dequeue() {
                            Some(_) => count += 1,
                            None => {
                                if !producing.load(Ordering::Acquire) {
                                    break;
                                }
                                std::thread::yield_now();
                            }
                        }
                    }
                    count
                })
            })
            .collect();

        producer.join().unwrap();
        let total: u64 = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, ITEMS);
    }
}
