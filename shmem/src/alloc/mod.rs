//! First-fit node allocator over a byte heap addressed by offsets.
//!
//! Every block starts with a [`NodeHeader`]. Free blocks form a singly linked
//! list kept in address order, which makes coalescing a local operation: on
//! free, a block merges with the free block that ends where it starts and the
//! one that starts where it ends. A free block that reaches the heap top is
//! handed back to the tail.
//!
//! The allocator holds no lock of its own; callers hold the queue mutex.

use std::mem;
use std::slice;

use tracing::trace;

use crate::core::{align_up, HeapState, ALIGN, NIL};
use crate::errors::{QueueError, Result};

pub(crate) const NODE_FREE: u64 = 0x4652_4545_4e4f_4445; // "FREENODE"
pub(crate) const NODE_LIVE: u64 = 0x4c49_5645_4e4f_4445; // "LIVENODE"

#[repr(C)]
#[derive(Debug)]
pub(crate) struct NodeHeader {
    pub state: u64,
    /// Whole block, header included.
    pub block_size: u64,
    pub payload: u64,
    pub len: u64,
    pub next: u64,
    _reserved: u64,
}

pub(crate) const NODE_HEADER_SIZE: usize = mem::size_of::<NodeHeader>();
pub const MIN_BLOCK_SIZE: usize = NODE_HEADER_SIZE + ALIGN;

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocStats {
    pub free_nodes: usize,
    pub free_list_bytes: usize,
    pub tail_bytes: usize,
    pub largest_free_block: usize,
}

impl AllocStats {
    pub fn free_bytes(&self) -> usize {
        self.free_list_bytes + self.tail_bytes
    }
}

/// Block size needed to hold `len` payload bytes.
pub(crate) fn block_size_for(len: usize) -> Option<usize> {
    let raw = len.checked_add(NODE_HEADER_SIZE)?.checked_add(ALIGN - 1)?;
    Some((raw & !(ALIGN - 1)).max(MIN_BLOCK_SIZE))
}

pub(crate) struct NodeAllocator {
    base: *mut u8,
}

impl NodeAllocator {
    /// # Safety
    /// `base` must stay mapped for the allocator's lifetime and cover every
    /// offset below the `end` of any [`HeapState`] passed to it.
    pub unsafe fn new(base: *mut u8) -> NodeAllocator {
        NodeAllocator { base }
    }

    pub fn init(heap: &mut HeapState, start: usize, end: usize) {
        let start = align_up(start, ALIGN) as u64;
        *heap = HeapState {
            start,
            top: start,
            end: end as u64,
            free_head: NIL,
        };
    }

    /// Hands out a LIVE node able to hold `len` bytes and returns its offset.
    pub fn allocate(&self, heap: &mut HeapState, len: usize) -> Result<u64> {
        let need = block_size_for(len).ok_or(QueueError::OutOfSpace { requested: len })? as u64;

        let mut prev = NIL;
        let mut cur = heap.free_head;
        let mut steps = 0;
        while cur != NIL {
            steps += 1;
            self.check_steps(heap, steps)?;
            let (block_size, next) = {
                let node = self.node_in_state(heap, cur, NODE_FREE)?;
                (node.block_size, node.next)
            };
            if block_size >= need {
                let rest = block_size - need;
                let replacement = if rest >= MIN_BLOCK_SIZE as u64 {
                    let split = cur + need;
                    self.write_free(split, rest, next);
                    self.node_at(cur).block_size = need;
                    split
                } else {
                    next
                };
                self.link_after(heap, prev, replacement)?;
                trace!(node = cur, len, block_size = self.node_at(cur).block_size, "allocated from free list");
                return Ok(self.make_live(cur, len));
            }
            prev = cur;
            cur = next;
        }

        if tail_bytes(heap)? >= need {
            let node = heap.top;
            heap.top += need;
            self.node_at(node).block_size = need;
            trace!(node, len, block_size = need, "carved from tail");
            return Ok(self.make_live(node, len));
        }
        Err(QueueError::OutOfSpace { requested: len })
    }

    /// Returns a LIVE node to the free list, merging it with its physical neighbours.
    pub fn free(&self, heap: &mut HeapState, node: u64) -> Result<()> {
        let mut size = self.node_in_state(heap, node, NODE_LIVE)?.block_size;

        // pprev -> prev -> cur, with prev < node < cur in address order.
        let mut pprev = NIL;
        let mut prev = NIL;
        let mut cur = heap.free_head;
        let mut steps = 0;
        while cur != NIL && cur < node {
            steps += 1;
            self.check_steps(heap, steps)?;
            let next = self.node_in_state(heap, cur, NODE_FREE)?.next;
            pprev = prev;
            prev = cur;
            cur = next;
        }
        if cur == node {
            return Err(QueueError::corruption(format!("node {} is already on the free list", node)));
        }

        let mut next = cur;
        if cur != NIL {
            let succ = self.node_in_state(heap, cur, NODE_FREE)?;
            let end = end_of(node, size)?;
            if end > cur {
                return Err(QueueError::corruption(format!("node {} overlaps free node {}", node, cur)));
            }
            if end == cur {
                size += succ.block_size;
                next = succ.next;
                succ.state = 0;
            }
        }

        let (start, start_pred) = if prev != NIL {
            let pred = self.node_in_state(heap, prev, NODE_FREE)?;
            let pred_end = end_of(prev, pred.block_size)?;
            if pred_end > node {
                return Err(QueueError::corruption(format!("free node {} overlaps node {}", prev, node)));
            }
            if pred_end == node {
                pred.block_size = end_of(pred.block_size, size)?;
                pred.next = next;
                self.node_at(node).state = 0;
                (prev, pprev)
            } else {
                self.write_free(node, size, next);
                pred.next = node;
                (node, prev)
            }
        } else {
            self.write_free(node, size, next);
            heap.free_head = node;
            (node, NIL)
        };

        let merged = self.node_at(start);
        if end_of(start, merged.block_size)? == heap.top {
            if merged.next != NIL {
                return Err(QueueError::corruption(format!(
                    "free node {} ends at the heap top but links to {}",
                    start, merged.next
                )));
            }
            merged.state = 0;
            self.link_after(heap, start_pred, NIL)?;
            heap.top = start;
            trace!(node, top = heap.top, "returned block to tail");
        } else {
            trace!(node, block = start, block_size = merged.block_size, "freed block");
        }
        Ok(())
    }

    /// Resolves `node` to a LIVE header, checking range and state.
    #[allow(clippy::mut_from_ref)]
    pub fn live(&self, heap: &HeapState, node: u64) -> Result<&mut NodeHeader> {
        self.node_in_state(heap, node, NODE_LIVE)
    }

    pub fn payload(&self, heap: &HeapState, node: u64) -> Result<&[u8]> {
        let header = self.live(heap, node)?;
        let (payload, len) = (header.payload, header.len as usize);
        self.check_payload(node, header.block_size, payload, len)?;
        Ok(unsafe { slice::from_raw_parts(self.base.add(payload as usize), len) })
    }

    #[allow(clippy::mut_from_ref)]
    pub fn payload_mut(&self, heap: &HeapState, node: u64) -> Result<&mut [u8]> {
        let header = self.live(heap, node)?;
        let (payload, len) = (header.payload, header.len as usize);
        self.check_payload(node, header.block_size, payload, len)?;
        Ok(unsafe { slice::from_raw_parts_mut(self.base.add(payload as usize), len) })
    }

    pub fn stats(&self, heap: &HeapState) -> Result<AllocStats> {
        let mut stats = AllocStats {
            tail_bytes: tail_bytes(heap)? as usize,
            ..Default::default()
        };
        let mut cur = heap.free_head;
        while cur != NIL {
            stats.free_nodes += 1;
            self.check_steps(heap, stats.free_nodes)?;
            let node = self.node_in_state(heap, cur, NODE_FREE)?;
            let size = node.block_size as usize;
            stats.free_list_bytes += size;
            stats.largest_free_block = stats.largest_free_block.max(size);
            cur = node.next;
        }
        Ok(stats)
    }

    fn check_steps(&self, heap: &HeapState, steps: usize) -> Result<()> {
        let span = heap
            .end
            .checked_sub(heap.start)
            .ok_or_else(|| QueueError::corruption(format!("heap start {} is past its end {}", heap.start, heap.end)))?;
        let max = span as usize / MIN_BLOCK_SIZE + 1;
        if steps > max {
            return Err(QueueError::corruption("cycle in free list"));
        }
        Ok(())
    }

    fn check_payload(&self, node: u64, block_size: u64, payload: u64, len: usize) -> Result<()> {
        if payload != node + NODE_HEADER_SIZE as u64 || len as u64 > block_size - NODE_HEADER_SIZE as u64 {
            return Err(QueueError::corruption(format!(
                "node {} has payload {}+{} outside its {} byte block",
                node, payload, len, block_size
            )));
        }
        Ok(())
    }

    #[allow(clippy::mut_from_ref)]
    fn node_in_state(&self, heap: &HeapState, node: u64, state: u64) -> Result<&mut NodeHeader> {
        let in_range = node
            .checked_add(NODE_HEADER_SIZE as u64)
            .map_or(false, |end| end <= heap.top && heap.top <= heap.end);
        if node < heap.start || node % ALIGN as u64 != 0 || !in_range {
            return Err(QueueError::corruption(format!(
                "node offset {} outside heap [{}, {})",
                node, heap.start, heap.top
            )));
        }
        let header = self.node_at(node);
        if header.state != state {
            return Err(QueueError::corruption(format!(
                "node {} has state {:#x}, expected {:#x}",
                node, header.state, state
            )));
        }
        let size = header.block_size;
        let fits = node.checked_add(size).map_or(false, |end| end <= heap.top);
        if size < MIN_BLOCK_SIZE as u64 || size % ALIGN as u64 != 0 || !fits {
            return Err(QueueError::corruption(format!("node {} has invalid block size {}", node, size)));
        }
        Ok(header)
    }

    #[allow(clippy::mut_from_ref)]
    fn node_at(&self, node: u64) -> &mut NodeHeader {
        unsafe { &mut *(self.base.add(node as usize) as *mut NodeHeader) }
    }

    fn write_free(&self, node: u64, block_size: u64, next: u64) {
        let header = self.node_at(node);
        header.state = NODE_FREE;
        header.block_size = block_size;
        header.payload = NIL;
        header.len = 0;
        header.next = next;
    }

    fn make_live(&self, node: u64, len: usize) -> u64 {
        let header = self.node_at(node);
        header.state = NODE_LIVE;
        header.payload = node + NODE_HEADER_SIZE as u64;
        header.len = len as u64;
        header.next = NIL;
        node
    }

    fn link_after(&self, heap: &mut HeapState, prev: u64, next: u64) -> Result<()> {
        if prev == NIL {
            heap.free_head = next;
        } else {
            self.node_in_state(heap, prev, NODE_FREE)?.next = next;
        }
        Ok(())
    }
}

/// Offset one past a block, failing on arithmetic a sane heap never needs.
fn end_of(node: u64, size: u64) -> Result<u64> {
    node.checked_add(size)
        .ok_or_else(|| QueueError::corruption(format!("node {} of {} bytes overflows the offset space", node, size)))
}

fn tail_bytes(heap: &HeapState) -> Result<u64> {
    heap.end
        .checked_sub(heap.top)
        .ok_or_else(|| QueueError::corruption(format!("heap top {} is past its end {}", heap.top, heap.end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP_START: usize = 64;

    struct TestHeap {
        mem: Vec<u128>,
        heap: HeapState,
    }

    impl TestHeap {
        fn new(bytes: usize) -> TestHeap {
            let mem = vec![0u128; bytes / 16];
            let mut heap = HeapState::default();
            NodeAllocator::init(&mut heap, HEAP_START, bytes);
            TestHeap { mem, heap }
        }

        fn allocator(&mut self) -> NodeAllocator {
            unsafe { NodeAllocator::new(self.mem.as_mut_ptr() as *mut u8) }
        }
    }

    #[test]
    fn block_size_rounds_up() {
        assert_eq!(block_size_for(0), Some(MIN_BLOCK_SIZE));
        assert_eq!(block_size_for(16), Some(NODE_HEADER_SIZE + 16));
        assert_eq!(block_size_for(17), Some(NODE_HEADER_SIZE + 32));
        assert_eq!(block_size_for(usize::MAX), None);
    }

    #[test]
    fn carves_from_tail_in_order() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 10)?;
        let b = alloc.allocate(&mut t.heap, 100)?;
        assert_eq!(a, HEAP_START as u64);
        assert_eq!(b, a + MIN_BLOCK_SIZE as u64);
        assert_eq!(t.heap.top, b + block_size_for(100).unwrap() as u64);
        assert_eq!(alloc.payload(&t.heap, b)?.len(), 100);
        Ok(())
    }

    #[test]
    fn freed_block_is_reused_first_fit() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 200)?;
        let _b = alloc.allocate(&mut t.heap, 8)?;
        alloc.free(&mut t.heap, a)?;
        let top = t.heap.top;

        // Small request splits the free block, leaving the remainder on the list.
        let c = alloc.allocate(&mut t.heap, 8)?;
        assert_eq!(c, a);
        assert_eq!(t.heap.free_head, a + MIN_BLOCK_SIZE as u64);
        assert_eq!(t.heap.top, top);

        let stats = alloc.stats(&t.heap)?;
        assert_eq!(stats.free_nodes, 1);
        assert_eq!(stats.free_list_bytes, block_size_for(200).unwrap() - MIN_BLOCK_SIZE);
        Ok(())
    }

    #[test]
    fn free_coalesces_neighbours_and_returns_tail() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 32)?;
        let b = alloc.allocate(&mut t.heap, 32)?;
        let c = alloc.allocate(&mut t.heap, 32)?;
        let d = alloc.allocate(&mut t.heap, 32)?;

        alloc.free(&mut t.heap, b)?;
        alloc.free(&mut t.heap, a)?;
        let stats = alloc.stats(&t.heap)?;
        assert_eq!(stats.free_nodes, 1);
        assert_eq!(stats.largest_free_block, 2 * block_size_for(32).unwrap());

        // c bridges the a+b block and nothing, d is still live.
        alloc.free(&mut t.heap, c)?;
        assert_eq!(alloc.stats(&t.heap)?.free_nodes, 1);

        alloc.free(&mut t.heap, d)?;
        assert_eq!(t.heap.top, t.heap.start);
        assert_eq!(t.heap.free_head, NIL);
        assert_eq!(alloc.stats(&t.heap)?.tail_bytes, 4096 - HEAP_START);
        Ok(())
    }

    #[test]
    fn free_bridges_two_free_neighbours() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 32)?;
        let b = alloc.allocate(&mut t.heap, 32)?;
        let c = alloc.allocate(&mut t.heap, 32)?;
        let _d = alloc.allocate(&mut t.heap, 32)?;

        alloc.free(&mut t.heap, c)?;
        alloc.free(&mut t.heap, a)?;
        assert_eq!(alloc.stats(&t.heap)?.free_nodes, 2);
        alloc.free(&mut t.heap, b)?;
        let stats = alloc.stats(&t.heap)?;
        assert_eq!(stats.free_nodes, 1);
        assert_eq!(stats.largest_free_block, 3 * block_size_for(32).unwrap());
        assert_eq!(t.heap.free_head, a);
        Ok(())
    }

    #[test]
    fn exhausted_heap_is_out_of_space_until_freed() -> Result<()> {
        let mut t = TestHeap::new(HEAP_START + 4 * MIN_BLOCK_SIZE);
        let alloc = t.allocator();
        let nodes = (0..4)
            .map(|_| alloc.allocate(&mut t.heap, 1))
            .collect::<Result<Vec<_>>>()?;
        assert!(matches!(
            alloc.allocate(&mut t.heap, 1),
            Err(QueueError::OutOfSpace { requested: 1 })
        ));
        alloc.free(&mut t.heap, nodes[2])?;
        assert_eq!(alloc.allocate(&mut t.heap, 1)?, nodes[2]);
        Ok(())
    }

    #[test]
    fn double_free_is_corruption() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 8)?;
        let _b = alloc.allocate(&mut t.heap, 8)?;
        alloc.free(&mut t.heap, a)?;
        assert!(matches!(alloc.free(&mut t.heap, a), Err(QueueError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn out_of_range_offset_is_corruption() {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        assert!(matches!(alloc.free(&mut t.heap, 8), Err(QueueError::Corruption(_))));
        assert!(matches!(alloc.live(&t.heap, 1 << 40), Err(QueueError::Corruption(_))));
    }

    #[test]
    fn free_list_cycle_is_corruption() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 8)?;
        let _b = alloc.allocate(&mut t.heap, 8)?;
        let c = alloc.allocate(&mut t.heap, 8)?;
        let _d = alloc.allocate(&mut t.heap, 8)?;
        alloc.free(&mut t.heap, a)?;
        alloc.free(&mut t.heap, c)?;
        // c -> a closes the loop a -> c -> a.
        alloc.node_at(c).next = a;
        assert!(matches!(alloc.stats(&t.heap), Err(QueueError::Corruption(_))));
        assert!(matches!(alloc.allocate(&mut t.heap, 512), Err(QueueError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn wrapping_free_list_offset_is_corruption() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 8)?;
        let _b = alloc.allocate(&mut t.heap, 8)?;
        alloc.free(&mut t.heap, a)?;
        // Aligned, and its header end wraps past zero.
        alloc.node_at(a).next = u64::MAX - 15;
        assert!(matches!(alloc.stats(&t.heap), Err(QueueError::Corruption(_))));
        assert!(matches!(alloc.allocate(&mut t.heap, 512), Err(QueueError::Corruption(_))));
        assert!(matches!(alloc.live(&t.heap, u64::MAX - 15), Err(QueueError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn heap_top_past_end_is_corruption() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 8)?;
        t.heap.top = t.heap.end + ALIGN as u64;
        assert!(matches!(alloc.stats(&t.heap), Err(QueueError::Corruption(_))));
        assert!(matches!(alloc.allocate(&mut t.heap, 8), Err(QueueError::Corruption(_))));
        assert!(matches!(alloc.free(&mut t.heap, a), Err(QueueError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn oversized_block_size_is_corruption() -> Result<()> {
        let mut t = TestHeap::new(4096);
        let alloc = t.allocator();
        let a = alloc.allocate(&mut t.heap, 8)?;
        alloc.node_at(a).block_size = u64::MAX - 15;
        assert!(matches!(alloc.free(&mut t.heap, a), Err(QueueError::Corruption(_))));
        assert!(matches!(alloc.payload(&t.heap, a), Err(QueueError::Corruption(_))));
        Ok(())
    }
}
