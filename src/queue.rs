//! Fixed-capacity block queue.
//!
//! Entries live in fixed-size blocks held in an arena and linked head to
//! tail. Pushing never moves existing entries; a fully consumed block goes
//! onto a free list and is reused. The queue keeps at least one block.

const BLOCK_SIZE: usize = 2048;

struct Block<T> {
    slots: Vec<Option<T>>,
    /// Next slot to read.
    bottom: usize,
    /// Next slot to write.
    top: usize,
    next: Option<usize>,
}

impl<T> Block<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            bottom: 0,
            top: 0,
            next: None,
        }
    }

    fn is_full(&self) -> bool {
        self.top == self.slots.len()
    }

    fn is_drained(&self) -> bool {
        self.bottom == self.top
    }
}

/// FIFO queue with O(1) push and shift.
pub struct FixedQueue<T> {
    blocks: Vec<Block<T>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
    block_size: usize,
}

impl<T> Default for FixedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FixedQueue<T> {
    pub fn new() -> Self {
        Self::with_block_size(BLOCK_SIZE)
    }

    pub(crate) fn with_block_size(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            blocks: vec![Block::new(block_size)],
            free: Vec::new(),
            head: 0,
            tail: 0,
            len: 0,
            block_size,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of blocks currently linked, including the spare head block.
    pub fn block_count(&self) -> usize {
        self.blocks.len() - self.free.len()
    }

    pub fn push(&mut self, value: T) {
        if self.blocks[self.tail].is_full() {
            let index = match self.free.pop() {
                Some(index) => index,
                None => {
                    self.blocks.push(Block::new(self.block_size));
                    self.blocks.len() - 1
                }
            };
            self.blocks[self.tail].next = Some(index);
            self.tail = index;
        }
        let block = &mut self.blocks[self.tail];
        block.slots[block.top] = Some(value);
        block.top += 1;
        self.len += 1;
    }

    pub fn shift(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        if self.blocks[self.head].is_drained() {
            // Only a full block can be drained while entries remain.
            let next = self.blocks[self.head].next.take()?;
            let old = self.head;
            self.blocks[old].bottom = 0;
            self.blocks[old].top = 0;
            self.free.push(old);
            self.head = next;
        }
        let block = &mut self.blocks[self.head];
        let value = block.slots[block.bottom].take();
        block.bottom += 1;
        self.len -= 1;
        if self.len == 0 {
            self.reset_head();
        }
        value
    }

    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let block = &self.blocks[self.head];
        if block.is_drained() {
            let next = block.next?;
            return self.blocks[next].slots[0].as_ref();
        }
        block.slots[block.bottom].as_ref()
    }

    /// Empty queue: rewind the head block and release the rest.
    fn reset_head(&mut self) {
        let mut cursor = self.blocks[self.head].next.take();
        while let Some(index) = cursor {
            cursor = self.blocks[index].next.take();
            self.blocks[index].bottom = 0;
            self.blocks[index].top = 0;
            self.free.push(index);
        }
        let head = &mut self.blocks[self.head];
        head.bottom = 0;
        head.top = 0;
        self.tail = self.head;
    }
}
