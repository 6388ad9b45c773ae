//! Storage primitives shared by the whole compiler: a bump arena with
//! checkpoint/restore, and a free-list pool of power-of-two spans carved
//! out of a shared vector.
//!
//! Arenas back everything whose lifetime is "one frame" or "the graph":
//! argument data, variables, parameter declarations, names. Spans back
//! the per-node edge lists and per-entry access lists.

use std::fmt::{self, Write as _};
use std::mem;

use crate::error::{Error, Result};

const NONE: u32 = !0u32;

//--------------------------------------------------------------------------------------------------
// Bump arena

/// A range of bytes inside an [`Arena`].
///
/// References into the arena are integer handles rather than pointers, so
/// arena-stored structures can refer to each other without self-borrowing.
/// A handle is invalidated by any reset that covers it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArenaRef {
    block: u32,
    offset: u32,
    len: u32,
}

impl ArenaRef {
    pub const EMPTY: ArenaRef = ArenaRef {
        block: 0,
        offset: 0,
        len: 0,
    };

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-range of this allocation.
    pub fn slice(&self, offset: usize, len: usize) -> ArenaRef {
        debug_assert!(offset + len <= self.len());
        ArenaRef {
            block: self.block,
            offset: self.offset + offset as u32,
            len: len as u32,
        }
    }
}

struct Block {
    storage: Box<[u8]>,
    used: usize,
}

impl Block {
    fn with_capacity(capacity: usize) -> Block {
        Block {
            storage: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }
}

/// Records the arena's fill level so everything allocated afterwards can be
/// released in one step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArenaCheckpoint {
    num_blocks: u32,
    used_in_last: usize,
}

/// A singly-growing list of fixed blocks with bump allocation.
///
/// `reset_to` moves blocks newer than the checkpoint onto a free list
/// instead of returning them to the system allocator, so a steady-state
/// frame loop stops allocating after the first few frames.
pub struct Arena {
    blocks: Vec<Block>,
    free_blocks: Vec<Block>,
    default_block_size: usize,
    last_alloc: Option<ArenaRef>,
}

impl Arena {
    pub fn new(default_block_size: usize) -> Arena {
        Arena {
            blocks: Vec::new(),
            free_blocks: Vec::new(),
            default_block_size: default_block_size.max(64),
            last_alloc: None,
        }
    }

    /// Allocates `size` bytes aligned to `align` (a power of two), zero
    /// initialized.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<ArenaRef> {
        if size > u32::max_value() as usize {
            return Err(Error::IntegerOverflow);
        }
        let need_block = match self.blocks.last() {
            Some(block) => align_up(block.used, align) + size > block.storage.len(),
            None => true,
        };
        if need_block {
            self.acquire_block(size + align);
        }
        let block_index = self.blocks.len() - 1;
        let block = &mut self.blocks[block_index];
        let offset = align_up(block.used, align);
        block.used = offset + size;
        for b in &mut block.storage[offset..offset + size] {
            *b = 0;
        }
        let r = ArenaRef {
            block: block_index as u32,
            offset: offset as u32,
            len: size as u32,
        };
        self.last_alloc = Some(r);
        Ok(r)
    }

    /// Grows the most recent allocation in place when possible; otherwise
    /// allocates anew and copies the old bytes over.
    pub fn realloc(&mut self, r: ArenaRef, new_size: usize, align: usize) -> Result<ArenaRef> {
        if new_size <= r.len() {
            return Ok(ArenaRef {
                len: new_size as u32,
                ..r
            });
        }
        if self.last_alloc == Some(r) {
            let block = &mut self.blocks[r.block as usize];
            let end = r.offset as usize + new_size;
            if end <= block.storage.len() {
                for b in &mut block.storage[block.used..end] {
                    *b = 0;
                }
                block.used = end;
                let grown = ArenaRef {
                    len: new_size as u32,
                    ..r
                };
                self.last_alloc = Some(grown);
                return Ok(grown);
            }
        }
        let new_ref = self.alloc(new_size, align)?;
        let (src_block, dst_block) =
            index_pair(&mut self.blocks, r.block as usize, new_ref.block as usize);
        match (src_block, dst_block) {
            (src, Some(dst)) => {
                dst.storage[new_ref.offset as usize..new_ref.offset as usize + r.len()]
                    .copy_from_slice(&src.storage[r.offset as usize..r.offset as usize + r.len()]);
            }
            (same, None) => {
                same.storage.copy_within(
                    r.offset as usize..r.offset as usize + r.len(),
                    new_ref.offset as usize,
                );
            }
        }
        Ok(new_ref)
    }

    /// Copies `data` into the arena.
    pub fn store_bytes(&mut self, data: &[u8]) -> Result<ArenaRef> {
        let r = self.alloc(data.len(), 1)?;
        self.bytes_mut(r).copy_from_slice(data);
        Ok(r)
    }

    /// Copies a slice of `Copy` values into the arena.
    pub fn store_slice<T: Copy>(&mut self, data: &[T]) -> Result<ArenaRef> {
        let size = mem::size_of::<T>();
        let r = self.alloc(size * data.len(), mem::align_of::<T>().min(16))?;
        for (i, value) in data.iter().enumerate() {
            self.write::<T>(r.slice(i * size, size), *value)?;
        }
        Ok(r)
    }

    /// Stores a single `Copy` value.
    pub fn store_value<T: Copy>(&mut self, value: T) -> Result<ArenaRef> {
        let r = self.alloc(mem::size_of::<T>(), mem::align_of::<T>().min(16))?;
        self.write::<T>(r, value)?;
        Ok(r)
    }

    pub fn bytes(&self, r: ArenaRef) -> &[u8] {
        let block = &self.blocks[r.block as usize];
        &block.storage[r.offset as usize..r.offset as usize + r.len()]
    }

    pub fn bytes_mut(&mut self, r: ArenaRef) -> &mut [u8] {
        let block = &mut self.blocks[r.block as usize];
        &mut block.storage[r.offset as usize..r.offset as usize + r.len()]
    }

    /// Reads a `Copy` value out of an arena range. The range length must
    /// match the value size exactly.
    pub fn read<T: Copy>(&self, r: ArenaRef) -> Result<T> {
        if r.len() != mem::size_of::<T>() {
            return Err(Error::TypeMismatch);
        }
        let bytes = self.bytes(r);
        // Arena offsets only guarantee the alignment requested at alloc
        // time, so go through an unaligned read.
        Ok(unsafe { (bytes.as_ptr() as *const T).read_unaligned() })
    }

    /// Writes a `Copy` value into an arena range allocated for it.
    pub fn write<T: Copy>(&mut self, r: ArenaRef, value: T) -> Result<()> {
        if r.len() != mem::size_of::<T>() {
            return Err(Error::TypeMismatch);
        }
        let bytes = self.bytes_mut(r);
        unsafe { (bytes.as_mut_ptr() as *mut T).write_unaligned(value) };
        Ok(())
    }

    pub fn checkpoint(&self) -> ArenaCheckpoint {
        ArenaCheckpoint {
            num_blocks: self.blocks.len() as u32,
            used_in_last: self.blocks.last().map_or(0, |b| b.used),
        }
    }

    /// Releases everything allocated after `cp`. Released blocks move onto
    /// a free list for reuse.
    pub fn reset_to(&mut self, cp: ArenaCheckpoint) {
        while self.blocks.len() > cp.num_blocks as usize {
            let mut block = match self.blocks.pop() {
                Some(b) => b,
                None => break,
            };
            block.used = 0;
            self.free_blocks.push(block);
        }
        if let Some(block) = self.blocks.last_mut() {
            block.used = cp.used_in_last;
        }
        self.last_alloc = None;
    }

    /// Releases everything.
    pub fn reset(&mut self) {
        self.reset_to(ArenaCheckpoint {
            num_blocks: 0,
            used_in_last: 0,
        });
    }

    fn acquire_block(&mut self, min_size: usize) {
        let wanted = self.default_block_size.max(min_size);
        // Free-list blocks are only reused when they fit the request.
        if let Some(pos) = self
            .free_blocks
            .iter()
            .position(|b| b.storage.len() >= wanted)
        {
            let block = self.free_blocks.swap_remove(pos);
            self.blocks.push(block);
        } else {
            self.blocks.push(Block::with_capacity(wanted));
        }
    }
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Borrows two blocks at distinct indices, or one block when the indices
/// collide.
fn index_pair(blocks: &mut [Block], a: usize, b: usize) -> (&mut Block, Option<&mut Block>) {
    if a == b {
        (&mut blocks[a], None)
    } else if a < b {
        let (lo, hi) = blocks.split_at_mut(b);
        (&mut lo[a], Some(&mut hi[0]))
    } else {
        let (lo, hi) = blocks.split_at_mut(a);
        (&mut hi[0], Some(&mut lo[b]))
    }
}

//--------------------------------------------------------------------------------------------------
// Span pool

/// A power-of-two sized window into a shared storage vector.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Span {
    pub(crate) offset: u32,
    pub(crate) count: u32,
}

impl Span {
    pub const EMPTY: Span = Span {
        offset: 0,
        count: 0,
    };

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current capacity: count rounded up to the next power of two.
    fn capacity(&self) -> u32 {
        if self.count == 0 {
            0
        } else {
            self.count.next_power_of_two()
        }
    }

    pub fn get<'a, T>(&self, storage: &'a [T]) -> &'a [T] {
        &storage[self.offset as usize..(self.offset + self.count) as usize]
    }

    pub fn get_mut<'a, T>(&self, storage: &'a mut [T]) -> &'a mut [T] {
        &mut storage[self.offset as usize..(self.offset + self.count) as usize]
    }
}

/// Element type stored in a [`SpanPool`].
///
/// The pool threads its free list through the first word of each freed
/// span, so elements must be plain old data of at least one `u32`.
pub trait PoolItem: Copy {
    fn from_free_link(next: u32) -> Self;
    fn free_link(&self) -> u32;
}

impl PoolItem for u32 {
    fn from_free_link(next: u32) -> u32 {
        next
    }

    fn free_link(&self) -> u32 {
        *self
    }
}

/// 32 free lists indexed by `log2(capacity)`. Growing a span past a power
/// of two boundary allocates the next size up, copies, and recycles the
/// old storage.
pub struct SpanPool<T: PoolItem> {
    free_heads: [u32; 32],
    _marker: std::marker::PhantomData<T>,
}

impl<T: PoolItem> SpanPool<T> {
    // The free list reuses the first word of a freed span.
    const ELEMENT_HOLDS_FREE_LINK: () =
        [()][(mem::size_of::<T>() < mem::size_of::<u32>()) as usize];

    pub fn new() -> SpanPool<T> {
        let _ = Self::ELEMENT_HOLDS_FREE_LINK;
        SpanPool {
            free_heads: [NONE; 32],
            _marker: std::marker::PhantomData,
        }
    }

    /// Appends `value` to `span`, growing it through the pool as needed.
    pub fn push(&mut self, storage: &mut Vec<T>, span: &mut Span, value: T) -> Result<()> {
        let capacity = span.capacity();
        if span.count == capacity {
            let new_log2 = if capacity == 0 {
                0
            } else {
                32 - capacity.leading_zeros()
            };
            if new_log2 >= 32 {
                return Err(Error::IntegerOverflow);
            }
            let new_offset = self.alloc_storage(storage, new_log2)?;
            for i in 0..span.count {
                let v = storage[(span.offset + i) as usize];
                storage[(new_offset + i) as usize] = v;
            }
            let old = *span;
            *span = Span {
                offset: new_offset,
                count: span.count,
            };
            if old.count > 0 {
                self.recycle(storage, old.offset, 31 - old.capacity().leading_zeros());
            }
        }
        storage[(span.offset + span.count) as usize] = value;
        span.count += 1;
        Ok(())
    }

    /// Returns `span`'s storage to the pool and empties it.
    pub fn free(&mut self, storage: &mut Vec<T>, span: &mut Span) {
        if span.count > 0 {
            let log2 = 31 - span.capacity().leading_zeros();
            self.recycle(storage, span.offset, log2);
        }
        *span = Span::EMPTY;
    }

    /// Duplicates `span`'s contents into fresh pool storage.
    pub fn clone_span(&mut self, storage: &mut Vec<T>, span: Span) -> Result<Span> {
        let mut out = Span::EMPTY;
        for i in 0..span.count {
            let v = storage[(span.offset + i) as usize];
            self.push(storage, &mut out, v)?;
        }
        Ok(out)
    }

    fn alloc_storage(&mut self, storage: &mut Vec<T>, log2: u32) -> Result<u32> {
        let head = self.free_heads[log2 as usize];
        if head != NONE {
            self.free_heads[log2 as usize] = storage[head as usize].free_link();
            return Ok(head);
        }
        let offset = storage.len();
        if offset + (1usize << log2) > u32::max_value() as usize {
            return Err(Error::IntegerOverflow);
        }
        storage.resize(offset + (1usize << log2), T::from_free_link(0));
        Ok(offset as u32)
    }

    fn recycle(&mut self, storage: &mut Vec<T>, offset: u32, log2: u32) {
        storage[offset as usize] = T::from_free_link(self.free_heads[log2 as usize]);
        self.free_heads[log2 as usize] = offset;
    }
}

//--------------------------------------------------------------------------------------------------
// Fixed-capacity name builder

/// Bounded inline string builder for diagnostic names. Appends past the
/// capacity are truncated rather than reallocated.
#[derive(Copy, Clone)]
pub struct NameBuf {
    buf: [u8; NameBuf::CAPACITY],
    len: usize,
}

impl NameBuf {
    pub const CAPACITY: usize = 120;

    pub fn new() -> NameBuf {
        NameBuf {
            buf: [0; NameBuf::CAPACITY],
            len: 0,
        }
    }

    pub fn from_str(s: &str) -> NameBuf {
        let mut buf = NameBuf::new();
        let _ = buf.write_str(s);
        buf
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }

    pub fn append_format(&mut self, args: fmt::Arguments) {
        let _ = self.write_fmt(args);
    }
}

impl fmt::Write for NameBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = NameBuf::CAPACITY - self.len;
        let take = if s.len() <= room {
            s.len()
        } else {
            // Truncate at a character boundary.
            let mut take = room;
            while take > 0 && !s.is_char_boundary(take) {
                take -= 1;
            }
            take
        };
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

impl fmt::Debug for NameBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for NameBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for NameBuf {
    fn default() -> NameBuf {
        NameBuf::new()
    }
}

impl PartialEq for NameBuf {
    fn eq(&self, other: &NameBuf) -> bool {
        self.as_str() == other.as_str()
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_alloc_and_reset() {
        let mut arena = Arena::new(256);
        let cp = arena.checkpoint();
        let a = arena.alloc(16, 8).unwrap();
        let b = arena.alloc(100, 4).unwrap();
        assert_eq!(arena.bytes(a).len(), 16);
        assert_eq!(arena.bytes(b).len(), 100);
        arena.reset_to(cp);
        let c = arena.alloc(16, 8).unwrap();
        // The same storage is handed out again after the reset.
        assert_eq!(c, a);
    }

    #[test]
    fn arena_block_reuse_after_reset() {
        let mut arena = Arena::new(64);
        let cp = arena.checkpoint();
        for _ in 0..8 {
            arena.alloc(60, 4).unwrap();
        }
        let blocks_before = arena.blocks.len();
        arena.reset_to(cp);
        for _ in 0..8 {
            arena.alloc(60, 4).unwrap();
        }
        assert_eq!(arena.blocks.len(), blocks_before);
        assert!(arena.free_blocks.is_empty());
    }

    #[test]
    fn arena_realloc_extends_last_in_place() {
        let mut arena = Arena::new(256);
        let a = arena.alloc(8, 4).unwrap();
        let grown = arena.realloc(a, 32, 4).unwrap();
        assert_eq!(grown.block, a.block);
        assert_eq!(grown.offset, a.offset);
        assert_eq!(grown.len(), 32);
    }

    #[test]
    fn arena_realloc_copies_when_not_last() {
        let mut arena = Arena::new(256);
        let a = arena.store_bytes(&[1, 2, 3, 4]).unwrap();
        let _b = arena.alloc(8, 4).unwrap();
        let moved = arena.realloc(a, 16, 4).unwrap();
        assert_ne!((moved.block, moved.offset), (a.block, a.offset));
        assert_eq!(&arena.bytes(moved)[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn arena_typed_roundtrip() {
        let mut arena = Arena::new(256);
        let r = arena
            .alloc(mem::size_of::<u64>(), mem::align_of::<u64>())
            .unwrap();
        arena.write::<u64>(r, 0xdead_beef_cafe).unwrap();
        assert_eq!(arena.read::<u64>(r).unwrap(), 0xdead_beef_cafe);
        assert_eq!(arena.read::<u32>(r), Err(Error::TypeMismatch));
    }

    #[test]
    fn span_pool_grows_by_powers_of_two() {
        let mut storage: Vec<u32> = Vec::new();
        let mut pool = SpanPool::<u32>::new();
        let mut span = Span::EMPTY;
        for i in 0..9u32 {
            pool.push(&mut storage, &mut span, i).unwrap();
        }
        assert_eq!(span.len(), 9);
        assert_eq!(span.get(&storage), &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        // capacity 1 + 2 + 4 + 8 spans were recycled; 16 live
        assert_eq!(storage.len(), 1 + 2 + 4 + 8 + 16);
    }

    #[test]
    fn span_pool_free_then_alloc_returns_same_offset() {
        let mut storage: Vec<u32> = Vec::new();
        let mut pool = SpanPool::<u32>::new();
        let mut span = Span::EMPTY;
        for i in 0..4u32 {
            pool.push(&mut storage, &mut span, i).unwrap();
        }
        let offset = span.offset;
        pool.free(&mut storage, &mut span);

        let mut other = Span::EMPTY;
        for i in 0..4u32 {
            pool.push(&mut storage, &mut other, i).unwrap();
        }
        // The capacity-4 span comes straight off the free list.
        assert_eq!(other.offset, offset);
    }

    #[test]
    fn span_pool_reuses_intermediate_capacities() {
        let mut storage: Vec<u32> = Vec::new();
        let mut pool = SpanPool::<u32>::new();
        let mut a = Span::EMPTY;
        for i in 0..3u32 {
            pool.push(&mut storage, &mut a, i).unwrap();
        }
        // Growing `a` from 1 to 4 capacity freed spans of capacity 1 and 2;
        // a fresh span picks those up without touching the storage tail.
        let len = storage.len();
        let mut b = Span::EMPTY;
        pool.push(&mut storage, &mut b, 7).unwrap();
        pool.push(&mut storage, &mut b, 8).unwrap();
        assert_eq!(storage.len(), len);
        assert_eq!(b.get(&storage), &[7, 8]);
    }

    #[test]
    fn name_buf_truncates() {
        let mut name = NameBuf::new();
        for _ in 0..40 {
            name.append_format(format_args!("abcd"));
        }
        assert_eq!(name.as_str().len(), NameBuf::CAPACITY);
        assert!(name.as_str().starts_with("abcdabcd"));
    }
}
