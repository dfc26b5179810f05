//! Memory arena access for the engine's linear memory.
//!
//! Buffers cross the engine boundary as `(ptr, len)` pairs in a flat, 32-bit
//! addressed memory. The host allocates a region, copies bytes in, hands the
//! pointer to the engine, copies the result out and releases every region it
//! (or the engine, on its behalf) allocated.
//!
//! [`Arena`] is the accessor seam. Implementations only supply allocation and
//! raw memory views; bounds-checked reads and writes are provided on top.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{BridgeError, Result};

/// A pointer into the engine's linear memory. Offset 0 is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ArenaPtr(u32);

impl ArenaPtr {
    /// The null pointer.
    pub const NULL: ArenaPtr = ArenaPtr(0);

    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one, or `None` on 32-bit overflow.
    pub fn add(self, bytes: u32) -> Option<ArenaPtr> {
        self.0.checked_add(bytes).map(ArenaPtr)
    }
}

impl fmt::Display for ArenaPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Resolve `(ptr, len)` to a byte range of a memory of `mem_len` bytes.
fn checked_range(ptr: ArenaPtr, len: u64, mem_len: usize) -> Result<Range<usize>> {
    let start = ptr.offset() as u64;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= mem_len as u64)
        .ok_or(BridgeError::OutOfBounds {
            ptr: ptr.offset(),
            len,
        })?;
    Ok(start as usize..end as usize)
}

/// Access to an engine's linear memory.
///
/// Every successful [`Arena::allocate`] must be matched by exactly one
/// [`Arena::release`]. Double release is undefined at the engine level.
pub trait Arena {
    /// Reserve `size` bytes. Fails with [`BridgeError::OutOfMemory`].
    fn allocate(&mut self, size: u32) -> Result<ArenaPtr>;

    /// Return a region obtained from [`Arena::allocate`].
    fn release(&mut self, ptr: ArenaPtr) -> Result<()>;

    /// The whole linear memory.
    fn memory(&self) -> &[u8];

    /// The whole linear memory, mutably.
    fn memory_mut(&mut self) -> &mut [u8];

    /// Copy `bytes` into memory starting at `ptr`.
    fn write(&mut self, ptr: ArenaPtr, bytes: &[u8]) -> Result<()> {
        let range = checked_range(ptr, bytes.len() as u64, self.memory().len())?;
        self.memory_mut()[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Borrow `len` bytes starting at `ptr`.
    fn slice(&self, ptr: ArenaPtr, len: u32) -> Result<&[u8]> {
        let mem = self.memory();
        let range = checked_range(ptr, len as u64, mem.len())?;
        Ok(&mem[range])
    }

    /// Copy `len` bytes starting at `ptr` into a host-owned buffer.
    fn read(&self, ptr: ArenaPtr, len: u32) -> Result<Vec<u8>> {
        Ok(self.slice(ptr, len)?.to_vec())
    }

    fn read_u32(&self, ptr: ArenaPtr) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.slice(ptr, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&self, ptr: ArenaPtr) -> Result<i32> {
        self.read_u32(ptr).map(|v| v as i32)
    }

    fn read_u64(&self, ptr: ArenaPtr) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.slice(ptr, 8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a NUL-terminated UTF-8 string starting at `ptr`.
    fn read_cstring(&self, ptr: ArenaPtr) -> Result<String> {
        let mem = self.memory();
        let tail = mem
            .get(ptr.offset() as usize..)
            .ok_or(BridgeError::OutOfBounds {
                ptr: ptr.offset(),
                len: 1,
            })?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(BridgeError::UnterminatedString(ptr.offset()))?;
        Ok(String::from_utf8(tail[..end].to_vec())?)
    }

    /// Read a NUL-terminated string stored inline in a fixed `capacity` buffer.
    ///
    /// A buffer with no terminator is read to its full capacity.
    fn read_cstring_bounded(&self, ptr: ArenaPtr, capacity: u32) -> Result<String> {
        let buf = self.slice(ptr, capacity)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8(buf[..end].to_vec())?)
    }

    fn write_u32(&mut self, ptr: ArenaPtr, value: u32) -> Result<()> {
        self.write(ptr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, ptr: ArenaPtr, value: u64) -> Result<()> {
        self.write(ptr, &value.to_le_bytes())
    }
}

/// Allocation counters for [`MemoryArena`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Successful allocations since creation
    pub allocations: u64,
    /// Successful releases since creation
    pub releases: u64,
    /// Live allocations
    pub outstanding: usize,
    /// Bytes requested by live allocations
    pub bytes_in_use: u64,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: u32,
    span: u32,
}

/// Lowest address ever handed out. Keeps offset 0 free to mean null.
const BASE: u32 = 8;
const ALIGN: u32 = 8;

fn align_up(value: u32) -> Option<u32> {
    value.checked_add(ALIGN - 1).map(|v| v & !(ALIGN - 1))
}

/// In-process linear memory with a first-fit allocator.
///
/// Used as the memory of the stub engine and in tests. Unlike a raw engine
/// heap it knows every live block, so it rejects double release and writes
/// past the end of a block, and it counts outstanding allocations.
#[derive(Debug)]
pub struct MemoryArena {
    data: Vec<u8>,
    capacity: u32,
    blocks: BTreeMap<u32, Block>,
    stats: Arc<Mutex<ArenaStats>>,
}

impl MemoryArena {
    /// Default capacity: 64 MiB.
    pub const DEFAULT_CAPACITY: u32 = 64 * 1024 * 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create an arena that never grows beyond `capacity` bytes.
    pub fn with_capacity(capacity: u32) -> Self {
        Self::with_shared_stats(capacity, Arc::default())
    }

    /// Create an arena whose counters are also visible through `stats`.
    pub fn with_shared_stats(capacity: u32, stats: Arc<Mutex<ArenaStats>>) -> Self {
        Self {
            data: vec![0; BASE as usize],
            capacity,
            blocks: BTreeMap::new(),
            stats,
        }
    }

    pub fn stats(&self) -> ArenaStats {
        *self.stats.lock()
    }

    /// Number of live allocations.
    pub fn outstanding(&self) -> usize {
        self.stats.lock().outstanding
    }

    /// True if `ptr` is the start of a live allocation.
    pub fn is_live(&self, ptr: ArenaPtr) -> bool {
        self.blocks.contains_key(&ptr.offset())
    }

    /// Size requested for the live allocation starting at `ptr`.
    pub fn allocation_size(&self, ptr: ArenaPtr) -> Option<u32> {
        self.blocks.get(&ptr.offset()).map(|b| b.size)
    }

    fn find_gap(&self, span: u32) -> Option<u32> {
        let mut cursor = BASE;
        for (&start, block) in &self.blocks {
            if start - cursor >= span {
                return Some(cursor);
            }
            cursor = start + block.span;
        }
        (cursor as u64 + span as u64 <= self.capacity as u64).then_some(cursor)
    }

    /// The live block containing `[ptr, ptr + len)`, if any.
    fn owning_block(&self, ptr: ArenaPtr, len: u64) -> Option<(u32, Block)> {
        let (&start, &block) = self.blocks.range(..=ptr.offset()).next_back()?;
        let end = start as u64 + block.size as u64;
        (ptr.offset() as u64 + len <= end).then_some((start, block))
    }
}

impl Default for MemoryArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena for MemoryArena {
    fn allocate(&mut self, size: u32) -> Result<ArenaPtr> {
        let out_of_memory = BridgeError::OutOfMemory {
            requested: size as u64,
        };
        // Zero-sized requests still get a unique, releasable block.
        let span = align_up(size.max(1)).ok_or(out_of_memory)?;
        let start = self.find_gap(span).ok_or(BridgeError::OutOfMemory {
            requested: size as u64,
        })?;

        let end = (start + span) as usize;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start as usize..end].fill(0);

        self.blocks.insert(start, Block { size, span });
        let mut stats = self.stats.lock();
        stats.allocations += 1;
        stats.outstanding += 1;
        stats.bytes_in_use += size as u64;
        drop(stats);

        tracing::trace!(ptr = start, size, "arena allocate");
        Ok(ArenaPtr::new(start))
    }

    fn release(&mut self, ptr: ArenaPtr) -> Result<()> {
        let block = self
            .blocks
            .remove(&ptr.offset())
            .ok_or(BridgeError::InvalidRelease(ptr.offset()))?;
        let mut stats = self.stats.lock();
        stats.releases += 1;
        stats.outstanding -= 1;
        stats.bytes_in_use -= block.size as u64;
        drop(stats);

        tracing::trace!(ptr = ptr.offset(), size = block.size, "arena release");
        Ok(())
    }

    fn memory(&self) -> &[u8] {
        &self.data
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn write(&mut self, ptr: ArenaPtr, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        if self.owning_block(ptr, len).is_none() {
            return Err(BridgeError::OutOfBounds {
                ptr: ptr.offset(),
                len,
            });
        }
        let range = checked_range(ptr, len, self.data.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }
}
