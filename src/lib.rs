//! limen - a fixed-arena allocator with segregated free lists.
//!
//! One 64 KiB region (configurable) is reserved from the OS once and carved
//! into sixteen exact-size pools (8..=128 bytes) plus a residual general
//! pool. Blocks carry 24-byte boundary-tag headers, so both memory
//! neighbors are reachable in O(1); freed general-pool blocks are merged
//! with adjacent free neighbors before reinsertion.

use core::{
  fmt,
  mem::size_of,
  ptr::{NonNull, null_mut},
};

// =============================================================================
// Constants
// =============================================================================

/// Alignment unit. Payload sizes and block offsets are multiples of this.
const ALIGN: usize = 8;

/// Smallest payload handed out.
const MIN_PAYLOAD: usize = 8;

/// Per-block metadata size.
const HEADER_SIZE: usize = size_of::<Header>();
const HDR: u32 = HEADER_SIZE as u32;

/// Largest payload served by an exact-size pool.
const LARGEST_FIXED_SIZE: usize = 128;

/// Number of exact-size classes (8, 16, ..., 128).
const FIXED_CLASS_COUNT: usize = LARGEST_FIXED_SIZE / ALIGN;

/// Free-list classes: class 0 is the general catch-all, classes 1..=16 hold
/// payload size `class * 8`.
pub const CLASS_COUNT: usize = FIXED_CLASS_COUNT + 1;

const GENERAL_CLASS: usize = 0;

/// Null offset for free-list links.
const NIL: u32 = u32::MAX;

const DEFAULT_CAPACITY: usize = 64 * 1024;
const DEFAULT_POOL_SLOTS: usize = 20;

/// Payload size of class `class` (1..=16).
const fn class_size(class: usize) -> usize {
  class * ALIGN
}

/// Payload of a fixed pool's initial spanning block: room for `slots` blocks
/// of the class size, less the sentinel that takes the last header's place.
const fn pool_payload(class: usize, slots: usize) -> usize {
  (class_size(class) + HEADER_SIZE) * slots - HEADER_SIZE
}

/// Bytes consumed by all fixed pools, each with its own sentinel.
const fn fixed_region_size(slots: usize) -> usize {
  let mut class = 1;
  let mut total = 0;
  while class <= FIXED_CLASS_COUNT {
    total += HEADER_SIZE + pool_payload(class, slots) + HEADER_SIZE;
    class += 1;
  }
  total
}

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(size_of::<Header>() == 24);
const _: () = assert!(HEADER_SIZE % ALIGN == 0);
const _: () = assert!(ALIGN.is_power_of_two());
const _: () = assert!(MIN_PAYLOAD % ALIGN == 0);
const _: () = assert!(LARGEST_FIXED_SIZE % ALIGN == 0);
const _: () = assert!(DEFAULT_CAPACITY % ALIGN == 0);
const _: () = assert!(DEFAULT_CAPACITY <= u32::MAX as usize);
const _: () =
  assert!(fixed_region_size(DEFAULT_POOL_SLOTS) + 2 * HEADER_SIZE + MIN_PAYLOAD <= DEFAULT_CAPACITY);

// =============================================================================
// Errors
// =============================================================================

/// Failures reported by [`Allocator`] operations. None of them corrupt
/// allocator state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
  /// `allocate` was asked for zero bytes.
  InvalidRequest,
  /// No free block anywhere can satisfy the request. The arena never grows.
  OutOfMemory,
  /// `initialize` was called on an already-initialized allocator.
  ArenaAlreadyInitialized,
  /// The OS reservation failed, or the configured capacity cannot hold the
  /// fixed pools plus a minimal general pool.
  ReservationFailed,
}

impl fmt::Display for AllocError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let msg = match self {
      AllocError::InvalidRequest => "allocation size must be positive",
      AllocError::OutOfMemory => "no free block large enough",
      AllocError::ArenaAlreadyInitialized => "arena already initialized",
      AllocError::ReservationFailed => "arena reservation failed",
    };
    f.write_str(msg)
  }
}

impl std::error::Error for AllocError {}

// =============================================================================
// Types
// =============================================================================

/// Block metadata, written into the arena immediately before each payload.
///
/// `prev_size`/`prev_free` form the boundary tag: they mirror the memory
/// predecessor's payload size and status, so `before` needs no scan. The
/// list links are arena offsets and are meaningful only while the block is
/// free.
#[repr(C)]
struct Header {
  /// Payload size in bytes, a multiple of `ALIGN`. 0 only for sentinels.
  size: u32,
  /// Payload size of the memory predecessor (boundary tag).
  prev_size: u32,
  free: bool,
  prev_free: bool,
  _pad: [u8; 6],
  /// Next block in this block's free list, `NIL` at the tail.
  next: u32,
  /// Previous block in this block's free list, `NIL` at the head.
  prev: u32,
}

/// Read-only snapshot of one block, yielded by [`Allocator::blocks`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Header offset from the arena base.
  pub offset: usize,
  /// Payload size. 0 for sentinels.
  pub size: usize,
  pub free: bool,
  /// Boundary tag: the memory predecessor's payload size.
  pub prev_size: usize,
  pub prev_free: bool,
}

/// Aggregate of one free list, from [`Allocator::free_list_stats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeListStats {
  /// Number of blocks on the list.
  pub blocks: usize,
  /// Sum of their payload sizes.
  pub total_bytes: usize,
}

// =============================================================================
// Platform
// =============================================================================

/// Reserves `size` zero-filled bytes from the OS. The region is never
/// returned; process exit reclaims it.
fn os_reserve(size: usize) -> Option<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    None
  } else {
    NonNull::new(ptr as *mut u8)
  }
}

// =============================================================================
// Configuration
// =============================================================================

/// Arena geometry, fixed for the lifetime of an [`Allocator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
  /// Total arena capacity in bytes. Must be a multiple of 8, fit in `u32`,
  /// and leave room for the fixed pools plus a minimal general pool.
  pub capacity: usize,
  /// Blocks per exact-size pool.
  pub pool_slots: usize,
}

impl Default for ArenaConfig {
  fn default() -> Self {
    Self {
      capacity: DEFAULT_CAPACITY,
      pool_slots: DEFAULT_POOL_SLOTS,
    }
  }
}

impl ArenaConfig {
  fn layout_fits(&self) -> bool {
    self.pool_slots > 0
      && self.capacity % ALIGN == 0
      && self.capacity <= u32::MAX as usize
      && fixed_region_size(self.pool_slots) + 2 * HEADER_SIZE + MIN_PAYLOAD <= self.capacity
  }
}

// =============================================================================
// Arena
// =============================================================================

/// The reserved region plus the free-list registry. Offsets are `u32`
/// distances from `base`; every block reference in here is such an offset.
struct Arena {
  base: NonNull<u8>,
  capacity: u32,
  /// Offset of the general pool's first block. Blocks at or beyond it are
  /// eligible for coalescing; blocks below it belong to fixed pools.
  midway: u32,
  /// Free-list heads, indexed by class. `NIL` marks an empty list.
  lists: [u32; CLASS_COUNT],
}

impl Arena {
  /// Reserves the backing region and partitions it: fixed pools ascending
  /// by class, each one spanning free block plus a sentinel, then the
  /// general pool with the arena-ending sentinel.
  fn reserve(config: &ArenaConfig) -> Result<Arena, AllocError> {
    if !config.layout_fits() {
      return Err(AllocError::ReservationFailed);
    }

    let base = os_reserve(config.capacity).ok_or(AllocError::ReservationFailed)?;

    let mut arena = Arena {
      base,
      capacity: config.capacity as u32,
      midway: 0,
      lists: [NIL; CLASS_COUNT],
    };

    let mut off = 0u32;
    for class in 1..=FIXED_CLASS_COUNT {
      off = arena.init_pool(off, pool_payload(class, config.pool_slots) as u32, class);
    }

    // Whatever remains, minus its own header and the final sentinel, is the
    // general pool.
    arena.midway = off;
    let payload = arena.capacity - off - 2 * HDR;
    arena.init_pool(off, payload, GENERAL_CLASS);

    Ok(arena)
  }

  /// Writes one pool at `off`: a spanning free block of `payload` bytes on
  /// the class list, then the sentinel. Returns the offset past the
  /// sentinel.
  fn init_pool(&mut self, off: u32, payload: u32, class: usize) -> u32 {
    debug_assert!(payload as usize >= MIN_PAYLOAD);
    debug_assert!(payload as usize % ALIGN == 0);

    unsafe {
      let h = self.header(off);
      (*h).size = payload;
      (*h).prev_size = 0;
      (*h).free = true;
      (*h).prev_free = false;
    }

    // Sentinel: zero payload, never free, never on a list. Stops
    // boundary-tag walks at the pool edge.
    let sentinel = self.after(off);
    unsafe {
      let s = self.header(sentinel);
      (*s).size = 0;
      (*s).prev_size = payload;
      (*s).free = false;
      (*s).prev_free = true;
      (*s).next = NIL;
      (*s).prev = NIL;
    }

    self.insert(off, class);
    sentinel + HDR
  }

  #[inline]
  fn header(&self, off: u32) -> *mut Header {
    debug_assert!(off as usize % ALIGN == 0);
    debug_assert!(off as usize + HEADER_SIZE <= self.capacity as usize);
    unsafe { self.base.as_ptr().add(off as usize).cast::<Header>() }
  }

  #[inline]
  fn payload_ptr(&self, block: u32) -> *mut u8 {
    unsafe { self.base.as_ptr().add(block as usize + HEADER_SIZE) }
  }

  /// Offset of the block owning `ptr`. Inverse of `payload_ptr`.
  #[inline]
  fn offset_of(&self, ptr: *mut u8) -> u32 {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    debug_assert!(addr > base && addr < base + self.capacity as usize);
    debug_assert!((addr - base) % ALIGN == 0);
    (addr - base - HEADER_SIZE) as u32
  }

  // ---------------------------------------------------------------------------
  // Boundary-tag neighbor lookup
  // ---------------------------------------------------------------------------

  /// Immediate memory successor, from this block's own size.
  #[inline]
  fn after(&self, block: u32) -> u32 {
    block + HDR + unsafe { (*self.header(block)).size }
  }

  /// Immediate memory predecessor, from the boundary tag.
  #[inline]
  fn before(&self, block: u32) -> u32 {
    block - HDR - unsafe { (*self.header(block)).prev_size }
  }

  /// Re-publishes a free block's size and status into its successor's
  /// boundary tag. Every mutation of a block's size or status must keep
  /// that tag in step, or later backward walks go wrong.
  fn publish_free(&mut self, block: u32) {
    let size = unsafe { (*self.header(block)).size };
    let aft = self.after(block);
    unsafe {
      let a = self.header(aft);
      (*a).prev_size = size;
      (*a).prev_free = true;
    }
  }

  // ---------------------------------------------------------------------------
  // Free-list registry
  // ---------------------------------------------------------------------------

  /// Pushes `block` onto the head of `class`'s list.
  fn insert(&mut self, block: u32, class: usize) {
    debug_assert!(class < CLASS_COUNT);

    let head = self.lists[class];
    unsafe {
      let h = self.header(block);
      (*h).next = head;
      (*h).prev = NIL;
    }
    if head != NIL {
      unsafe { (*self.header(head)).prev = block };
    }
    self.lists[class] = block;
  }

  /// Unlinks `block` from `class`'s list in O(1) using its own links.
  fn detach(&mut self, block: u32, class: usize) {
    debug_assert!(class < CLASS_COUNT);

    let (next, prev) = unsafe {
      let h = &*self.header(block);
      (h.next, h.prev)
    };

    if next != NIL {
      unsafe { (*self.header(next)).prev = prev };
    }
    if prev != NIL {
      unsafe { (*self.header(prev)).next = next };
    } else {
      debug_assert!(self.lists[class] == block);
      self.lists[class] = next;
    }

    unsafe {
      let h = self.header(block);
      (*h).next = NIL;
      (*h).prev = NIL;
    }
  }

  /// First-fit scan of `class`'s list for a block of at least `size` bytes.
  /// Detaches the hit as a side effect; `None` on exhaustion.
  fn find(&mut self, size: u32, class: usize) -> Option<u32> {
    let mut cur = self.lists[class];
    while cur != NIL {
      let (cur_size, cur_next) = unsafe {
        let h = &*self.header(cur);
        debug_assert!(h.free);
        (h.size, h.next)
      };
      if cur_size >= size {
        self.detach(cur, class);
        return Some(cur);
      }
      cur = cur_next;
    }
    None
  }

  /// Class for an adjusted size: the exact class while its list has blocks,
  /// else the general catch-all.
  fn class_of(&self, size: u32) -> usize {
    let size = size as usize;
    if size <= LARGEST_FIXED_SIZE {
      debug_assert!(size % ALIGN == 0 && size >= MIN_PAYLOAD);
      let class = size / ALIGN;
      if self.lists[class] != NIL {
        return class;
      }
    }
    GENERAL_CLASS
  }

  // ---------------------------------------------------------------------------
  // Split
  // ---------------------------------------------------------------------------

  /// Carves the tail of a detached free block into an exactly-`size` block
  /// and reinserts the head remainder into `class`'s list. The tail, both
  /// new boundary tags, and the following block's tag are all updated here.
  fn split(&mut self, block: u32, size: u32, class: usize) -> u32 {
    let remaining = unsafe { (*self.header(block)).size } - size - HDR;
    debug_assert!(remaining >= MIN_PAYLOAD as u32);
    debug_assert!(remaining % ALIGN as u32 == 0);

    unsafe { (*self.header(block)).size = remaining };

    let tail = self.after(block);
    unsafe {
      let t = self.header(tail);
      (*t).size = size;
      (*t).prev_size = remaining;
      (*t).free = false;
      (*t).prev_free = true;
      (*t).next = NIL;
      (*t).prev = NIL;
    }

    let aft = self.after(tail);
    unsafe { (*self.header(aft)).prev_size = size };

    self.insert(block, class);
    tail
  }

  /// Marks `block` allocated and clears the successor's free tag.
  fn mark_allocated(&mut self, block: u32) {
    unsafe { (*self.header(block)).free = false };
    let aft = self.after(block);
    unsafe { (*self.header(aft)).prev_free = false };
  }

  // ---------------------------------------------------------------------------
  // Coalescing
  // ---------------------------------------------------------------------------

  /// Merges a freshly freed general-pool block with its free memory
  /// neighbors: one step backward via the boundary tag, then one step
  /// forward. One step each way suffices, since no two adjacent free
  /// blocks survive any release. Returns the final block for reinsertion.
  fn merge(&mut self, block: u32) -> u32 {
    let mut block = block;
    let aft = self.after(block);

    if unsafe { (*self.header(block)).prev_free } {
      let bef = self.before(block);
      self.detach(bef, GENERAL_CLASS);

      let total =
        unsafe { (*self.header(bef)).size } + unsafe { (*self.header(block)).size } + HDR;
      unsafe { (*self.header(bef)).size = total };
      unsafe {
        let a = self.header(aft);
        (*a).prev_size = total;
        (*a).prev_free = true;
      }

      block = bef;
    }

    if unsafe { (*self.header(aft)).free } {
      self.detach(aft, GENERAL_CLASS);

      let total =
        unsafe { (*self.header(block)).size } + unsafe { (*self.header(aft)).size } + HDR;
      unsafe { (*self.header(block)).size = total };

      let aftaft = self.after(aft);
      unsafe {
        let a = self.header(aftaft);
        (*a).prev_size = total;
        (*a).prev_free = true;
      }
    }

    block
  }
}

// =============================================================================
// Allocator
// =============================================================================

/// Rounds a request up to the alignment unit, floor [`MIN_PAYLOAD`].
const fn adjust(request: usize) -> usize {
  let size = (request + ALIGN - 1) & !(ALIGN - 1);
  if size < MIN_PAYLOAD { MIN_PAYLOAD } else { size }
}

/// A fixed-capacity allocator over one OS-reserved arena.
///
/// The arena is reserved lazily on first allocation (or eagerly via
/// [`initialize`](Allocator::initialize)) and lives until process exit.
/// Single-owner: the type is neither `Send` nor `Sync`.
pub struct Allocator {
  config: ArenaConfig,
  arena: Option<Arena>,
}

impl Allocator {
  pub fn new() -> Self {
    Self::with_config(ArenaConfig::default())
  }

  pub fn with_config(config: ArenaConfig) -> Self {
    Self {
      config,
      arena: None,
    }
  }

  /// Explicit one-time setup. Fails with `ArenaAlreadyInitialized` if the
  /// arena exists (prior allocations stay untouched) and with
  /// `ReservationFailed` if the OS reservation or the configured layout is
  /// impossible.
  pub fn initialize(&mut self) -> Result<(), AllocError> {
    if self.arena.is_some() {
      return Err(AllocError::ArenaAlreadyInitialized);
    }
    self.arena = Some(Arena::reserve(&self.config)?);
    Ok(())
  }

  fn ensure_arena(&mut self) -> Result<&mut Arena, AllocError> {
    if self.arena.is_none() {
      self.arena = Some(Arena::reserve(&self.config)?);
    }
    self.arena.as_mut().ok_or(AllocError::ReservationFailed)
  }

  /// Configured arena capacity in bytes.
  pub fn capacity(&self) -> usize {
    self.config.capacity
  }

  /// Allocates at least `request` bytes and returns the payload pointer.
  ///
  /// The request is rounded up to a multiple of 8 (floor 8), routed to its
  /// exact-size class while that class has free blocks, else to the
  /// general pool. An oversized candidate is split, with the tail handed
  /// out and the remainder reinserted; a candidate without room for an
  /// independent remainder is handed out whole.
  pub fn allocate(&mut self, request: usize) -> Result<NonNull<u8>, AllocError> {
    if request == 0 {
      return Err(AllocError::InvalidRequest);
    }

    let arena = self.ensure_arena()?;

    if request >= arena.capacity as usize {
      return Err(AllocError::OutOfMemory);
    }

    let size = adjust(request) as u32;
    let class = arena.class_of(size);
    let Some(candidate) = arena.find(size, class) else {
      return Err(AllocError::OutOfMemory);
    };

    let candidate_size = unsafe { (*arena.header(candidate)).size };
    let block = if candidate_size >= size + HDR + MIN_PAYLOAD as u32 {
      arena.split(candidate, size, class)
    } else {
      candidate
    };

    arena.mark_allocated(block);
    Ok(unsafe { NonNull::new_unchecked(arena.payload_ptr(block)) })
  }

  /// Releases a block previously returned by [`allocate`](Self::allocate).
  /// Null is a no-op. Blocks at or beyond the fixed/general boundary are
  /// merged with free neighbors and rejoin the general list; fixed-pool
  /// blocks rejoin their exact-size list with no coalescing.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a pointer obtained from `allocate` on this very
  /// allocator that has not been released since. Releasing a foreign or
  /// already-released pointer, or using the payload afterwards, is
  /// undefined; headers carry no validation tags.
  pub unsafe fn release(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }

    debug_assert!(self.arena.is_some());
    let Some(arena) = self.arena.as_mut() else {
      return;
    };

    let block = arena.offset_of(ptr);
    debug_assert!(unsafe { !(*arena.header(block)).free });
    unsafe { (*arena.header(block)).free = true };

    if block >= arena.midway {
      let merged = arena.merge(block);
      arena.publish_free(merged);
      arena.insert(merged, GENERAL_CLASS);
    } else {
      // Fixed pools are never reshaped: no coalescing, straight back onto
      // the exact-size list.
      arena.publish_free(block);
      let class = unsafe { (*arena.header(block)).size } as usize / ALIGN;
      debug_assert!(class >= 1 && class <= FIXED_CLASS_COUNT);
      arena.insert(block, class);
    }
  }

  // ---------------------------------------------------------------------------
  // Diagnostics (read-only)
  // ---------------------------------------------------------------------------

  /// Walks every block in the arena by boundary tags, sentinels included.
  /// Empty before the arena exists. Must not overlap a mutating call,
  /// which the `&self` borrow enforces.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      arena: self.arena.as_ref(),
      off: 0,
    }
  }

  /// Length and byte total of one free list.
  pub fn free_list_stats(&self, class: usize) -> FreeListStats {
    assert!(class < CLASS_COUNT, "free-list class out of range");

    let mut stats = FreeListStats::default();
    let Some(arena) = self.arena.as_ref() else {
      return stats;
    };

    let mut cur = arena.lists[class];
    while cur != NIL {
      let (size, next) = unsafe {
        let h = &*arena.header(cur);
        (h.size, h.next)
      };
      stats.blocks += 1;
      stats.total_bytes += size as usize;
      cur = next;
    }
    stats
  }
}

impl Default for Allocator {
  fn default() -> Self {
    Self::new()
  }
}

/// Iterator over [`BlockInfo`] snapshots, see [`Allocator::blocks`].
pub struct Blocks<'a> {
  arena: Option<&'a Arena>,
  off: u32,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let arena = self.arena?;
    if self.off >= arena.capacity {
      return None;
    }

    let off = self.off;
    let info = unsafe {
      let h = &*arena.header(off);
      BlockInfo {
        offset: off as usize,
        size: h.size as usize,
        free: h.free,
        prev_size: h.prev_size as usize,
        prev_free: h.prev_free,
      }
    };
    self.off = arena.after(off);
    Some(info)
  }
}

// =============================================================================
// Tests
// =============================================================================
