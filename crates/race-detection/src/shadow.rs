use crate::clock::VectorClock;

/// The per-word update step of the shadow scan.
pub mod update;

/// The lock-free shadow region mirroring application memory.
pub mod memory;

pub use memory::ShadowMemory;

// ============================================================================
// Bit layout of a shadow word (least significant bit first):
pub(crate) const EPOCH_NUM_BITS: u32 = 42;
const EPOCH_BIT_OFFSET: u32 = 0;

const ADDR0_NUM_BITS: u32 = 3;
const ADDR0_BIT_OFFSET: u32 = EPOCH_BIT_OFFSET + EPOCH_NUM_BITS;

const SIZE_LOG_NUM_BITS: u32 = 2;
const SIZE_LOG_BIT_OFFSET: u32 = ADDR0_BIT_OFFSET + ADDR0_NUM_BITS;

const READ_BIT_OFFSET: u32 = SIZE_LOG_BIT_OFFSET + SIZE_LOG_NUM_BITS;
const ATOMIC_BIT_OFFSET: u32 = READ_BIT_OFFSET + 1;

pub(crate) const TID_NUM_BITS: u32 = 13;
const TID_BIT_OFFSET: u32 = ATOMIC_BIT_OFFSET + 1;

const FREED_BIT_OFFSET: u32 = 63;
// ============================================================================
const EPOCH_MASK: u64 = ((1 << EPOCH_NUM_BITS) - 1) << EPOCH_BIT_OFFSET;
const ADDR0_MASK: u64 = ((1 << ADDR0_NUM_BITS) - 1) << ADDR0_BIT_OFFSET;
const SIZE_LOG_MASK: u64 = ((1 << SIZE_LOG_NUM_BITS) - 1) << SIZE_LOG_BIT_OFFSET;
const READ_MASK: u64 = 1 << READ_BIT_OFFSET;
const ATOMIC_MASK: u64 = 1 << ATOMIC_BIT_OFFSET;
const TID_MASK: u64 = ((1 << TID_NUM_BITS) - 1) << TID_BIT_OFFSET;
const FREED_MASK: u64 = 1 << FREED_BIT_OFFSET;
// ============================================================================

/// Largest epoch a shadow word can carry.
pub const MAX_EPOCH: u64 = (1 << EPOCH_NUM_BITS) - 1;

/// Number of thread slots a shadow word can distinguish.
pub const MAX_TID: u32 = 1 << TID_NUM_BITS;

/// Size in bytes of the application memory cell covered by one shadow slot.
pub const SHADOW_CELL: u64 = 8;

/// Number of shadow words kept per application memory cell.
pub const SHADOW_CNT: usize = 4;

/// One recorded memory access, packed into 64 bits.
///
/// The all-zero word is the empty sentinel. Recorded accesses always carry an
/// epoch of at least `1`, so they never collide with it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Shadow(u64);

impl Shadow {
    pub const EMPTY: Shadow = Shadow(0);

    /// Creates a word for thread `tid` at `epoch` describing a plain 1-byte
    /// write at offset 0. Use the setters to describe the actual access.
    pub fn new(tid: u32, epoch: u64) -> Self {
        debug_assert!(tid < MAX_TID);
        debug_assert!(epoch <= MAX_EPOCH);
        Self(((u64::from(tid) << TID_BIT_OFFSET) & TID_MASK) | (epoch & EPOCH_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn tid(self) -> u32 {
        ((self.0 & TID_MASK) >> TID_BIT_OFFSET) as u32
    }

    pub fn epoch(self) -> u64 {
        (self.0 & EPOCH_MASK) >> EPOCH_BIT_OFFSET
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.0 = (self.0 & !EPOCH_MASK) | ((epoch << EPOCH_BIT_OFFSET) & EPOCH_MASK);
    }

    pub fn addr0(self) -> u64 {
        (self.0 & ADDR0_MASK) >> ADDR0_BIT_OFFSET
    }

    pub fn size_log(self) -> u32 {
        ((self.0 & SIZE_LOG_MASK) >> SIZE_LOG_BIT_OFFSET) as u32
    }

    /// Number of bytes covered by the recorded access.
    pub fn size(self) -> u64 {
        1 << self.size_log()
    }

    pub fn set_addr0_and_size_log(&mut self, addr0: u64, size_log: u32) {
        debug_assert!(addr0 < SHADOW_CELL);
        debug_assert!(size_log <= 3);
        self.0 = (self.0 & !(ADDR0_MASK | SIZE_LOG_MASK))
            | ((addr0 << ADDR0_BIT_OFFSET) & ADDR0_MASK)
            | ((u64::from(size_log) << SIZE_LOG_BIT_OFFSET) & SIZE_LOG_MASK);
    }

    pub fn is_write(self) -> bool {
        self.0 & READ_MASK == 0
    }

    pub fn set_write(&mut self, is_write: bool) {
        if is_write {
            self.0 &= !READ_MASK;
        } else {
            self.0 |= READ_MASK;
        }
    }

    pub fn is_atomic(self) -> bool {
        self.0 & ATOMIC_MASK != 0
    }

    pub fn set_atomic(&mut self, is_atomic: bool) {
        if is_atomic {
            self.0 |= ATOMIC_MASK;
        } else {
            self.0 &= !ATOMIC_MASK;
        }
    }

    pub fn is_freed(self) -> bool {
        self.0 & FREED_MASK != 0
    }

    pub fn mark_as_freed(&mut self) {
        self.0 |= FREED_MASK;
    }

    /// `true` iff both words were recorded by the same thread slot.
    #[inline]
    pub fn tids_are_equal(s1: Shadow, s2: Shadow) -> bool {
        (s1.0 ^ s2.0) & TID_MASK == 0
    }

    /// `true` iff both words cover exactly the same bytes of the cell.
    #[inline]
    pub fn addr0_and_size_are_equal(s1: Shadow, s2: Shadow) -> bool {
        (s1.0 ^ s2.0) & (ADDR0_MASK | SIZE_LOG_MASK) == 0
    }

    /// `true` iff the bytes of `s1` overlap an access of `s2_size` bytes at
    /// the offset of `s2`.
    #[inline]
    pub fn two_ranges_intersect(s1: Shadow, s2: Shadow, s2_size: u64) -> bool {
        let (a1, a2) = (s1.addr0(), s2.addr0());
        if a1 < a2 {
            s1.size() > a2 - a1
        } else {
            s2_size > a1 - a2
        }
    }

    /// `true` iff a new access of the given kind is at least as strong as the
    /// one recorded here, so replacing this word loses no information.
    ///
    /// Kinds are ordered plain write < plain read < atomic write < atomic read.
    #[inline]
    pub fn is_rw_weaker_or_equal(self, is_write: bool, is_atomic: bool) -> bool {
        let old_kind = (self.0 >> READ_BIT_OFFSET) & 0b11;
        let new_kind = u64::from(!is_write) | (u64::from(is_atomic) << 1);
        old_kind >= new_kind
    }

    /// `true` iff this word and a new access of the given kind are both reads
    /// or both atomic.
    #[inline]
    pub fn is_both_reads_or_atomic(self, is_write: bool, is_atomic: bool) -> bool {
        let both_reads = !is_write && !self.is_write();
        let both_atomic = is_atomic && self.is_atomic();
        both_reads || both_atomic
    }

    /// `true` iff the access recorded here happened before the point in time
    /// described by `clock`.
    #[inline]
    pub fn happens_before(self, clock: &VectorClock) -> bool {
        clock.observed(self.tid(), self.epoch())
    }
}

impl std::fmt::Debug for Shadow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_zero() {
            return f.write_str("Shadow(empty)");
        }
        f.debug_struct("Shadow")
            .field("tid", &self.tid())
            .field("epoch", &self.epoch())
            .field("addr0", &self.addr0())
            .field("size", &self.size())
            .field("write", &self.is_write())
            .field("atomic", &self.is_atomic())
            .field("freed", &self.is_freed())
            .finish()
    }
}
