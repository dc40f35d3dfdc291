//! Border node slot ordering.
//!
//! A [`Permutation`] is one `u64`: the low nibble is the number of occupied
//! slots, and nibble `i + 1` names the physical slot at sorted position `i`.
//! Positions `size..WIDTH` form the free list. Writers fill a free slot and
//! then publish a new permutation with a single store, so readers always see
//! either the old or the new order.
//!
//! ```text
//!  63    60 59    56          8 7     4 3     0
//! +--------+--------+-- ... --+--------+--------+
//! | pos 14 | pos 13 |          | pos 0  |  size  |
//! +--------+--------+-- ... --+--------+--------+
//! ```

/// Slots per border node.
pub const WIDTH: usize = 15;

const SIZE_MASK: u64 = 0xF;

/// Position `i` holds slot `WIDTH - 1 - i`, so the back of the free list is slot 0.
const EMPTY_VALUE: u64 = {
    let mut value: u64 = 0;
    let mut pos: usize = 0;

    while pos < WIDTH {
        value |= ((WIDTH - 1 - pos) as u64) << (pos * 4 + 4);
        pos += 1;
    }

    value
};

/// Packed sorted order of a border node's slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permutation {
    value: u64,
}

impl Default for Permutation {
    fn default() -> Self {
        Self::empty()
    }
}

impl Permutation {
    /// No occupied slots; slots are handed out 0, 1, 2, ...
    #[must_use]
    pub const fn empty() -> Self {
        Self { value: EMPTY_VALUE }
    }

    /// Slots `0..n` at positions `0..n`, the rest free with slot `n` at the back.
    ///
    /// Used for a node filled in order, such as the right half of a split.
    #[must_use]
    pub const fn make_sorted(n: usize) -> Self {
        debug_assert!(n <= WIDTH);

        let mut value: u64 = n as u64;
        let mut pos: usize = 0;

        while pos < n {
            value |= (pos as u64) << (pos * 4 + 4);
            pos += 1;
        }

        // Free positions n..WIDTH hold WIDTH-1 down to n.
        while pos < WIDTH {
            let slot: usize = WIDTH - 1 - (pos - n);
            value |= (slot as u64) << (pos * 4 + 4);
            pos += 1;
        }

        Self { value }
    }

    /// Rebuild from a word loaded from a node.
    #[inline]
    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self { value }
    }

    /// Raw word, for publishing.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Occupied slots.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        (self.value & SIZE_MASK) as usize
    }

    /// Free slots.
    #[inline]
    #[must_use]
    pub const fn free(&self) -> usize {
        WIDTH - self.size()
    }

    /// Physical slot at sorted position `pos`.
    #[inline]
    #[must_use]
    pub const fn get(&self, pos: usize) -> usize {
        debug_assert!(pos < WIDTH);

        ((self.value >> (pos * 4 + 4)) & 0xF) as usize
    }

    /// Next slot [`insert_from_back`](Self::insert_from_back) will hand out.
    #[inline]
    #[must_use]
    pub const fn back(&self) -> usize {
        self.get(WIDTH - 1)
    }

    /// Keep positions `0..n` as the occupied prefix; the rest become free.
    #[inline]
    pub fn set_size(&mut self, n: usize) {
        debug_assert!(n <= WIDTH);

        self.value = (self.value & !SIZE_MASK) | n as u64;
    }

    /// Take the slot at the back and place it at sorted position `pos`.
    ///
    /// Positions `pos..size` move up by one. Returns the slot.
    pub fn insert_from_back(&mut self, pos: usize) -> usize {
        debug_assert!(pos <= self.size(), "insert position past the end");
        debug_assert!(self.size() < WIDTH, "permutation is full");

        let slot: usize = self.back();
        let shift: usize = pos * 4 + 4;
        let low: u64 = (1u64 << shift) - 1;

        // size + 1 and the untouched prefix, the new slot, then everything at
        // or after `pos` moved up one nibble (dropping the old back).
        self.value = ((self.value + 1) & low)
            | ((slot as u64) << shift)
            | ((self.value << 4) & !(low | (0xF << shift)));

        self.debug_assert_valid();
        slot
    }

    /// Drop sorted position `pos`.
    ///
    /// The removed slot becomes the first free position (`size` after the
    /// call), so it is the last free slot to be handed out again.
    pub fn remove(&mut self, pos: usize) {
        let size: usize = self.size();
        debug_assert!(pos < size, "remove position past the end");

        if pos + 1 == size {
            self.value -= 1;
            self.debug_assert_valid();
            return;
        }

        // Rotate nibbles pos..size down by one, moving `pos` to `size - 1`.
        let span: usize = (size - pos - 1) * 4;
        let mask: u64 = (((1u64 << span) << 4) - 1) << (pos * 4 + 4);
        let window: u64 = self.value & mask;

        self.value = ((self.value - 1) & !mask)
            | ((window >> 4) & mask)
            | ((window << span) & mask);

        self.debug_assert_valid();
    }

    /// Occupied slots in sorted order.
    pub fn slots(self) -> impl Iterator<Item = usize> {
        (0..self.size()).map(move |pos| self.get(pos))
    }

    /// Panic unless every slot appears exactly once. Debug builds only.
    #[inline]
    pub fn debug_assert_valid(&self) {
        #[cfg(debug_assertions)]
        {
            assert!(self.size() <= WIDTH, "size {} > {WIDTH}", self.size());
            assert!(self.is_bijection(), "slot missing or repeated: {:#018x}", self.value);
        }
    }

    /// True if positions `0..WIDTH` name each slot exactly once.
    #[must_use]
    pub fn is_bijection(&self) -> bool {
        let mut seen: u16 = 0;

        for pos in 0..WIDTH {
            seen |= 1u16 << self.get(pos);
        }

        seen == (1u16 << WIDTH) - 1
    }
}
