//! Key slicing.
//!
//! A key is consumed 8 bytes at a time. Each chunk becomes an `ikey`: the bytes
//! read big-endian and zero-padded, so integer order equals byte order. The
//! number of real bytes in the chunk (0..=8) is kept next to the ikey, which
//! makes `"ab"` sort before `"ab\0"` even though both pad to the same ikey.

/// Bytes per key slice.
pub const IKEY_SIZE: usize = 8;

/// Longest accepted key.
pub const MAX_KEY_LENGTH: usize = 256;

/// Rank of a slot holding a full 8-byte slice or a layer pointer.
pub const FULL_SLICE_RANK: u8 = 8;

/// Read up to 8 bytes of `data` as a big-endian, zero-padded slice.
#[inline]
#[must_use]
pub fn read_ikey(data: &[u8]) -> u64 {
    let n: usize = data.len().min(IKEY_SIZE);
    let mut bytes: [u8; IKEY_SIZE] = [0; IKEY_SIZE];
    bytes[..n].copy_from_slice(&data[..n]);

    u64::from_be_bytes(bytes)
}

/// A key positioned at one layer of the trie.
///
/// `offset` is the number of bytes consumed by the layers above.
#[derive(Debug, Clone, Copy)]
pub struct Key<'a> {
    data: &'a [u8],
    offset: usize,
    ikey: u64,
}

impl<'a> Key<'a> {
    /// Position a key at the top layer.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            ikey: read_ikey(data),
        }
    }

    /// Position a key at layer `depth` (0 is the top layer).
    #[must_use]
    pub fn at_depth(data: &'a [u8], depth: usize) -> Self {
        let offset: usize = (depth * IKEY_SIZE).min(data.len());

        Self {
            data,
            offset,
            ikey: read_ikey(&data[offset..]),
        }
    }

    /// Slice for the current layer.
    #[inline]
    #[must_use]
    pub const fn ikey(&self) -> u64 {
        self.ikey
    }

    /// Layer index this key is positioned at.
    #[inline]
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.offset / IKEY_SIZE
    }

    /// Bytes consumed by the layers above.
    #[inline]
    #[must_use]
    pub fn prefix(&self) -> &'a [u8] {
        &self.data[..self.offset]
    }

    /// Bytes not yet consumed, including the current slice.
    #[inline]
    #[must_use]
    pub fn remainder(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    /// The full key.
    #[inline]
    #[must_use]
    pub const fn full(&self) -> &'a [u8] {
        self.data
    }

    /// True if the key continues past the current slice.
    #[inline]
    #[must_use]
    pub const fn has_suffix(&self) -> bool {
        self.data.len() - self.offset > IKEY_SIZE
    }

    /// Real bytes in the current slice (0..=8).
    #[inline]
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "bounded by IKEY_SIZE")]
    pub fn current_len(&self) -> u8 {
        (self.data.len() - self.offset).min(IKEY_SIZE) as u8
    }

    /// Sort rank inside a border node.
    ///
    /// Keys that continue past this slice always live behind a layer slot,
    /// which ranks as 8.
    #[inline]
    #[must_use]
    pub fn rank(&self) -> u8 {
        if self.has_suffix() {
            FULL_SLICE_RANK
        } else {
            self.current_len()
        }
    }

    /// Advance to the next layer.
    ///
    /// Shifting a key with exactly 8 bytes left yields the empty residual key.
    #[inline]
    pub fn shift(&mut self) {
        debug_assert!(
            self.data.len() - self.offset >= IKEY_SIZE,
            "shift: key has no full slice left"
        );

        self.offset += IKEY_SIZE;
        self.ikey = read_ikey(&self.data[self.offset..]);
    }

    /// A copy of this key advanced to the next layer.
    #[inline]
    #[must_use]
    pub fn shifted(&self) -> Self {
        let mut next: Self = *self;
        next.shift();
        next
    }
}
