//! Tagged 64-bit pointers that may refer to another node's memory.
//!
//! In a cluster, a value slot can hold an address on a peer machine. Rather
//! than widening every slot, the discriminant rides in the non-canonical high
//! bits of the pointer itself:
//!
//! ```text
//! 63 62 61      56 55    48 47                           0
//! ┌─────┬─────────┬────────┬─────────────────────────────┐
//! │ tag │ node id │  hint  │           offset            │
//! └─────┴─────────┴────────┴─────────────────────────────┘
//! ```
//!
//! `tag == 0b10` marks a remote pointer; anything else is a canonical local
//! address (whose bits 63–62 are a sign extension of bit 47 and therefore
//! never `10`). The engine stores and forwards remote pointers but never
//! dereferences them; resolving a remote address is the transport layer's
//! job.

/// Bits 63–62 of a remote pointer.
const REMOTE_TAG: u64 = 0b10;

/// Mask selecting the tag bits.
const REMOTE_TAG_MASK: u64 = 0xc000_0000_0000_0000;

/// Low 48 bits: the in-node offset.
const OFFSET_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// Largest node id representable in the 6-bit field.
pub const MAX_NODE_ID: u8 = 63;

// ============================================================================
//  RemotePointer
// ============================================================================

/// A 64-bit address on another cluster node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RemotePointer(u64);

impl RemotePointer {
    /// Build a remote pointer out of a node id and an in-node offset.
    ///
    /// The node id is truncated to 6 bits, the offset to 48.
    #[must_use]
    pub const fn new(node: u8, offset: u64) -> Self {
        let meta = (REMOTE_TAG << 6) | (node & MAX_NODE_ID) as u64;
        Self((meta << 56) | (offset & OFFSET_MASK))
    }

    /// True when `bits` carries the remote tag.
    #[inline]
    #[must_use]
    pub const fn is_remote_bits(bits: u64) -> bool {
        (bits & REMOTE_TAG_MASK) >> 62 == REMOTE_TAG
    }

    /// The owning node's id.
    #[inline]
    #[must_use]
    pub const fn node_id(self) -> u8 {
        ((self.0 >> 56) & MAX_NODE_ID as u64) as u8
    }

    /// The in-node offset.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// The raw tagged word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

// ============================================================================
//  PolymorphicPointer
// ============================================================================

/// A value-slot pointer: null, a local PM address, or a [`RemotePointer`].
///
/// A local pointer's bits equal the raw address, so the type is free to
/// store and copy. The representation is a single `u64`, which is what the
/// leaf value slots persist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PolymorphicPointer(u64);

impl PolymorphicPointer {
    /// The null pointer.
    pub const NULL: Self = Self(0);

    /// Wrap a local address.
    #[inline]
    #[must_use]
    pub fn local(ptr: *const u8) -> Self {
        Self(ptr as u64)
    }

    /// Wrap a remote pointer.
    #[inline]
    #[must_use]
    pub const fn remote(ptr: RemotePointer) -> Self {
        Self(ptr.raw())
    }

    /// Reconstruct from persisted bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_remote(self) -> bool {
        RemotePointer::is_remote_bits(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn is_local(self) -> bool {
        !self.is_null() && !self.is_remote()
    }

    /// The local address, rebuilt as a canonical pointer.
    ///
    /// Bits 63–48 are replaced with a sign extension of bit 47, which undoes
    /// any tag scribbling and yields a dereferenceable address on 48-bit
    /// virtual-address machines. Must only be called when [`is_local`] holds.
    ///
    /// [`is_local`]: Self::is_local
    #[inline]
    #[must_use]
    pub const fn as_local(self) -> *mut u8 {
        let canonical = if self.0 & (1 << 47) != 0 {
            self.0 | !OFFSET_MASK
        } else {
            self.0 & OFFSET_MASK
        };
        canonical as *mut u8
    }

    /// The remote view of the word. Meaningful only when [`is_remote`] holds.
    ///
    /// [`is_remote`]: Self::is_remote
    #[inline]
    #[must_use]
    pub const fn as_remote(self) -> RemotePointer {
        RemotePointer(self.0)
    }

    /// Node id of a remote pointer.
    #[inline]
    #[must_use]
    pub const fn node_id(self) -> u8 {
        self.as_remote().node_id()
    }

    /// The raw 64-bit representation.
    #[inline]
    #[must_use]
    pub const fn raw_bits(self) -> u64 {
        self.0
    }
}

impl Default for PolymorphicPointer {
    fn default() -> Self {
        Self::NULL
    }
}

impl From<RemotePointer> for PolymorphicPointer {
    fn from(ptr: RemotePointer) -> Self {
        Self::remote(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_round_trip() {
        let ptr = RemotePointer::new(17, 0x1234_5678_9abc);
        assert!(RemotePointer::is_remote_bits(ptr.raw()));
        assert_eq!(ptr.node_id(), 17);
        assert_eq!(ptr.offset(), 0x1234_5678_9abc);
    }

    #[test]
    fn node_id_truncates_to_six_bits() {
        let ptr = RemotePointer::new(0xff, 0);
        assert_eq!(ptr.node_id(), MAX_NODE_ID);
    }

    #[test]
    fn offset_truncates_to_48_bits() {
        let ptr = RemotePointer::new(1, u64::MAX);
        assert_eq!(ptr.offset(), OFFSET_MASK);
    }

    #[test]
    fn local_pointers_keep_their_bits() {
        let value = 0x7fff_dead_beefu64;
        let poly = PolymorphicPointer::local(value as *const u8);
        assert!(poly.is_local());
        assert!(!poly.is_remote());
        assert!(!poly.is_null());
        assert_eq!(poly.raw_bits(), value);
        assert_eq!(poly.as_local() as u64, value);
    }

    #[test]
    fn null_is_neither_local_nor_remote() {
        let poly = PolymorphicPointer::NULL;
        assert!(poly.is_null());
        assert!(!poly.is_local());
        assert!(!poly.is_remote());
    }

    #[test]
    fn remote_wrapping_preserves_tag() {
        let poly = PolymorphicPointer::remote(RemotePointer::new(3, 0xabc));
        assert!(poly.is_remote());
        assert!(!poly.is_local());
        assert_eq!(poly.node_id(), 3);
        assert_eq!(poly.as_remote().offset(), 0xabc);
    }

    #[test]
    fn as_local_sign_extends_bit_47() {
        let high = PolymorphicPointer::from_bits(0x0000_8000_0000_0000);
        assert_eq!(high.as_local() as u64, 0xffff_8000_0000_0000);

        let low = PolymorphicPointer::from_bits(0x0000_7fff_ffff_ffff);
        assert_eq!(low.as_local() as u64, 0x0000_7fff_ffff_ffff);
    }
}
