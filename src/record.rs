//! Length-prefixed byte records.
//!
//! Keys and values are stored in PM as a `u64` length followed by the
//! payload. A record is immutable once its pointer has been published; node
//! slots hold raw record addresses, so everything here works on raw pointers
//! and the callers vouch for their validity.
//!
//! One insert writes its key record and value record into a single
//! contiguous PM block (key first), which lets one logged address cover
//! both. [`KvLayout`] computes the offsets.

use std::cmp::Ordering;

/// Marker type for a record in PM: `u64` payload length, then the payload.
///
/// Never materialized as a Rust value; all access goes through the raw
/// associated functions below.
#[derive(Debug)]
pub struct ByteRecord;

impl ByteRecord {
    /// Bytes occupied by the length prefix.
    pub const HEADER: usize = size_of::<u64>();

    /// Bytes a record with `payload_len` payload occupies.
    #[inline]
    #[must_use]
    pub const fn wire_size(payload_len: usize) -> usize {
        Self::HEADER + payload_len
    }

    /// Write a record at `dst` and return its address.
    ///
    /// Does not persist; the caller persists the whole block once.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of [`wire_size`](Self::wire_size)
    /// bytes and 8-byte aligned.
    #[inline]
    pub unsafe fn write_at(dst: *mut u8, payload: &[u8]) -> *const u8 {
        // SAFETY: caller guarantees room and alignment.
        unsafe {
            dst.cast::<u64>().write(payload.len() as u64);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst.add(Self::HEADER), payload.len());
        }
        dst
    }

    /// Payload length of the record at `rec`.
    ///
    /// # Safety
    ///
    /// `rec` must point at a record previously produced by
    /// [`write_at`](Self::write_at).
    #[inline]
    #[must_use]
    pub unsafe fn len(rec: *const u8) -> usize {
        // SAFETY: caller guarantees rec is a record.
        unsafe { rec.cast::<u64>().read() as usize }
    }

    /// Payload of the record at `rec`.
    ///
    /// # Safety
    ///
    /// As for [`len`](Self::len); additionally the record must stay live for
    /// `'a`. Records are never destroyed while their index is, so tying the
    /// lifetime to the index handle is sound.
    #[inline]
    #[must_use]
    pub unsafe fn bytes<'a>(rec: *const u8) -> &'a [u8] {
        // SAFETY: caller guarantees rec is a live record.
        unsafe { std::slice::from_raw_parts(rec.add(Self::HEADER), Self::len(rec)) }
    }

    /// Compare the record at `rec` against a probe key.
    ///
    /// # Safety
    ///
    /// As for [`len`](Self::len).
    #[inline]
    #[must_use]
    pub unsafe fn compare(rec: *const u8, probe: &[u8]) -> Ordering {
        // SAFETY: caller guarantees rec is a live record.
        compare_bytes(unsafe { Self::bytes(rec) }, probe)
    }
}

/// Unsigned lexicographic comparison, ties broken by length.
///
/// Memory-compare over the common prefix; when one side is a prefix of the
/// other, the shorter side orders first.
#[inline]
#[must_use]
pub fn compare_bytes(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let common = lhs.len().min(rhs.len());
    match lhs[..common].cmp(&rhs[..common]) {
        Ordering::Equal => lhs.len().cmp(&rhs.len()),
        unequal => unequal,
    }
}

/// Offsets of one insert's key and value records within its PM block.
#[derive(Debug, Clone, Copy)]
pub struct KvLayout {
    /// Offset of the key record (always 0).
    pub key_offset: usize,

    /// Offset of the value record, 8-byte aligned past the key record.
    pub value_offset: usize,

    /// Total block size.
    pub total: usize,
}

impl KvLayout {
    /// Layout for a key of `key_len` and a value of `value_len` bytes.
    #[must_use]
    pub const fn new(key_len: usize, value_len: usize) -> Self {
        let value_offset = (ByteRecord::wire_size(key_len) + 7) & !7;
        Self {
            key_offset: 0,
            value_offset,
            total: value_offset + ByteRecord::wire_size(value_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_back() {
        let mut buf = [0u8; 64];
        // SAFETY: buf is large enough and 8-aligned via u64-size assertion below.
        let rec = unsafe { ByteRecord::write_at(buf.as_mut_ptr(), b"hello") };
        unsafe {
            assert_eq!(ByteRecord::len(rec), 5);
            assert_eq!(ByteRecord::bytes(rec), b"hello");
            assert_eq!(ByteRecord::compare(rec, b"hello"), Ordering::Equal);
            assert_eq!(ByteRecord::compare(rec, b"hellp"), Ordering::Less);
            assert_eq!(ByteRecord::compare(rec, b"hell"), Ordering::Greater);
        }
    }

    #[test]
    fn empty_payload_round_trips() {
        let mut buf = [0u8; 16];
        let rec = unsafe { ByteRecord::write_at(buf.as_mut_ptr(), b"") };
        unsafe {
            assert_eq!(ByteRecord::len(rec), 0);
            assert_eq!(ByteRecord::bytes(rec), b"");
        }
    }

    #[test]
    fn compare_bytes_orders_lexicographically() {
        assert_eq!(compare_bytes(b"10", b"20"), Ordering::Less);
        assert_eq!(compare_bytes(b"20", b"20"), Ordering::Equal);
        assert_eq!(compare_bytes(b"200", b"20"), Ordering::Greater);
        assert_eq!(compare_bytes(b"2", b"20"), Ordering::Less);
        assert_eq!(compare_bytes(b"", b"a"), Ordering::Less);
        assert_eq!(compare_bytes(&[0xff], &[0x01]), Ordering::Greater);
    }

    #[test]
    fn kv_layout_aligns_value_record() {
        let layout = KvLayout::new(5, 3);
        assert_eq!(layout.key_offset, 0);
        // 8 (prefix) + 5 (payload) rounded up to 16.
        assert_eq!(layout.value_offset, 16);
        assert_eq!(layout.total, 16 + 8 + 3);

        let exact = KvLayout::new(8, 0);
        assert_eq!(exact.value_offset, 16);
    }
}
