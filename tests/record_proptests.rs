//! Property tests for the byte-record comparator and layout.

use std::cmp::Ordering;

use cairn::record::{ByteRecord, KvLayout, compare_bytes};
use proptest::prelude::*;

fn byte_string() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Memcmp-over-common-prefix with a length tiebreak is exactly the
    /// lexicographic order on byte slices.
    #[test]
    fn comparator_matches_slice_order(a in byte_string(), b in byte_string()) {
        prop_assert_eq!(compare_bytes(&a, &b), a.cmp(&b));
    }

    #[test]
    fn comparator_is_reflexive_and_antisymmetric(a in byte_string(), b in byte_string()) {
        prop_assert_eq!(compare_bytes(&a, &a), Ordering::Equal);
        prop_assert_eq!(compare_bytes(&a, &b), compare_bytes(&b, &a).reverse());
    }

    #[test]
    fn records_round_trip_through_memory(payload in byte_string()) {
        let mut block = vec![0u8; ByteRecord::wire_size(payload.len()) + 8];
        let aligned = {
            let base = block.as_mut_ptr();
            ((base as usize + 7) & !7) as *mut u8
        };
        // SAFETY: the block is sized for the record plus alignment slack.
        let rec = unsafe { ByteRecord::write_at(aligned, &payload) };
        // SAFETY: rec was just written.
        unsafe {
            prop_assert_eq!(ByteRecord::len(rec), payload.len());
            prop_assert_eq!(ByteRecord::bytes(rec), payload.as_slice());
            prop_assert_eq!(ByteRecord::compare(rec, &payload), Ordering::Equal);
        }
    }

    /// The value record of a combined block starts 8-aligned past the key
    /// record, wherever the key length lands.
    #[test]
    fn kv_layout_is_packed_and_aligned(key_len in 0usize..=64, value_len in 0usize..=256) {
        let layout = KvLayout::new(key_len, value_len);
        prop_assert_eq!(layout.key_offset, 0);
        prop_assert_eq!(layout.value_offset % 8, 0);
        prop_assert!(layout.value_offset >= ByteRecord::wire_size(key_len));
        prop_assert!(layout.value_offset < ByteRecord::wire_size(key_len) + 8);
        prop_assert_eq!(layout.total, layout.value_offset + ByteRecord::wire_size(value_len));
    }
}
