use ai_core::{aligned_size, pack, Blackboard, BlackboardSchema, KeyType};
use proptest::prelude::*;

proptest! {
    #[test]
    fn packed_slots_cover_buffer_without_overlap(sizes in prop::collection::vec(0usize..40, 0..24)) {
        let layout = pack(&sizes);

        let total: usize = sizes.iter().map(|s| aligned_size(*s)).sum();
        prop_assert_eq!(layout.total, total);

        let mut ranges: Vec<_> = (0..sizes.len()).filter_map(|i| layout.range(i)).collect();
        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start);
        }
        for (i, size) in sizes.iter().enumerate() {
            let range = layout.range(i).unwrap();
            prop_assert!(range.end <= layout.total);
            if *size > 2 {
                prop_assert_eq!(range.start % 4, 0);
            }
        }
    }

    #[test]
    fn int_values_roundtrip(values in prop::collection::vec(any::<i32>(), 1..8)) {
        let mut builder = BlackboardSchema::builder("Ints");
        for i in 0..values.len() {
            builder = builder.key(format!("k{i}"), KeyType::Int);
        }
        let mut bb = Blackboard::with_schema(builder.build());
        for (i, v) in values.iter().enumerate() {
            let key = format!("k{i}");
            prop_assert!(bb.set(key.as_str(), *v));
        }
        for (i, v) in values.iter().enumerate() {
            prop_assert_eq!(bb.get::<i32>(format!("k{i}").as_str()), *v);
        }
    }
}
