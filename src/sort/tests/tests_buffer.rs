//! Sort buffer ordering.
//!
//! Coverage:
//! - string, int64, double keys sort ascending and descending
//! - equal keys keep every record
//! - bounded insertion refuses records that do not fit
//! - a record filling the record region exactly is accepted

#[cfg(test)]
mod tests {
    use crate::key::{KeyOrder, KeyType};
    use crate::sort::{INITIAL_RATIO, SortBuffer};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cmp::Ordering;

    fn random_keys(key_type: KeyType, count: usize, seed: u64) -> Vec<String> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| match key_type {
                KeyType::String => {
                    let len = rng.random_range(1..8);
                    (0..len)
                        .map(|_| char::from(b'a' + rng.random_range(0..4u8)))
                        .collect()
                }
                KeyType::Int64 => rng.random_range(-1000i64..1000).to_string(),
                KeyType::Double => format!("{:.3}", rng.random_range(-50.0f64..50.0)),
            })
            .collect()
    }

    fn check_sorted(key_type: KeyType, reverse: bool) {
        let keys = random_keys(key_type, 2000, 42);
        let mut buffer = SortBuffer::new(1 << 20, INITIAL_RATIO).unwrap();
        for (i, key) in keys.iter().enumerate() {
            let value = i.to_string();
            assert!(buffer.add_key_value(key.as_bytes(), Some(value.as_bytes())));
        }

        let order = KeyOrder::new(key_type, reverse);
        buffer.sort(order);

        let sorted: Vec<&[u8]> = buffer.keys().collect();
        for pair in sorted.windows(2) {
            assert_ne!(
                order.compare(pair[0], pair[1]),
                Ordering::Greater,
                "{key_type} reverse={reverse}"
            );
        }

        // Same multiset of lines before and after.
        let mut expected: Vec<Vec<u8>> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{k}\t{i}\n").into_bytes())
            .collect();
        let mut got: Vec<Vec<u8>> = buffer.lines().map(|l| l.to_vec()).collect();
        expected.sort();
        got.sort();
        assert_eq!(got, expected);
    }

    #[test]
    fn string_keys_ascending() {
        check_sorted(KeyType::String, false);
    }

    #[test]
    fn string_keys_descending() {
        check_sorted(KeyType::String, true);
    }

    #[test]
    fn int_keys_both_directions() {
        check_sorted(KeyType::Int64, false);
        check_sorted(KeyType::Int64, true);
    }

    #[test]
    fn double_keys_both_directions() {
        check_sorted(KeyType::Double, false);
        check_sorted(KeyType::Double, true);
    }

    #[test]
    fn shorter_string_key_first() {
        let mut buffer = SortBuffer::new(4096, INITIAL_RATIO).unwrap();
        for key in ["abc", "ab", "abcd", "a"] {
            buffer.add_key_value(key.as_bytes(), None);
        }
        buffer.sort(KeyOrder::new(KeyType::String, false));
        let keys: Vec<&[u8]> = buffer.keys().collect();
        assert_eq!(keys, vec![&b"a"[..], b"ab", b"abc", b"abcd"]);
    }

    #[test]
    fn numeric_not_lexicographic() {
        let mut buffer = SortBuffer::new(4096, INITIAL_RATIO).unwrap();
        for key in ["10", "9", "-3", "100"] {
            buffer.add_key_value(key.as_bytes(), None);
        }
        buffer.sort(KeyOrder::new(KeyType::Int64, false));
        let keys: Vec<&[u8]> = buffer.keys().collect();
        assert_eq!(keys, vec![&b"-3"[..], b"9", b"10", b"100"]);
    }

    #[test]
    fn raw_add_with_key_length() {
        let mut buffer = SortBuffer::new(4096, INITIAL_RATIO).unwrap();
        assert!(buffer.add(b"zz\tlast", 2));
        assert!(buffer.add(b"aa\tfirst", 2));
        assert!(!buffer.add(b"bad", 4));
        buffer.sort(KeyOrder::new(KeyType::String, false));
        assert_eq!(buffer.to_sorted_bytes(), b"aa\tfirst\nzz\tlast\n".to_vec());
    }

    #[test]
    fn insertion_stops_when_full() {
        // 120 byte budget at ratio 3: 90 record bytes, 2 index slots.
        let mut buffer = SortBuffer::new(120, INITIAL_RATIO).unwrap();
        assert_eq!(buffer.index_capacity(), 2);
        assert!(buffer.add_key_value(b"a", None));
        assert!(buffer.add_key_value(b"b", None));
        assert!(buffer.would_overflow(2));
        assert!(!buffer.add_key_value(b"c", None));
        assert_eq!(buffer.entries(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.add_key_value(&[b'x'; 100], None));
    }

    #[test]
    fn record_filling_data_region_fits() {
        let mut buffer = SortBuffer::new(4096, INITIAL_RATIO).unwrap();
        let cap = buffer.data_capacity();
        assert_eq!(cap, 3072);

        // `cap - 1` bytes plus the newline.
        assert!(!buffer.would_overflow(cap));
        assert!(buffer.would_overflow(cap + 1));
        assert!(buffer.add(&vec![b'k'; cap - 1], 1));
        assert_eq!(buffer.bytes_used(), cap);
        assert!(buffer.would_overflow(1));
        assert!(!buffer.add_key_value(b"k", None));

        buffer.clear();
        let value = vec![b'v'; cap - 3];
        assert!(buffer.add_key_value(b"k", Some(&value[..])));
        assert_eq!(buffer.entries(), 1);
    }
}
