/// Picks batch `number` (1-based) of `size` items out of `items`.
///
/// Batching is off when either value is zero or everything fits in one
/// batch. The last batch takes the remainder, so it can hold up to
/// `2 * size - 1` items, and any `number` past the last batch selects the
/// last batch again rather than nothing.
pub fn partition<T>(items: &[T], size: usize, number: usize) -> &[T] {
    if size == 0 || number == 0 || items.len() <= size {
        return items;
    }

    let batches = items.len() / size;
    if number >= batches {
        return &items[size * (batches - 1)..];
    }

    &items[size * (number - 1)..size * number]
}

/// How many distinct batches `len` items split into.
pub fn batch_count(len: usize, size: usize) -> usize {
    if size == 0 || len <= size {
        1
    } else {
        len / size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    fn images(names: &[&str]) -> Vec<Image> {
        names
            .iter()
            .map(|name| Image::new("gcr.io", "ns", name, "1"))
            .collect()
    }

    #[test]
    fn disabled_returns_everything() {
        let all = images(&["a", "b", "c"]);
        assert_eq!(partition(&all, 0, 1), &all[..]);
        assert_eq!(partition(&all, 2, 0), &all[..]);
        assert_eq!(partition(&all, 3, 1), &all[..]);
        assert_eq!(partition(&all, 10, 4), &all[..]);
    }

    #[test]
    fn single_batch_absorbs_remainder() {
        // a:1, b:1, c:1 with batches of 2: only one whole batch fits, so
        // batch 2 folds into it and covers the whole list from index 0.
        let all = images(&["a", "b", "c"]);
        assert_eq!(partition(&all, 2, 2), &all[0..]);
        assert_eq!(partition(&all, 2, 1), &all[0..]);
    }

    #[test]
    fn middle_batches_are_exact() {
        let all = images(&["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(partition(&all, 2, 1), &all[0..2]);
        assert_eq!(partition(&all, 2, 2), &all[2..4]);
        assert_eq!(partition(&all, 2, 3), &all[4..]);
        assert_eq!(partition(&all, 2, 3).len(), 3);
        assert_eq!(partition(&all, 2, 9), &all[4..]);
    }

    #[test]
    fn batches_cover_input_exactly_once() {
        for len in 0..40 {
            let all: Vec<usize> = (0..len).collect();
            for size in 1..12 {
                let mut covered = vec![];
                for number in 1..=batch_count(len, size) {
                    covered.extend_from_slice(partition(&all, size, number));
                }
                assert_eq!(covered, all, "len={len} size={size}");
            }
        }
    }
}
