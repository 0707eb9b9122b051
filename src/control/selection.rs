//! Enable/disable selection parsing (spec.md §4.7 step 4): a
//! comma-separated list with inclusive ranges, deduplicated and validated
//! against the current index space.

use std::collections::BTreeSet;

/// Parse a selection string such as `"2,4-6,13"` into a sorted, deduplicated
/// list of indices, rejecting anything outside `[0, total)`.
pub fn parse_selection(input: &str, total: usize) -> Result<Vec<usize>, String> {
    let mut indices = BTreeSet::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((lo, hi)) = part.split_once('-') {
            let lo: usize = lo
                .trim()
                .parse()
                .map_err(|_| format!("invalid range start in '{part}'"))?;
            let hi: usize = hi
                .trim()
                .parse()
                .map_err(|_| format!("invalid range end in '{part}'"))?;
            if lo > hi {
                return Err(format!("invalid range '{part}': start after end"));
            }
            for i in lo..=hi {
                if i >= total {
                    return Err(format!("index {i} out of range [0,{total})"));
                }
                indices.insert(i);
            }
        } else {
            let i: usize = part
                .parse()
                .map_err(|_| format!("invalid index '{part}'"))?;
            if i >= total {
                return Err(format!("index {i} out of range [0,{total})"));
            }
            indices.insert(i);
        }
    }

    Ok(indices.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_list_and_ranges() {
        assert_eq!(parse_selection("2,4-6,13", 20).unwrap(), vec![2, 4, 5, 6, 13]);
    }

    #[test]
    fn deduplicates_overlapping_entries() {
        assert_eq!(parse_selection("1,1,1-2", 5).unwrap(), vec![1, 2]);
    }

    #[test]
    fn rejects_index_outside_range() {
        assert!(parse_selection("99", 5).is_err());
    }

    #[test]
    fn rejects_reversed_range() {
        assert!(parse_selection("6-2", 10).is_err());
    }
}
