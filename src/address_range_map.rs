//! A mapping between two address spaces.
//!
//! An [`AddressRangeMap`] keeps pairs of ranges, one from a *source* space
//! and one from a *destination* space, sorted by source and with disjoint
//! source ranges. The representation is minimal: a pair of mappings that are
//! contiguous in both spaces and linear on each side (equal source and
//! destination sizes) is merged into one. For example
//!
//! ```text
//!   [0, 10)  -> [1000, 1010)
//!   [10, 30) -> [1010, 1030)
//! ```
//!
//! is stored as `[0, 30) -> [1000, 1030)`, while
//!
//! ```text
//!   [0, 10)  -> [1000, 1010)
//!   [10, 30) -> [1010, 1036)
//! ```
//!
//! is not merged: the second pair is not linear, so nothing can be implied
//! about the combined pair.
//!
//! Blocks use one of these (block offsets -> original-image RVAs) to encode
//! where their bytes came from, which is what lets a rewritten image emit
//! OMAP records.

use core::fmt;

use crate::address::Address;
use crate::address_space::AddressRange;

/// One `source -> destination` mapping.
pub type RangePair<S, D> = (AddressRange<S>, AddressRange<D>);

pub struct AddressRangeMap<S: Address, D: Address> {
    range_pairs: Vec<RangePair<S, D>>,
}

impl<S: Address, D: Address> Default for AddressRangeMap<S, D> {
    fn default() -> Self {
        AddressRangeMap::new()
    }
}

impl<S: Address, D: Address> Clone for AddressRangeMap<S, D> {
    fn clone(&self) -> Self {
        AddressRangeMap { range_pairs: self.range_pairs.clone() }
    }
}

impl<S: Address, D: Address> PartialEq for AddressRangeMap<S, D> {
    fn eq(&self, other: &Self) -> bool {
        self.range_pairs.len() == other.range_pairs.len()
            && self
                .range_pairs
                .iter()
                .zip(other.range_pairs.iter())
                .all(|(a, b)| {
                    a.0.start() == b.0.start()
                        && a.0.size() == b.0.size()
                        && a.1.start() == b.1.start()
                        && a.1.size() == b.1.size()
                })
    }
}

impl<S: Address, D: Address> Eq for AddressRangeMap<S, D> {}

impl<S: Address, D: Address> AddressRangeMap<S, D> {
    pub fn new() -> Self {
        AddressRangeMap { range_pairs: Vec::new() }
    }

    pub fn range_pairs(&self) -> &[RangePair<S, D>] {
        &self.range_pairs
    }

    pub fn range_pair(&self, i: usize) -> &RangePair<S, D> {
        &self.range_pairs[i]
    }

    pub fn clear(&mut self) {
        self.range_pairs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.range_pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.range_pairs.len()
    }

    /// A mapping is simple if it consists of exactly one pair with equal
    /// source and destination sizes.
    pub fn is_simple(&self) -> bool {
        self.range_pairs.len() == 1
            && self.range_pairs[0].0.size() == self.range_pairs[0].1.size()
    }

    // Index of the first pair whose source range is not less than
    // `src_range` under the collide ordering; that pair either intersects
    // `src_range` or lies strictly beyond it.
    fn lower_bound(&self, src_range: &AddressRange<S>) -> usize {
        self.range_pairs.partition_point(|pair| pair.0 < *src_range)
    }

    /// Finds the pair whose source range wholly contains `src_range`.
    pub fn find_range_pair(&self, src_range: &AddressRange<S>) -> Option<&RangePair<S, D>> {
        if src_range.is_empty() {
            return None;
        }
        let idx = self.lower_bound(src_range);
        let pair = self.range_pairs.get(idx)?;
        if pair.0.contains(src_range) { Some(pair) } else { None }
    }

    /// True iff every byte of `src_range` is covered by some mapped pair.
    pub fn is_mapped(&self, src_range: &AddressRange<S>) -> bool {
        if src_range.is_empty() {
            return false;
        }
        let mut idx = self.lower_bound(src_range);
        let mut position = src_range.start();
        loop {
            let Some(pair) = self.range_pairs.get(idx) else {
                return false;
            };
            // A gap before the next mapped range leaves us uncovered.
            if position < pair.0.start() {
                return false;
            }
            position = pair.0.end();
            if !(position < src_range.end()) {
                return true;
            }
            idx += 1;
        }
    }

    /// Adds a pair of ranges, merging with linear, contiguous neighbors.
    /// Fails on empty ranges or a source overlap.
    pub fn insert(&mut self, src_range: AddressRange<S>, dst_range: AddressRange<D>) -> bool {
        if src_range.is_empty() || dst_range.is_empty() {
            return false;
        }

        let idx = self.lower_bound(&src_range);
        if idx == self.range_pairs.len() {
            return self.push(src_range, dst_range);
        }
        if self.range_pairs[idx].0.intersects(&src_range) {
            return false;
        }

        // The new pair sits strictly before range_pairs[idx]. Decide which
        // neighbors it can be merged with.
        let mut merge_left = false;
        let mut merge_right = false;
        if src_range.size() == dst_range.size() {
            if idx > 0 {
                let left = &self.range_pairs[idx - 1];
                if left.0.size() == left.1.size()
                    && left.0.end() == src_range.start()
                    && left.1.end() == dst_range.start()
                {
                    merge_left = true;
                }
            }
            let right = &self.range_pairs[idx];
            if right.0.size() == right.1.size()
                && src_range.end() == right.0.start()
                && dst_range.end() == right.1.start()
            {
                merge_right = true;
            }
        }

        match (merge_left, merge_right) {
            (true, true) => {
                let right = self.range_pairs.remove(idx);
                let left = &mut self.range_pairs[idx - 1];
                left.0 = AddressRange::new(
                    left.0.start(),
                    left.0.size() + src_range.size() + right.0.size(),
                );
                left.1 = AddressRange::new(
                    left.1.start(),
                    left.1.size() + dst_range.size() + right.1.size(),
                );
            }
            (true, false) => {
                let left = &mut self.range_pairs[idx - 1];
                left.0 = AddressRange::new(left.0.start(), left.0.size() + src_range.size());
                left.1 = AddressRange::new(left.1.start(), left.1.size() + dst_range.size());
            }
            (false, true) => {
                let right = &mut self.range_pairs[idx];
                right.0 = AddressRange::new(src_range.start(), src_range.size() + right.0.size());
                right.1 = AddressRange::new(dst_range.start(), dst_range.size() + right.1.size());
            }
            (false, false) => {
                self.range_pairs.insert(idx, (src_range, dst_range));
            }
        }
        true
    }

    /// Appends a pair whose source range lies beyond every existing source
    /// range, merging with the tail pair when both are linear and
    /// contiguous. Amortized O(1).
    pub fn push(&mut self, src_range: AddressRange<S>, dst_range: AddressRange<D>) -> bool {
        if src_range.is_empty() || dst_range.is_empty() {
            return false;
        }

        if let Some(last) = self.range_pairs.last_mut() {
            if !(last.0 < src_range) {
                return false;
            }
            if last.0.size() == last.1.size()
                && src_range.size() == dst_range.size()
                && last.0.end() == src_range.start()
                && last.1.end() == dst_range.start()
            {
                last.0 = AddressRange::new(last.0.start(), last.0.size() + src_range.size());
                last.1 = AddressRange::new(last.1.start(), last.1.size() + dst_range.size());
                return true;
            }
        }

        self.range_pairs.push((src_range, dst_range));
        true
    }

    /// Computes the inverse mapping, returning it along with the number of
    /// conflicting pairs (overlapping destination ranges) that had to be
    /// dropped. The inversion is deterministic: earlier starts and shorter
    /// lengths win.
    pub fn compute_inverse(&self) -> (AddressRangeMap<D, S>, usize) {
        let mut flipped: Vec<RangePair<D, S>> = self
            .range_pairs
            .iter()
            .map(|(src, dst)| (*dst, *src))
            .collect();

        // Sort with a total order rather than the collide order, so the
        // result is deterministic even with conflicting ranges.
        flipped.sort_by(|a, b| {
            a.0.start()
                .cmp(&b.0.start())
                .then(a.0.size().cmp(&b.0.size()))
                .then(a.1.start().cmp(&b.1.start()))
                .then(a.1.size().cmp(&b.1.size()))
        });

        let mut inverted = AddressRangeMap::new();
        let mut conflicts = 0;
        for (src, dst) in flipped {
            if !inverted.push(src, dst) {
                conflicts += 1;
            }
        }
        (inverted, conflicts)
    }

    /// Rejigs the mapping by inserting a run of unmapped bytes into the
    /// source space. Mapped ranges beyond `unmapped` shift right; a range
    /// straddling the insertion point is split, keeping the left half linear
    /// when possible. A 1-byte destination cannot be split, so it is
    /// duplicated across both halves (which may make the mapping
    /// non-invertible).
    pub fn insert_unmapped_range(&mut self, unmapped: &AddressRange<S>) {
        if unmapped.is_empty() {
            return;
        }

        // Walk backwards so shifts do not disturb what is left to visit.
        for i in (0..self.range_pairs.len()).rev() {
            let (src, dst) = self.range_pairs[i];

            if src.start() < unmapped.start() {
                // Starts before the unmapped range: split if it straddles,
                // and either way everything earlier is untouched.
                if unmapped.start() < src.end() {
                    let src_size_before = src.start().distance_to(unmapped.start());
                    let src_size_after = src.size() - src_size_before;

                    let mut dst_size_before = src_size_before;
                    let dst_start_after;
                    let dst_size_after;
                    if dst.size() == 1 {
                        dst_size_before = 1;
                        dst_start_after = dst.start();
                        dst_size_after = 1;
                    } else {
                        // Send as much as possible left, but leave at least
                        // one byte of destination for the right half.
                        if dst_size_before >= dst.size() {
                            dst_size_before = dst.size() - 1;
                        }
                        dst_start_after = dst.start().offset_by(dst_size_before);
                        dst_size_after = dst.size() - dst_size_before;
                    }

                    let pair_after = (
                        AddressRange::new(
                            src.start().offset_by(src_size_before + unmapped.size()),
                            src_size_after,
                        ),
                        AddressRange::new(dst_start_after, dst_size_after),
                    );

                    self.range_pairs[i] = (
                        AddressRange::new(src.start(), src_size_before),
                        AddressRange::new(dst.start(), dst_size_before),
                    );
                    self.range_pairs.insert(i + 1, pair_after);
                }
                return;
            }

            // Starts at or beyond the insertion point: shift right.
            self.range_pairs[i].0 =
                AddressRange::new(src.start().offset_by(unmapped.size()), src.size());
        }
    }

    /// Removes a source range from the mapping: pairs inside it disappear,
    /// straddling pairs are split (keeping each half linear when possible),
    /// and everything beyond shifts left.
    pub fn remove_mapped_range(&mut self, mapped: &AddressRange<S>) {
        if mapped.is_empty() || self.range_pairs.is_empty() {
            return;
        }

        // Shift every pair that lies wholly beyond the removed range.
        let mut i = self.range_pairs.len();
        while i > 0 {
            let (src, _) = self.range_pairs[i - 1];
            if src.start() < mapped.end() {
                break;
            }
            self.range_pairs[i - 1].0 =
                AddressRange::new(src.start().back_by(mapped.size()), src.size());
            i -= 1;
        }

        // Pairs in [begin_affected, end_affected) intersect the removed
        // range; the two endpoints may need splitting, the rest is erased.
        let mut end_affected = i;
        while i > 0 {
            let (src, _) = self.range_pairs[i - 1];
            if src.end() <= mapped.start() {
                break;
            }
            i -= 1;
        }
        let mut begin_affected = i;

        if begin_affected >= self.range_pairs.len() {
            return;
        }

        // Left endpoint straddles the start of the removed range?
        if self.range_pairs[begin_affected].0.start() < mapped.start() {
            let (src, dst) = self.range_pairs[begin_affected];

            let src_size_left = src.start().distance_to(mapped.start());
            let mut dst_size_left = src_size_left.min(dst.size());

            if begin_affected + 1 == end_affected && mapped.end() < src.end() {
                // One pair straddles both endpoints. Prefer a linear left
                // half; if that starves the right half, shuffle a byte over.
                let src_size_right = mapped.end().distance_to(src.end());
                let mut dst_size_right = src_size_right;
                if dst_size_left + dst_size_right > dst.size() {
                    dst_size_right = dst.size() - dst_size_left;
                    if dst_size_right == 0 {
                        dst_size_right = 1;
                        dst_size_left -= 1;
                    }
                }
                let dst_start_right = dst.end().back_by(dst_size_right);

                self.range_pairs[begin_affected] = (
                    AddressRange::new(src.start(), src_size_left),
                    AddressRange::new(dst.start(), dst_size_left),
                );
                self.range_pairs.insert(
                    begin_affected + 1,
                    (
                        AddressRange::new(mapped.start(), src_size_right),
                        AddressRange::new(dst_start_right, dst_size_right),
                    ),
                );
                return;
            }

            self.range_pairs[begin_affected] = (
                AddressRange::new(src.start(), src_size_left),
                AddressRange::new(dst.start(), dst_size_left),
            );
            begin_affected += 1;
        }

        // Right endpoint runs past the end of the removed range?
        if end_affected > begin_affected
            && self.range_pairs[end_affected - 1].0.end() > mapped.end()
        {
            let (src, dst) = self.range_pairs[end_affected - 1];

            let src_size = mapped.end().distance_to(src.end());
            let dst_size = src_size.min(dst.size());

            self.range_pairs[end_affected - 1] = (
                AddressRange::new(src.end().back_by(src_size + mapped.size()), src_size),
                AddressRange::new(dst.end().back_by(dst_size), dst_size),
            );
            end_affected -= 1;
        }

        if begin_affected < end_affected {
            self.range_pairs.drain(begin_affected..end_affected);
        }
    }
}

impl<S: Address, D: Address> fmt::Debug for AddressRangeMap<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.range_pairs.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::RelativeAddress;

    type Map = AddressRangeMap<u32, RelativeAddress>;

    fn src(start: u32, size: u32) -> AddressRange<u32> {
        AddressRange::new(start, size)
    }

    fn dst(start: u32, size: u32) -> AddressRange<RelativeAddress> {
        AddressRange::new(RelativeAddress(start), size)
    }

    fn pairs(map: &Map) -> Vec<(u32, u32, u32, u32)> {
        map.range_pairs()
            .iter()
            .map(|(s, d)| (s.start(), s.size(), d.start().value(), d.size()))
            .collect()
    }

    #[test]
    fn push_merges_linear_contiguous_pairs() {
        let mut map = Map::new();
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.push(src(10, 20), dst(1010, 20)));
        assert_eq!(pairs(&map), vec![(0, 30, 1000, 30)]);

        // Contiguous but not linear on the destination side: no merge.
        assert!(map.push(src(30, 10), dst(1030, 16)));
        assert_eq!(map.len(), 2);

        // Out of order or overlapping pushes fail.
        assert!(!map.push(src(35, 10), dst(2000, 10)));
        assert!(!map.push(src(20, 5), dst(2000, 5)));
        assert!(!map.push(src(40, 0), dst(2000, 1)));
    }

    #[test]
    fn insert_merges_in_both_directions() {
        let mut map = Map::new();
        assert!(map.insert(src(0, 10), dst(1000, 10)));
        assert!(map.insert(src(20, 10), dst(1020, 10)));
        // The middle piece is linear and contiguous with both sides.
        assert!(map.insert(src(10, 10), dst(1010, 10)));
        assert_eq!(pairs(&map), vec![(0, 30, 1000, 30)]);

        assert!(!map.insert(src(5, 10), dst(2000, 10)));
    }

    #[test]
    fn find_range_pair_and_is_mapped() {
        let mut map = Map::new();
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.push(src(20, 10), dst(1020, 10)));

        let pair = map.find_range_pair(&src(2, 4)).unwrap();
        assert_eq!(pair.1.start(), RelativeAddress(1000));
        assert!(map.find_range_pair(&src(8, 4)).is_none());
        assert!(map.find_range_pair(&src(12, 2)).is_none());

        assert!(map.is_mapped(&src(0, 10)));
        assert!(map.is_mapped(&src(22, 6)));
        assert!(!map.is_mapped(&src(5, 10)));
        assert!(!map.is_mapped(&src(10, 10)));
    }

    #[test]
    fn compute_inverse_round_trips() {
        let mut map = Map::new();
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.push(src(20, 10), dst(1040, 10)));
        assert!(map.push(src(40, 4), dst(1020, 4)));

        let (inverse, conflicts) = map.compute_inverse();
        assert_eq!(conflicts, 0);
        let (back, conflicts) = inverse.compute_inverse();
        assert_eq!(conflicts, 0);
        assert_eq!(back, map);
    }

    #[test]
    fn compute_inverse_counts_conflicts() {
        let mut map = Map::new();
        // Two source ranges mapping to the same destination range.
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.push(src(20, 10), dst(1000, 10)));

        let (inverse, conflicts) = map.compute_inverse();
        assert_eq!(conflicts, 1);
        // Earlier start wins.
        assert_eq!(
            inverse.range_pairs()[0].1.start(),
            0u32
        );
    }

    #[test]
    fn insert_unmapped_range_shifts_and_splits() {
        let mut map = Map::new();
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.push(src(20, 10), dst(1020, 10)));

        map.insert_unmapped_range(&src(25, 5));
        assert_eq!(
            pairs(&map),
            vec![(0, 10, 1000, 10), (20, 5, 1020, 5), (30, 5, 1025, 5)]
        );

        // Inserting wholly before a pair just shifts it.
        map.insert_unmapped_range(&src(15, 5));
        assert_eq!(
            pairs(&map),
            vec![(0, 10, 1000, 10), (25, 5, 1020, 5), (35, 5, 1025, 5)]
        );
    }

    #[test]
    fn insert_unmapped_range_duplicates_one_byte_destination() {
        let mut map = Map::new();
        assert!(map.push(src(0, 10), dst(1000, 1)));

        map.insert_unmapped_range(&src(4, 6));
        assert_eq!(
            pairs(&map),
            vec![(0, 4, 1000, 1), (10, 6, 1000, 1)]
        );
    }

    #[test]
    fn remove_mapped_range_shifts_and_splits() {
        let mut map = Map::new();
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.push(src(20, 10), dst(1020, 10)));

        map.remove_mapped_range(&src(5, 15));
        assert_eq!(pairs(&map), vec![(0, 5, 1000, 5), (5, 10, 1020, 10)]);
    }

    #[test]
    fn remove_mapped_range_inside_single_pair() {
        let mut map = Map::new();
        assert!(map.push(src(0, 30), dst(1000, 30)));

        map.remove_mapped_range(&src(10, 10));
        assert_eq!(pairs(&map), vec![(0, 10, 1000, 10), (10, 10, 1020, 10)]);
    }

    #[test]
    fn remove_mapped_range_erases_covered_pairs() {
        let mut map = Map::new();
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.push(src(20, 10), dst(1020, 10)));
        assert!(map.push(src(40, 10), dst(1040, 10)));

        map.remove_mapped_range(&src(15, 20));
        assert_eq!(pairs(&map), vec![(0, 10, 1000, 10), (20, 10, 1040, 10)]);
    }

    #[test]
    fn unmapped_then_mapped_round_trip_is_identity() {
        let mut map = Map::new();
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.push(src(20, 10), dst(1020, 10)));
        let original = map.clone();

        // Insert between the two pairs, then remove the same span again.
        map.insert_unmapped_range(&src(12, 8));
        map.remove_mapped_range(&src(12, 8));
        assert_eq!(map, original);
    }

    #[test]
    fn is_simple() {
        let mut map = Map::new();
        assert!(!map.is_simple());
        assert!(map.push(src(0, 10), dst(1000, 10)));
        assert!(map.is_simple());
        assert!(map.push(src(10, 10), dst(1030, 12)));
        assert!(!map.is_simple());
    }
}
