//! Filter view over entity ids
//!
//! A set bit means the entity is filtered OUT. An empty view admits
//! everything.
//!
//! A view may carry an alternate id array ("out ids"). When present, the
//! view is addressed by internal id: internal id `i` is tested against the
//! bit of `out_ids[i + id_offset]`, and `size()`/`count()` describe the
//! internal id space instead of the raw bitmap.

use std::sync::Arc;

use bit_vec::BitVec;

/// Read-only membership mask with cached cardinality
#[derive(Debug, Clone, Default)]
pub struct BitsetView {
    bits: Option<Arc<BitVec>>,
    num_filtered_out_bits: usize,
    out_ids: Option<Arc<Vec<u32>>>,
    num_internal_ids: usize,
    num_filtered_out_ids: usize,
    id_offset: usize,
}

impl BitsetView {
    /// View over a bitmap; set bits are filtered out
    pub fn new(bits: BitVec) -> Self {
        let num_filtered_out_bits = bits.iter().filter(|b| *b).count();
        Self {
            bits: Some(Arc::new(bits)),
            num_filtered_out_bits,
            ..Default::default()
        }
    }

    /// View over `size` ids with the given ids filtered out
    pub fn from_filtered_ids(size: usize, filtered: impl IntoIterator<Item = usize>) -> Self {
        let mut bits = BitVec::from_elem(size, false);
        for id in filtered {
            if id < size {
                bits.set(id, true);
            }
        }
        Self::new(bits)
    }

    /// View over `size` ids admitting only `admitted`
    pub fn admitting_only(size: usize, admitted: impl IntoIterator<Item = usize>) -> Self {
        let mut bits = BitVec::from_elem(size, true);
        for id in admitted {
            if id < size {
                bits.set(id, false);
            }
        }
        Self::new(bits)
    }

    /// True when no bitmap is attached (everything admitted)
    pub fn empty(&self) -> bool {
        self.bits.as_ref().map_or(true, |b| b.is_empty())
    }

    /// Number of ids the view describes
    pub fn size(&self) -> usize {
        if self.out_ids.is_some() {
            self.num_internal_ids
        } else {
            self.bits.as_ref().map_or(0, |b| b.len())
        }
    }

    /// Number of ids filtered out
    pub fn count(&self) -> usize {
        if self.out_ids.is_some() {
            self.num_filtered_out_ids
        } else {
            self.num_filtered_out_bits
        }
    }

    /// Fraction of ids filtered out
    pub fn filter_ratio(&self) -> f32 {
        let size = self.size();
        if size == 0 {
            0.0
        } else {
            self.count() as f32 / size as f32
        }
    }

    /// Whether an alternate id array is attached
    pub fn has_out_ids(&self) -> bool {
        self.out_ids.is_some()
    }

    /// Test whether `id` is filtered out
    #[inline]
    pub fn test(&self, id: usize) -> bool {
        let bits = match &self.bits {
            Some(bits) => bits,
            None => return false,
        };
        let bit = match &self.out_ids {
            Some(out_ids) => match out_ids.get(id + self.id_offset) {
                Some(&out) => out as usize,
                None => return true,
            },
            None => id,
        };
        bits.get(bit).unwrap_or(false)
    }

    /// First id not filtered out, or `size()` if there is none
    pub fn get_first_valid_index(&self) -> usize {
        if self.out_ids.is_some() {
            (0..self.num_internal_ids)
                .find(|&i| !self.test(i))
                .unwrap_or(self.num_internal_ids)
        } else {
            match &self.bits {
                Some(bits) => bits.iter().position(|b| !b).unwrap_or(bits.len()),
                None => 0,
            }
        }
    }

    /// Attach an alternate id array covering `num_internal_ids` internal ids
    ///
    /// When `num_filtered_out_ids` is `None` the filtered-out count is
    /// computed by testing every internal id.
    pub fn set_out_ids(
        &mut self,
        out_ids: Arc<Vec<u32>>,
        num_internal_ids: usize,
        num_filtered_out_ids: Option<usize>,
    ) {
        self.out_ids = Some(out_ids);
        self.num_internal_ids = num_internal_ids;
        self.num_filtered_out_ids = match num_filtered_out_ids {
            Some(n) => n,
            None => (0..num_internal_ids).filter(|&i| self.test(i)).count(),
        };
    }

    /// Offset added to internal ids before the alternate id lookup
    pub fn set_id_offset(&mut self, id_offset: usize) {
        self.id_offset = id_offset;
    }

    /// Current id offset
    pub fn id_offset(&self) -> usize {
        self.id_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_admits_everything() {
        let view = BitsetView::default();
        assert!(view.empty());
        assert_eq!(view.size(), 0);
        assert_eq!(view.count(), 0);
        assert!(!view.test(12));
        assert_eq!(view.filter_ratio(), 0.0);
    }

    #[test]
    fn test_plain_bitmap() {
        let view = BitsetView::from_filtered_ids(8, [0, 1, 5]);
        assert!(!view.empty());
        assert_eq!(view.size(), 8);
        assert_eq!(view.count(), 3);
        assert!(view.test(0));
        assert!(!view.test(2));
        assert_eq!(view.get_first_valid_index(), 2);
        assert!((view.filter_ratio() - 3.0 / 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_fully_filtered() {
        let view = BitsetView::admitting_only(4, std::iter::empty());
        assert_eq!(view.count(), view.size());
        assert_eq!(view.get_first_valid_index(), 4);
    }

    #[test]
    fn test_out_ids_redirect() {
        // labels 1 and 3 admitted
        let mut view = BitsetView::admitting_only(6, [1, 3]);
        // internal id i maps to label out_ids[i]
        view.set_out_ids(Arc::new(vec![5, 3, 4, 1]), 4, None);
        assert_eq!(view.size(), 4);
        assert_eq!(view.count(), 2);
        assert!(view.test(0));
        assert!(!view.test(1));
        assert!(!view.test(3));
        assert_eq!(view.get_first_valid_index(), 1);
    }

    #[test]
    fn test_out_ids_with_offset() {
        let mut view = BitsetView::admitting_only(6, [4]);
        view.set_out_ids(Arc::new(vec![0, 1, 2, 3, 4, 5]), 2, Some(1));
        view.set_id_offset(3);
        // internal 1 + offset 3 -> label 4
        assert!(!view.test(1));
        assert!(view.test(0));
        assert_eq!(view.count(), 1);
        assert_eq!(view.get_first_valid_index(), 1);
    }
}
