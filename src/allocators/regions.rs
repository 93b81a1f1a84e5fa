use crate::bitmap::Bitmap;

//-------------------------------------

/// Allocated runs of a bitmap snapshot, yielded as (offset, length) in
/// ascending order.  Later allocator activity isn't reflected.
pub struct Regions {
    bitmap: Bitmap,
    position: u64,
}

impl Regions {
    pub(super) fn new(bitmap: Bitmap) -> Self {
        Self {
            bitmap,
            position: 0,
        }
    }

    /// Start again from the lowest region.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn nr_elements(&self) -> u64 {
        self.bitmap.len()
    }
}

impl Iterator for Regions {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let (begin, end) = self.bitmap.set_runs_from(self.position).next()?;
        self.position = end;
        Some((begin, end - begin))
    }
}

//-------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_regions_rewind() -> anyhow::Result<()> {
        let mut bm = Bitmap::zeroes(200)?;
        bm.set_range(0, 3);
        bm.set_range(63, 65);
        bm.set_range(199, 200);

        let mut regions = Regions::new(bm);
        let first: Vec<(u64, u64)> = regions.by_ref().collect();
        assert_eq!(first, vec![(0, 3), (63, 2), (199, 1)]);
        assert_eq!(regions.next(), None);

        regions.rewind();
        let second: Vec<(u64, u64)> = regions.collect();
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_regions_empty() {
        let mut regions = Regions::new(Bitmap::new());
        assert_eq!(regions.nr_elements(), 0);
        assert_eq!(regions.next(), None);
    }
}

//-------------------------------------
