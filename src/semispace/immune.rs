use crate::space::Space;

/// Address ranges of the spaces a cycle neither collects nor copies out of.
#[derive(Clone, Default, Debug)]
pub struct ImmuneRegion {
    ranges: Vec<(usize, usize)>,
}

impl ImmuneRegion {
    pub fn reset(&mut self) {
        self.ranges.clear();
    }

    pub fn add_space(&mut self, space: &dyn Space) {
        let range = (space.begin() as usize, space.limit() as usize);
        if !self.ranges.contains(&range) {
            log::trace!(
                "immune region: adding {} {:p}-{:p}",
                space.name(),
                space.begin(),
                space.limit()
            );
            self.ranges.push(range);
        }
    }

    #[inline]
    pub fn contains_object(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        self.ranges
            .iter()
            .any(|&(begin, end)| addr >= begin && addr < end)
    }

    pub fn contains_space(&self, space: &dyn Space) -> bool {
        self.ranges
            .contains(&(space.begin() as usize, space.limit() as usize))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
