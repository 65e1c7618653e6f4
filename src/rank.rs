//! Reference ranks.
//!
//! Ranks order how strongly a reference is interpreted: ambiguous
//! references pin, exact references preserve and may relocate, final
//! references trigger finalization when they are the only preserver, and
//! weak references are splatted when nothing stronger kept the target.

/// Scanning rank, in scan order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum Rank {
    /// Possibly a pointer; pins, never relocates.
    Ambig = 0,
    /// A genuine reference; preserved and updated on relocation.
    Exact = 1,
    /// Finalization reference; preserves for message delivery.
    Final = 2,
    /// Splatted if the target was not otherwise preserved.
    Weak = 3,
}

pub const RANK_COUNT: usize = 4;

impl Rank {
    pub const ALL: [Rank; RANK_COUNT] = [Rank::Ambig, Rank::Exact, Rank::Final, Rank::Weak];
}

/// A set of ranks, e.g. the kinds of reference a segment may contain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RankSet(u8);

impl RankSet {
    pub const EMPTY: RankSet = RankSet(0);

    #[inline]
    pub const fn single(rank: Rank) -> RankSet {
        RankSet(1 << rank as u8)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, rank: Rank) -> bool {
        self.0 & (1 << rank as u8) != 0
    }

    #[inline]
    pub const fn add(self, rank: Rank) -> RankSet {
        RankSet(self.0 | (1 << rank as u8))
    }

    #[inline]
    pub const fn union(self, other: RankSet) -> RankSet {
        RankSet(self.0 | other.0)
    }

    /// The lowest rank present, if any. Grey segments are scanned in
    /// ascending rank order, so this is the scan rank of a segment.
    #[inline]
    pub fn lowest(self) -> Option<Rank> {
        Rank::ALL.into_iter().find(|&r| self.contains(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_order() {
        assert!(Rank::Ambig < Rank::Exact);
        assert!(Rank::Exact < Rank::Final);
        assert!(Rank::Final < Rank::Weak);
    }

    #[test]
    fn test_rank_set_ops() {
        let rs = RankSet::EMPTY;
        assert!(rs.is_empty());
        assert_eq!(rs.lowest(), None);

        let rs = rs.add(Rank::Exact).add(Rank::Weak);
        assert!(rs.contains(Rank::Exact));
        assert!(rs.contains(Rank::Weak));
        assert!(!rs.contains(Rank::Ambig));
        assert_eq!(rs.lowest(), Some(Rank::Exact));

        let rs2 = RankSet::single(Rank::Ambig);
        assert_eq!(rs.union(rs2).lowest(), Some(Rank::Ambig));
    }
}
