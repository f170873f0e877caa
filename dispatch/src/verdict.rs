/// Tri-state outcome of a dispatch lookup.
///
/// Lookups across tree levels are combined with [`Match::union`]:
/// `NotFound` is the identity, `Ambiguous` is absorbing, and two distinct
/// matches collapse into `Ambiguous`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match<T> {
    /// Exactly one handler matched.
    Unambiguous(T),
    /// Nothing matched.
    NotFound,
    /// More than one handler matched; the request cannot be served.
    Ambiguous,
}

impl<T> Match<T> {
    /// Combines two lookup results from parallel subtrees.
    pub fn union(self, other: Match<T>) -> Match<T> {
        match (self, other) {
            (Match::NotFound, other) => other,
            (this, Match::NotFound) => this,
            _ => Match::Ambiguous,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Match<U> {
        match self {
            Match::Unambiguous(value) => Match::Unambiguous(f(value)),
            Match::NotFound => Match::NotFound,
            Match::Ambiguous => Match::Ambiguous,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Match::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_identity() {
        assert_eq!(
            Match::NotFound.union(Match::Unambiguous(1)),
            Match::Unambiguous(1)
        );
        assert_eq!(
            Match::Unambiguous(1).union(Match::NotFound),
            Match::Unambiguous(1)
        );
        assert_eq!(
            Match::<u32>::NotFound.union(Match::NotFound),
            Match::NotFound
        );
    }

    #[test]
    fn test_ambiguous_absorbs() {
        assert_eq!(
            Match::Ambiguous.union(Match::Unambiguous(1)),
            Match::Ambiguous
        );
        assert_eq!(
            Match::Unambiguous(1).union(Match::Ambiguous),
            Match::Ambiguous
        );
        assert_eq!(
            Match::<u32>::Ambiguous.union(Match::NotFound),
            Match::Ambiguous
        );
    }

    #[test]
    fn test_two_matches_are_ambiguous() {
        assert_eq!(
            Match::Unambiguous(1).union(Match::Unambiguous(2)),
            Match::Ambiguous
        );
    }

    #[test]
    fn test_union_is_associative() {
        let cases = [Match::NotFound, Match::Unambiguous(7), Match::Ambiguous];
        for a in &cases {
            for b in &cases {
                for c in &cases {
                    let left = a.clone().union(b.clone()).union(c.clone());
                    let right = a.clone().union(b.clone().union(c.clone()));
                    assert_eq!(left, right);
                }
            }
        }
    }
}
