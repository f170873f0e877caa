use super::{ParseStatus, ParserArena, ParserId, QueryValue};
use crate::context::QueryItem;
use crate::verdict::Match;

/// One response reachable through a query node, with the parser that guards
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueryCandidate {
    pub response: usize,
    pub parser: ParserId,
}

/// A winning candidate together with its parsed query value, extracted
/// before the parser was reset.
#[derive(Debug)]
pub(crate) struct QuerySelection {
    pub response: usize,
    pub value: QueryValue,
}

/// Per-path-node sub-engine selecting among responses by query shape.
///
/// Materialised at build time from the parser-family buckets of a node; the
/// variant encodes the cardinality table, with the single-candidate forms as
/// fast paths. An empty-parser candidate sharing a node with serial parsers
/// is lifted into the serial scan (it completes on no items and fails on
/// any, which is exactly the empty contract).
#[derive(Debug)]
pub(crate) enum QueryNode {
    EmptyQuery(QueryCandidate),
    EntireQuery(QueryCandidate),
    SerialQuery(QueryCandidate),
    SerialQueries(Vec<QueryCandidate>),
    EntireQueries(Vec<QueryCandidate>),
    MixedQueries {
        serials: Vec<QueryCandidate>,
        entires: Vec<QueryCandidate>,
    },
}

impl QueryNode {
    /// Selects among this node's responses for the given query. Every
    /// parser touched is reset before returning, on all branches.
    pub(crate) fn select(
        &self,
        items: &[QueryItem],
        arena: &mut ParserArena,
    ) -> Match<QuerySelection> {
        match self {
            QueryNode::EmptyQuery(candidate) => {
                if items.is_empty() {
                    Match::Unambiguous(QuerySelection {
                        response: candidate.response,
                        value: QueryValue::Unit,
                    })
                } else {
                    Match::NotFound
                }
            }
            QueryNode::SerialQuery(candidate) => {
                select_serial(std::slice::from_ref(candidate), items, arena)
            }
            QueryNode::EntireQuery(candidate) => {
                select_entire(std::slice::from_ref(candidate), items, arena)
            }
            QueryNode::SerialQueries(candidates) => select_serial(candidates, items, arena),
            QueryNode::EntireQueries(candidates) => select_entire(candidates, items, arena),
            QueryNode::MixedQueries { serials, entires } => {
                select_serial(serials, items, arena).union(select_entire(entires, items, arena))
            }
        }
    }
}

/// The serial-candidates scan: feed each item to every live candidate,
/// dropping (and resetting) the ones that fail, then judge completeness at
/// end-of-query.
fn select_serial(
    candidates: &[QueryCandidate],
    items: &[QueryItem],
    arena: &mut ParserArena,
) -> Match<QuerySelection> {
    let mut live: Vec<QueryCandidate> = candidates.to_vec();

    for item in items {
        live.retain(|candidate| {
            arena.feed(candidate.parser, item);
            if arena.status(candidate.parser) == ParseStatus::Failure {
                arena.reset(candidate.parser);
                false
            } else {
                true
            }
        });
        if live.is_empty() {
            return Match::NotFound;
        }
    }

    for candidate in &live {
        arena.finish(candidate.parser);
    }

    let mut winner: Match<QueryCandidate> = Match::NotFound;
    for candidate in &live {
        if arena.status(candidate.parser) == ParseStatus::Complete {
            winner = winner.union(Match::Unambiguous(*candidate));
        }
    }

    let verdict = winner.map(|candidate| QuerySelection {
        response: candidate.response,
        value: arena
            .parse_result(candidate.parser)
            .unwrap_or(QueryValue::Unit),
    });

    for candidate in &live {
        arena.reset(candidate.parser);
    }
    verdict
}

/// The entire-candidates scan: hand the whole query to each parser and
/// collect completions. An empty query is never offered to entire parsers.
fn select_entire(
    candidates: &[QueryCandidate],
    items: &[QueryItem],
    arena: &mut ParserArena,
) -> Match<QuerySelection> {
    if items.is_empty() {
        return Match::NotFound;
    }

    let mut winner: Match<QueryCandidate> = Match::NotFound;
    let mut consulted = 0;
    for candidate in candidates {
        arena.apply_entire(candidate.parser, items);
        consulted += 1;
        if arena.status(candidate.parser) == ParseStatus::Complete {
            winner = winner.union(Match::Unambiguous(*candidate));
            if matches!(winner, Match::Ambiguous) {
                // Two completions already decide the verdict.
                break;
            }
        }
    }

    let verdict = winner.map(|candidate| QuerySelection {
        response: candidate.response,
        value: arena
            .parse_result(candidate.parser)
            .unwrap_or(QueryValue::Unit),
    });

    for candidate in &candidates[..consulted] {
        arena.reset(candidate.parser);
    }
    verdict
}
