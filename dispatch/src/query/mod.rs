//! Query matching: parser families and their per-request state.
//!
//! Parser *specs* live in the dispatch tree and are immutable. The mutable
//! scanning state lives in a [`ParserArena`], a slab with one cell per
//! registered parser, checked out per request and reset in place after every
//! inspection so a single tree serves many requests without reallocation.

mod node;
mod serial;

pub(crate) use node::{QueryCandidate, QueryNode, QuerySelection};
pub use serial::{SerialSpec, SlotDecoder};

use crate::context::QueryItem;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A typed value produced by a query parser.
#[derive(Clone)]
pub enum QueryValue {
    /// Produced by the empty parser.
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// A serial parser's slots, in declaration order.
    List(Vec<QueryValue>),
    /// An entire parser's user-defined result.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryValue::Unit => f.write_str("Unit"),
            QueryValue::Bool(v) => write!(f, "Bool({v})"),
            QueryValue::Int(v) => write!(f, "Int({v})"),
            QueryValue::Float(v) => write!(f, "Float({v})"),
            QueryValue::Text(v) => write!(f, "Text({v:?})"),
            QueryValue::List(v) => f.debug_tuple("List").field(v).finish(),
            QueryValue::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for QueryValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (QueryValue::Unit, QueryValue::Unit) => true,
            (QueryValue::Bool(a), QueryValue::Bool(b)) => a == b,
            (QueryValue::Int(a), QueryValue::Int(b)) => a == b,
            (QueryValue::Float(a), QueryValue::Float(b)) => a == b,
            (QueryValue::Text(a), QueryValue::Text(b)) => a == b,
            (QueryValue::List(a), QueryValue::List(b)) => a == b,
            (QueryValue::Custom(a), QueryValue::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Status observable on a parser cell after any parse call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Incomplete,
    Complete,
    Failure,
}

pub type EntireFn = Arc<dyn Fn(&[QueryItem]) -> Option<QueryValue> + Send + Sync>;

/// The entire-query parser: applies a user function to the whole item
/// sequence at once.
#[derive(Clone)]
pub struct EntireSpec {
    apply: EntireFn,
}

impl EntireSpec {
    pub fn new(apply: impl Fn(&[QueryItem]) -> Option<QueryValue> + Send + Sync + 'static) -> Self {
        EntireSpec {
            apply: Arc::new(apply),
        }
    }
}

impl fmt::Debug for EntireSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntireSpec")
    }
}

/// The closed family of query parsers a response can carry.
#[derive(Debug, Clone, Default)]
pub enum QueryParserSpec {
    /// Completes iff the request query is empty or absent.
    #[default]
    Empty,
    /// Consumes items one by one into named typed slots.
    Serial(SerialSpec),
    /// Receives the whole item sequence in one call.
    Entire(EntireSpec),
}

/// Stable index of a parser spec within a tree's parser table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserId(pub(crate) usize);

enum ParserCell {
    Empty {
        status: ParseStatus,
    },
    Serial(serial::SerialState),
    Entire {
        status: ParseStatus,
        value: Option<QueryValue>,
    },
}

/// Per-request (or per-worker) mutable parser state, one cell per spec in
/// the tree's table.
pub struct ParserArena {
    table: Arc<[QueryParserSpec]>,
    cells: Vec<ParserCell>,
}

impl ParserArena {
    pub(crate) fn for_table(table: Arc<[QueryParserSpec]>) -> Self {
        let cells = table.iter().map(Self::fresh_cell).collect();
        ParserArena { table, cells }
    }

    fn fresh_cell(spec: &QueryParserSpec) -> ParserCell {
        match spec {
            QueryParserSpec::Empty => ParserCell::Empty {
                status: ParseStatus::Incomplete,
            },
            QueryParserSpec::Serial(spec) => ParserCell::Serial(serial::SerialState::new(spec)),
            QueryParserSpec::Entire(_) => ParserCell::Entire {
                status: ParseStatus::Incomplete,
                value: None,
            },
        }
    }

    /// Feeds one query item to a serially-scanned parser. An empty parser
    /// fails on any item; an entire parser is never fed serially.
    pub(crate) fn feed(&mut self, id: ParserId, item: &QueryItem) {
        match (&mut self.cells[id.0], &self.table[id.0]) {
            (ParserCell::Empty { status }, _) => *status = ParseStatus::Failure,
            (ParserCell::Serial(state), QueryParserSpec::Serial(spec)) => state.feed(spec, item),
            (ParserCell::Entire { status, .. }, _) => *status = ParseStatus::Failure,
            _ => unreachable!("cell and spec kinds diverged"),
        }
    }

    /// Marks end-of-query for a serially-scanned parser.
    pub(crate) fn finish(&mut self, id: ParserId) {
        match (&mut self.cells[id.0], &self.table[id.0]) {
            (ParserCell::Empty { status }, _) => {
                if *status == ParseStatus::Incomplete {
                    *status = ParseStatus::Complete;
                }
            }
            (ParserCell::Serial(state), QueryParserSpec::Serial(spec)) => state.finish(spec),
            (ParserCell::Entire { .. }, _) => {}
            _ => unreachable!("cell and spec kinds diverged"),
        }
    }

    /// Hands the whole item sequence to an entire parser.
    pub(crate) fn apply_entire(&mut self, id: ParserId, items: &[QueryItem]) {
        match (&mut self.cells[id.0], &self.table[id.0]) {
            (ParserCell::Entire { status, value }, QueryParserSpec::Entire(spec)) => {
                match (spec.apply)(items) {
                    Some(v) => {
                        *status = ParseStatus::Complete;
                        *value = Some(v);
                    }
                    None => *status = ParseStatus::Failure,
                }
            }
            _ => unreachable!("apply_entire on a non-entire parser"),
        }
    }

    pub fn status(&self, id: ParserId) -> ParseStatus {
        match &self.cells[id.0] {
            ParserCell::Empty { status } => *status,
            ParserCell::Serial(state) => state.status(),
            ParserCell::Entire { status, .. } => *status,
        }
    }

    /// Composes the typed result of a parser whose status is `Complete`.
    /// Must be extracted before [`Self::reset`].
    pub(crate) fn parse_result(&mut self, id: ParserId) -> Option<QueryValue> {
        match (&mut self.cells[id.0], &self.table[id.0]) {
            (ParserCell::Empty { status }, _) => {
                (*status == ParseStatus::Complete).then_some(QueryValue::Unit)
            }
            (ParserCell::Serial(state), QueryParserSpec::Serial(spec)) => state.result(spec),
            (ParserCell::Entire { status, value }, _) => (*status == ParseStatus::Complete)
                .then(|| value.take())
                .flatten(),
            _ => unreachable!("cell and spec kinds diverged"),
        }
    }

    /// Reinitialises a cell in place. Called after every inspection, on
    /// success and failure alike, so parsers are reusable across requests.
    pub(crate) fn reset(&mut self, id: ParserId) {
        self.cells[id.0] = Self::fresh_cell(&self.table[id.0]);
    }

    /// True when every cell is back in its initial state. Exposed for the
    /// reset invariant; dispatch upholds it after every call.
    pub fn is_pristine(&self) -> bool {
        (0..self.cells.len()).all(|i| self.status(ParserId(i)) == ParseStatus::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_of(specs: Vec<QueryParserSpec>) -> ParserArena {
        ParserArena::for_table(specs.into())
    }

    #[test]
    fn test_empty_parser_completes_only_without_items() {
        let mut arena = arena_of(vec![QueryParserSpec::Empty]);
        let id = ParserId(0);

        arena.finish(id);
        assert_eq!(arena.status(id), ParseStatus::Complete);
        assert_eq!(arena.parse_result(id), Some(QueryValue::Unit));

        arena.reset(id);
        arena.feed(id, &QueryItem::new("a", Some("1")));
        assert_eq!(arena.status(id), ParseStatus::Failure);
        arena.finish(id);
        assert_eq!(arena.status(id), ParseStatus::Failure);
    }

    #[test]
    fn test_entire_parser_roundtrip() {
        let spec = EntireSpec::new(|items| {
            (items.len() == 1).then(|| QueryValue::Text(items[0].name.clone()))
        });
        let mut arena = arena_of(vec![QueryParserSpec::Entire(spec)]);
        let id = ParserId(0);

        arena.apply_entire(id, &[QueryItem::new("solo", None)]);
        assert_eq!(arena.status(id), ParseStatus::Complete);
        assert_eq!(
            arena.parse_result(id),
            Some(QueryValue::Text("solo".into()))
        );

        arena.reset(id);
        arena.apply_entire(id, &[QueryItem::new("a", None), QueryItem::new("b", None)]);
        assert_eq!(arena.status(id), ParseStatus::Failure);
    }

    #[test]
    fn test_reset_restores_pristine_state() {
        let mut arena = arena_of(vec![QueryParserSpec::Empty, QueryParserSpec::Empty]);
        arena.feed(ParserId(0), &QueryItem::new("x", None));
        arena.finish(ParserId(1));
        assert!(!arena.is_pristine());

        arena.reset(ParserId(0));
        arena.reset(ParserId(1));
        assert!(arena.is_pristine());
    }
}
