//! Declarative request dispatch: a five-axis decision tree (method → user →
//! host → path → query) that selects exactly one response handler per
//! request, or reports not-found / ambiguity, while cascading group
//! attributes along the matched path.
//!
//! The tree is assembled once through [`SchemaBuilder`] and immutable
//! afterwards; dispatch is pure and thread-safe, with per-worker parser
//! state held in a [`ParserArena`].

mod attributes;
mod builder;
mod context;
mod processor;
mod query;
mod response;
mod tree;
mod verdict;

pub use attributes::{ErrorCallback, GroupAttributes, IncidentCallback};
pub use builder::{BuildDiagnostic, DispatchSpec, SchemaBuilder};
pub use context::{
    ContextError, QueryItem, RequestContext, RequestTarget, normalize_path, parse_query,
};
pub use processor::{DEFAULT_BODY_LIMIT, Incident, RequestProcessor, render_incident};
pub use query::{
    EntireSpec, ParseStatus, ParserArena, ParserId, QueryParserSpec, QueryValue, SerialSpec,
    SlotDecoder,
};
pub use response::{
    BodyOutcome, BodyPlan, RespondInput, ResponderError, ResponseBody, ResponseContent,
    ResponseImpl,
};
pub use tree::{Dispatch, DispatchTree, Redirect, Selection};
pub use verdict::Match;
