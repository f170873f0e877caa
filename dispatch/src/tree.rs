use crate::attributes::{AttributeCascade, GroupAttributes};
use crate::context::RequestContext;
use crate::query::{ParserArena, QueryNode, QueryParserSpec, QueryValue};
use crate::response::ResponseImpl;
use crate::verdict::Match;
use http::Method;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

/// One level of the tree: exact keys plus an optional wildcard child that
/// matches any request key. Both are visited when both are present.
#[derive(Debug)]
pub(crate) struct MixedNode<K, V> {
    pub(crate) specific: HashMap<K, V>,
    pub(crate) wildcard: Option<V>,
}

pub(crate) type UserNode = MixedNode<String, HostNode>;
pub(crate) type HostNode = MixedNode<String, PathNode>;

/// A node of the path hierarchy. Responses at a node are split by subpath
/// capability: `subpath` responses also match any extension of the node's
/// path, `terminal` responses match it exactly.
#[derive(Debug)]
pub(crate) struct PathNode {
    pub(crate) children: HashMap<String, PathNode>,
    pub(crate) subpath: Option<QueryNode>,
    pub(crate) terminal: Option<QueryNode>,
    pub(crate) attributes: Option<GroupAttributes>,
}

/// The winning response with its parsed query value and any trailing path
/// components.
#[derive(Debug)]
pub struct Selection {
    pub response: Arc<ResponseImpl>,
    pub query: QueryValue,
    pub subpath: Vec<String>,
}

/// Emitted when dispatch found nothing but the request host is a known
/// alias of a canonical host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub canonical_host: String,
    /// The original path-and-query, reused verbatim on the new host.
    pub path_and_query: String,
}

/// Complete outcome of one tree walk.
#[derive(Debug)]
pub struct Dispatch {
    pub verdict: Match<Selection>,
    /// Attributes resolved along the matched path (nearest enclosing wins).
    pub attributes: GroupAttributes,
    pub redirect: Option<Redirect>,
}

#[derive(Debug)]
struct RawSelection {
    response: usize,
    query: QueryValue,
    subpath: Vec<String>,
}

/// The immutable multi-axis lookup structure: method → user → host → path
/// → query. Built once by [`SchemaBuilder`](crate::SchemaBuilder); dispatch
/// is read-only and safe to call from any number of threads, each with its
/// own [`ParserArena`].
#[derive(Debug)]
pub struct DispatchTree {
    pub(crate) methods: MixedNode<Method, UserNode>,
    pub(crate) redirects: HashMap<String, String>,
    pub(crate) responses: Vec<Arc<ResponseImpl>>,
    pub(crate) parsers: Arc<[QueryParserSpec]>,
}

impl DispatchTree {
    /// A fresh per-worker parser arena sized to this tree's parser table.
    pub fn new_arena(&self) -> ParserArena {
        ParserArena::for_table(self.parsers.clone())
    }

    /// Walks the tree for one request. Pure: repeated calls with the same
    /// context yield the same verdict and resolved attributes.
    pub fn dispatch(&self, ctx: &RequestContext, arena: &mut ParserArena) -> Dispatch {
        let mut verdict: Match<RawSelection> = Match::NotFound;
        let mut cascade = AttributeCascade::new();

        // Wildcard subtree first, then the method-specific one. HEAD falls
        // back to the GET subtree so it naturally shares GET's headers.
        if let Some(node) = &self.methods.wildcard {
            self.walk_user(node, ctx, arena, &mut verdict, &mut cascade);
        }
        let specific = match self.methods.specific.get(&ctx.method) {
            Some(node) => Some(node),
            None if ctx.method == Method::HEAD => self.methods.specific.get(&Method::GET),
            None => None,
        };
        if let Some(node) = specific {
            self.walk_user(node, ctx, arena, &mut verdict, &mut cascade);
        }

        let redirect = if verdict.is_not_found() {
            ctx.target
                .host
                .as_ref()
                .and_then(|host| self.redirects.get(host))
                .map(|canonical| Redirect {
                    canonical_host: canonical.clone(),
                    path_and_query: ctx.target.raw_path_and_query.clone(),
                })
        } else {
            None
        };

        Dispatch {
            verdict: verdict.map(|raw| Selection {
                response: self.responses[raw.response].clone(),
                query: raw.query,
                subpath: raw.subpath,
            }),
            attributes: cascade.into_resolved(),
            redirect,
        }
    }

    fn walk_user(
        &self,
        node: &UserNode,
        ctx: &RequestContext,
        arena: &mut ParserArena,
        verdict: &mut Match<RawSelection>,
        cascade: &mut AttributeCascade,
    ) {
        if let Some(host_node) = &node.wildcard {
            self.walk_host(host_node, ctx, arena, verdict, cascade);
        }
        if let Some(user) = &ctx.target.user_info
            && let Some(host_node) = node.specific.get(user)
        {
            self.walk_host(host_node, ctx, arena, verdict, cascade);
        }
    }

    fn walk_host(
        &self,
        node: &HostNode,
        ctx: &RequestContext,
        arena: &mut ParserArena,
        verdict: &mut Match<RawSelection>,
        cascade: &mut AttributeCascade,
    ) {
        if let Some(path_node) = &node.wildcard {
            self.walk_path(path_node, &ctx.target.path, 0, ctx, arena, verdict, cascade);
        }
        if let Some(host) = &ctx.target.host
            && let Some(path_node) = node.specific.get(host)
        {
            self.walk_path(path_node, &ctx.target.path, 0, ctx, arena, verdict, cascade);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_path(
        &self,
        node: &PathNode,
        remaining: &[String],
        depth: usize,
        ctx: &RequestContext,
        arena: &mut ParserArena,
        verdict: &mut Match<RawSelection>,
        cascade: &mut AttributeCascade,
    ) {
        if let Some(attrs) = &node.attributes {
            cascade.observe(depth, attrs);
        }

        if let Some(query_node) = &node.subpath {
            let contribution = query_node
                .select(&ctx.target.query, arena)
                .map(|selection| RawSelection {
                    response: selection.response,
                    query: selection.value,
                    subpath: remaining.to_vec(),
                });
            *verdict = mem::replace(verdict, Match::NotFound).union(contribution);
        }

        match remaining.split_first() {
            Some((head, rest)) => {
                if let Some(child) = node.children.get(head) {
                    self.walk_path(child, rest, depth + 1, ctx, arena, verdict, cascade);
                }
            }
            None => {
                if let Some(query_node) = &node.terminal {
                    let contribution =
                        query_node
                            .select(&ctx.target.query, arena)
                            .map(|selection| RawSelection {
                                response: selection.response,
                                query: selection.value,
                                subpath: Vec::new(),
                            });
                    *verdict = mem::replace(verdict, Match::NotFound).union(contribution);
                }
            }
        }
    }
}
