use crate::attributes::GroupAttributes;
use crate::query::{ParserId, QueryCandidate, QueryNode, QueryParserSpec};
use crate::response::ResponseImpl;
use crate::tree::{DispatchTree, HostNode, MixedNode, PathNode, UserNode};
use http::Method;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Where a response (or attribute record) applies. Absent axes mean
/// wildcard: the entry matches any value of that axis.
#[derive(Debug, Clone, Default)]
pub struct DispatchSpec {
    pub methods: Option<Vec<Method>>,
    pub users: Option<Vec<String>>,
    pub hosts: Option<Vec<String>>,
    /// Alias hosts redirect to the first entry of `hosts`.
    pub host_aliases: Vec<String>,
    /// Subdomain prefixes also registered for every host.
    pub optional_subdomains: Vec<String>,
    /// Literal path components; no placeholders.
    pub path: Vec<String>,
}

impl DispatchSpec {
    pub fn new() -> Self {
        DispatchSpec::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.get_or_insert_default().push(method);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.users.get_or_insert_default().push(user.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.hosts
            .get_or_insert_default()
            .push(host.into().to_ascii_lowercase());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.host_aliases.push(alias.into().to_ascii_lowercase());
        self
    }

    pub fn subdomain(mut self, prefix: impl Into<String>) -> Self {
        self.optional_subdomains
            .push(prefix.into().to_ascii_lowercase());
        self
    }

    /// Sets the literal path, `"/a/b"` style; empty segments are dropped.
    pub fn path(mut self, path: &str) -> Self {
        self.path = path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect();
        self
    }
}

/// A build-time observation worth surfacing to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildDiagnostic {
    /// A second empty-query response claimed an already-occupied slot; the
    /// prior response was replaced.
    EmptyQueryReplaced { path: Vec<String> },
    /// An alias was declared without any canonical host to redirect to.
    AliasWithoutHost { alias: String },
}

impl fmt::Display for BuildDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildDiagnostic::EmptyQueryReplaced { path } => {
                write!(
                    f,
                    "empty-query response at /{} was replaced",
                    path.join("/")
                )
            }
            BuildDiagnostic::AliasWithoutHost { alias } => {
                write!(f, "host alias {alias} has no canonical host")
            }
        }
    }
}

#[derive(Default)]
struct Buckets {
    empty: Option<QueryCandidate>,
    serials: Vec<QueryCandidate>,
    entires: Vec<QueryCandidate>,
}

#[derive(Default)]
struct BuildLevel<K, V> {
    specific: HashMap<K, V>,
    wildcard: Option<V>,
}

type BuildHostLevel = BuildLevel<String, BuildPath>;
type BuildUserLevel = BuildLevel<String, BuildHostLevel>;

#[derive(Default)]
struct BuildPath {
    children: HashMap<String, BuildPath>,
    terminal: Buckets,
    subpath: Buckets,
    attributes: Option<GroupAttributes>,
}

/// Grows the mutable routing structure from `(response, spec)` and
/// `(attributes, spec)` insertions, then freezes it into an immutable
/// [`DispatchTree`].
#[derive(Default)]
pub struct SchemaBuilder {
    methods: BuildLevel<Method, BuildUserLevel>,
    responses: Vec<Arc<ResponseImpl>>,
    parsers: Vec<QueryParserSpec>,
    redirects: HashMap<String, String>,
    diagnostics: Vec<BuildDiagnostic>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        SchemaBuilder::default()
    }

    /// Registers a response everywhere its spec applies. Identity is
    /// referential: inserting twice registers two distinct responses.
    pub fn insert(&mut self, response: ResponseImpl, spec: &DispatchSpec) {
        let id = self.responses.len();
        let candidate = QueryCandidate {
            response: id,
            parser: ParserId(id),
        };
        let query = response.query.clone();
        let accepts_subpath = response.accepts_subpath;
        self.parsers.push(query.clone());
        self.responses.push(Arc::new(response));

        self.register_aliases(spec);

        let methods = &mut self.methods;
        let diagnostics = &mut self.diagnostics;
        for_each_leaf(methods, spec, |node| {
            let bucket = if accepts_subpath {
                &mut node.subpath
            } else {
                &mut node.terminal
            };
            match &query {
                QueryParserSpec::Empty => {
                    if bucket.empty.replace(candidate).is_some() {
                        // Legacy semantics: the newcomer wins, loudly.
                        let diagnostic = BuildDiagnostic::EmptyQueryReplaced {
                            path: spec.path.clone(),
                        };
                        warn!("{diagnostic}");
                        diagnostics.push(diagnostic);
                    }
                }
                QueryParserSpec::Serial(_) => bucket.serials.push(candidate),
                QueryParserSpec::Entire(_) => bucket.entires.push(candidate),
            }
        });
    }

    /// Attaches group attributes at the spec's path level of every subtree
    /// the spec covers.
    pub fn insert_attributes(&mut self, attrs: GroupAttributes, spec: &DispatchSpec) {
        if attrs.is_empty() {
            return;
        }
        self.register_aliases(spec);
        for_each_leaf(&mut self.methods, spec, |node| match &mut node.attributes {
            Some(existing) => existing.merge_from(&attrs),
            None => node.attributes = Some(attrs.clone()),
        });
    }

    /// Diagnostics collected so far; the embedding application may treat
    /// any of them as fatal.
    pub fn diagnostics(&self) -> &[BuildDiagnostic] {
        &self.diagnostics
    }

    /// Freezes the structure: prunes content-free nodes and materialises
    /// each leaf's query node.
    pub fn build(self) -> DispatchTree {
        DispatchTree {
            methods: MixedNode {
                specific: self
                    .methods
                    .specific
                    .into_iter()
                    .filter_map(|(k, v)| freeze_user_level(v).map(|v| (k, v)))
                    .collect(),
                wildcard: self.methods.wildcard.and_then(freeze_user_level),
            },
            redirects: self.redirects,
            responses: self.responses,
            parsers: self.parsers.into(),
        }
    }

    fn register_aliases(&mut self, spec: &DispatchSpec) {
        if spec.host_aliases.is_empty() {
            return;
        }
        let Some(canonical) = spec.hosts.as_ref().and_then(|hosts| hosts.first()) else {
            for alias in &spec.host_aliases {
                let diagnostic = BuildDiagnostic::AliasWithoutHost {
                    alias: alias.clone(),
                };
                warn!("{diagnostic}");
                self.diagnostics.push(diagnostic);
            }
            return;
        };
        for alias in &spec.host_aliases {
            self.redirects.insert(alias.clone(), canonical.clone());
            for prefix in &spec.optional_subdomains {
                self.redirects
                    .insert(format!("{prefix}.{alias}"), format!("{prefix}.{canonical}"));
            }
        }
    }
}

/// Visits (creating lazily) the path node at the spec's terminal path level
/// for every product of the spec's concrete axis keys.
fn for_each_leaf(
    methods: &mut BuildLevel<Method, BuildUserLevel>,
    spec: &DispatchSpec,
    mut apply: impl FnMut(&mut BuildPath),
) {
    let method_keys: Vec<Option<Method>> = match &spec.methods {
        None => vec![None],
        Some(methods) => methods.iter().cloned().map(Some).collect(),
    };
    let user_keys: Vec<Option<String>> = match &spec.users {
        None => vec![None],
        Some(users) => users.iter().cloned().map(Some).collect(),
    };
    let host_keys: Vec<Option<String>> = match &spec.hosts {
        None => vec![None],
        Some(hosts) => {
            let mut keys = Vec::new();
            for host in hosts {
                keys.push(Some(host.clone()));
                for prefix in &spec.optional_subdomains {
                    keys.push(Some(format!("{prefix}.{host}")));
                }
            }
            keys
        }
    };

    for method in &method_keys {
        let user_level = match method {
            Some(method) => methods.specific.entry(method.clone()).or_default(),
            None => methods.wildcard.get_or_insert_default(),
        };
        for user in &user_keys {
            let host_level = match user {
                Some(user) => user_level.specific.entry(user.clone()).or_default(),
                None => user_level.wildcard.get_or_insert_default(),
            };
            for host in &host_keys {
                let mut node = match host {
                    Some(host) => host_level.specific.entry(host.clone()).or_default(),
                    None => host_level.wildcard.get_or_insert_default(),
                };
                for component in &spec.path {
                    node = node.children.entry(component.clone()).or_default();
                }
                apply(node);
            }
        }
    }
}

fn freeze_user_level(level: BuildUserLevel) -> Option<UserNode> {
    let specific: HashMap<String, HostNode> = level
        .specific
        .into_iter()
        .filter_map(|(k, v)| freeze_host_level(v).map(|v| (k, v)))
        .collect();
    let wildcard = level.wildcard.and_then(freeze_host_level);
    (!specific.is_empty() || wildcard.is_some()).then_some(MixedNode { specific, wildcard })
}

fn freeze_host_level(level: BuildHostLevel) -> Option<HostNode> {
    let specific: HashMap<String, PathNode> = level
        .specific
        .into_iter()
        .filter_map(|(k, v)| freeze_path(v).map(|v| (k, v)))
        .collect();
    let wildcard = level.wildcard.and_then(freeze_path);
    (!specific.is_empty() || wildcard.is_some()).then_some(MixedNode { specific, wildcard })
}

fn freeze_path(node: BuildPath) -> Option<PathNode> {
    let children: HashMap<String, PathNode> = node
        .children
        .into_iter()
        .filter_map(|(k, v)| freeze_path(v).map(|v| (k, v)))
        .collect();
    let terminal = materialize(node.terminal);
    let subpath = materialize(node.subpath);

    let keep = !children.is_empty()
        || terminal.is_some()
        || subpath.is_some()
        || node.attributes.is_some();
    keep.then_some(PathNode {
        children,
        subpath,
        terminal,
        attributes: node.attributes,
    })
}

/// The cardinality table: which query node a leaf's parser-family buckets
/// produce.
fn materialize(buckets: Buckets) -> Option<QueryNode> {
    let Buckets {
        empty,
        mut serials,
        entires,
    } = buckets;

    match (empty, entires.len(), serials.len()) {
        (None, 0, 0) => None,
        (Some(candidate), 0, 0) => Some(QueryNode::EmptyQuery(candidate)),
        (None, 1, 0) => Some(QueryNode::EntireQuery(entires[0])),
        (None, 0, 1) => Some(QueryNode::SerialQuery(serials[0])),
        (None, 0, _) => Some(QueryNode::SerialQueries(serials)),
        (None, _, 0) => Some(QueryNode::EntireQueries(entires)),
        (empty, _, _) => {
            // The empty parser joins the serial scan: it completes on no
            // items and fails on any, which is the empty contract.
            if let Some(candidate) = empty {
                serials.insert(0, candidate);
            }
            if entires.is_empty() {
                Some(QueryNode::SerialQueries(serials))
            } else {
                Some(QueryNode::MixedQueries { serials, entires })
            }
        }
    }
}
