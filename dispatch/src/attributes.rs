use crate::context::RequestContext;
use crate::processor::Incident;
use crate::response::ResponseContent;
use std::fmt;
use std::sync::Arc;

/// Maps an incident to an optional custom response. Consulted before the
/// incident's default status is emitted.
pub type IncidentCallback =
    dyn Fn(&Incident, &RequestContext) -> Option<ResponseContent> + Send + Sync;

/// Notified when response production fails, before the failure is mapped to
/// an incident.
pub type ErrorCallback =
    dyn Fn(&(dyn std::error::Error + Send + Sync), &RequestContext) + Send + Sync;

/// Attributes a response group attaches to a subtree. Collected during
/// build, copied into the tree, immutable thereafter. Cascades along the
/// path axis only; nearest enclosing wins per field.
#[derive(Clone, Default)]
pub struct GroupAttributes {
    pub incident_callback: Option<Arc<IncidentCallback>>,
    pub error_callback: Option<Arc<ErrorCallback>>,
    pub body_length_limit: Option<u64>,
}

impl GroupAttributes {
    pub fn new() -> Self {
        GroupAttributes::default()
    }

    pub fn on_incident(
        mut self,
        callback: impl Fn(&Incident, &RequestContext) -> Option<ResponseContent> + Send + Sync + 'static,
    ) -> Self {
        self.incident_callback = Some(Arc::new(callback));
        self
    }

    pub fn on_error(
        mut self,
        callback: impl Fn(&(dyn std::error::Error + Send + Sync), &RequestContext)
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    pub fn body_length_limit(mut self, limit: u64) -> Self {
        self.body_length_limit = Some(limit);
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.incident_callback.is_none()
            && self.error_callback.is_none()
            && self.body_length_limit.is_none()
    }

    /// Overlays `other` on `self`: fields present in `other` win.
    pub(crate) fn merge_from(&mut self, other: &GroupAttributes) {
        if let Some(callback) = &other.incident_callback {
            self.incident_callback = Some(callback.clone());
        }
        if let Some(callback) = &other.error_callback {
            self.error_callback = Some(callback.clone());
        }
        if let Some(limit) = other.body_length_limit {
            self.body_length_limit = Some(limit);
        }
    }
}

impl fmt::Debug for GroupAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupAttributes")
            .field("incident_callback", &self.incident_callback.is_some())
            .field("error_callback", &self.error_callback.is_some())
            .field("body_length_limit", &self.body_length_limit)
            .finish()
    }
}

/// Per-request accumulator resolving attribute contributions observed while
/// walking overlapping subtrees.
///
/// Contributions carry the path level they were observed at. Within one
/// descending traversal they merge forward; when the walk jumps to a
/// parallel branch (level goes shallower), the accumulated run is committed
/// first. Deeper runs supersede shallower ones; at equal depth the later
/// observation wins per field.
#[derive(Default)]
pub(crate) struct AttributeCascade {
    group: Option<(usize, GroupAttributes)>,
    resolved: Option<(usize, GroupAttributes)>,
}

impl AttributeCascade {
    pub(crate) fn new() -> Self {
        AttributeCascade::default()
    }

    pub(crate) fn observe(&mut self, level: usize, attrs: &GroupAttributes) {
        match &mut self.group {
            Some((current, group)) if level >= *current => {
                group.merge_from(attrs);
                *current = level;
            }
            Some(_) => {
                self.commit();
                self.group = Some((level, attrs.clone()));
            }
            None => self.group = Some((level, attrs.clone())),
        }
    }

    fn commit(&mut self) {
        let Some((level, group)) = self.group.take() else {
            return;
        };
        match &mut self.resolved {
            Some((committed, resolved)) if level > *committed => {
                resolved.merge_from(&group);
                *committed = level;
            }
            Some(_) => {}
            None => self.resolved = Some((level, group)),
        }
    }

    /// Final commit; yields what the request processor sees.
    pub(crate) fn into_resolved(mut self) -> GroupAttributes {
        self.commit();
        self.resolved.map(|(_, attrs)| attrs).unwrap_or_default()
    }
}
