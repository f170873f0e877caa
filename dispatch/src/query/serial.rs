use super::{ParseStatus, QueryValue};
use crate::context::QueryItem;
use std::fmt;
use std::sync::Arc;

type CustomDecoder = Arc<dyn Fn(Option<&str>) -> Option<QueryValue> + Send + Sync>;

/// How a slot turns a raw query-item value into a typed one.
#[derive(Clone)]
pub enum SlotDecoder {
    /// Name-only items decode to `true`; otherwise `true/1/yes` and
    /// `false/0/no` are accepted.
    Bool,
    Int,
    Float,
    Text,
    Custom(CustomDecoder),
}

impl SlotDecoder {
    pub fn custom(
        decode: impl Fn(Option<&str>) -> Option<QueryValue> + Send + Sync + 'static,
    ) -> Self {
        SlotDecoder::Custom(Arc::new(decode))
    }

    fn decode(&self, value: Option<&str>) -> Option<QueryValue> {
        match self {
            SlotDecoder::Bool => match value {
                None => Some(QueryValue::Bool(true)),
                Some("true") | Some("1") | Some("yes") => Some(QueryValue::Bool(true)),
                Some("false") | Some("0") | Some("no") => Some(QueryValue::Bool(false)),
                Some(_) => None,
            },
            SlotDecoder::Int => value?.parse().ok().map(QueryValue::Int),
            SlotDecoder::Float => value?.parse().ok().map(QueryValue::Float),
            SlotDecoder::Text => value.map(|v| QueryValue::Text(v.to_owned())),
            SlotDecoder::Custom(decode) => decode(value),
        }
    }
}

impl fmt::Debug for SlotDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotDecoder::Bool => "Bool",
            SlotDecoder::Int => "Int",
            SlotDecoder::Float => "Float",
            SlotDecoder::Text => "Text",
            SlotDecoder::Custom(_) => "Custom(..)",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
enum SlotRequirement {
    Required,
    Optional { default: QueryValue },
}

#[derive(Clone, Debug)]
struct SlotSpec {
    name: String,
    requirement: SlotRequirement,
    decoder: SlotDecoder,
}

/// The serial parser: an ordered collection of named typed slots, each
/// required or optional. Items are consumed one by one; each targets the
/// slot with its name.
#[derive(Clone, Debug, Default)]
pub struct SerialSpec {
    slots: Vec<SlotSpec>,
}

impl SerialSpec {
    pub fn new() -> Self {
        SerialSpec::default()
    }

    pub fn required(mut self, name: impl Into<String>, decoder: SlotDecoder) -> Self {
        self.slots.push(SlotSpec {
            name: name.into(),
            requirement: SlotRequirement::Required,
            decoder,
        });
        self
    }

    pub fn optional(
        mut self,
        name: impl Into<String>,
        decoder: SlotDecoder,
        default: QueryValue,
    ) -> Self {
        self.slots.push(SlotSpec {
            name: name.into(),
            requirement: SlotRequirement::Optional { default },
            decoder,
        });
        self
    }

    fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.name == name)
    }
}

/// Mutable scan state for one serial parser.
pub(crate) struct SerialState {
    assigned: Vec<Option<QueryValue>>,
    status: ParseStatus,
}

impl SerialState {
    pub(crate) fn new(spec: &SerialSpec) -> Self {
        SerialState {
            assigned: vec![None; spec.slots.len()],
            status: ParseStatus::Incomplete,
        }
    }

    pub(crate) fn status(&self) -> ParseStatus {
        self.status
    }

    pub(crate) fn feed(&mut self, spec: &SerialSpec, item: &QueryItem) {
        if self.status == ParseStatus::Failure {
            return;
        }
        let Some(index) = spec.slot_index(&item.name) else {
            self.status = ParseStatus::Failure;
            return;
        };
        if self.assigned[index].is_some() {
            // Re-assignment is not an error; the slot is already done.
            return;
        }
        match spec.slots[index].decoder.decode(item.value.as_deref()) {
            Some(value) => self.assigned[index] = Some(value),
            None => self.status = ParseStatus::Failure,
        }
    }

    pub(crate) fn finish(&mut self, spec: &SerialSpec) {
        if self.status != ParseStatus::Incomplete {
            return;
        }
        let complete = spec
            .slots
            .iter()
            .zip(&self.assigned)
            .all(|(slot, assigned)| {
                assigned.is_some() || matches!(slot.requirement, SlotRequirement::Optional { .. })
            });
        if complete {
            self.status = ParseStatus::Complete;
        }
    }

    /// Composes the per-slot results into a single typed tuple, optional
    /// slots falling back to their defaults.
    pub(crate) fn result(&mut self, spec: &SerialSpec) -> Option<QueryValue> {
        if self.status != ParseStatus::Complete {
            return None;
        }
        let values = spec
            .slots
            .iter()
            .zip(self.assigned.iter_mut())
            .map(|(slot, assigned)| match assigned.take() {
                Some(value) => value,
                None => match &slot.requirement {
                    SlotRequirement::Optional { default } => default.clone(),
                    SlotRequirement::Required => QueryValue::Unit,
                },
            })
            .collect();
        Some(QueryValue::List(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SerialSpec {
        SerialSpec::new().required("a", SlotDecoder::Int).optional(
            "b",
            SlotDecoder::Text,
            QueryValue::Text("dflt".into()),
        )
    }

    fn scan(spec: &SerialSpec, items: &[QueryItem]) -> SerialState {
        let mut state = SerialState::new(spec);
        for item in items {
            state.feed(spec, item);
        }
        state.finish(spec);
        state
    }

    #[test]
    fn test_required_and_optional_slots() {
        let spec = spec();
        let mut state = scan(&spec, &[QueryItem::new("a", Some("42"))]);
        assert_eq!(state.status(), ParseStatus::Complete);
        assert_eq!(
            state.result(&spec),
            Some(QueryValue::List(vec![
                QueryValue::Int(42),
                QueryValue::Text("dflt".into()),
            ]))
        );
    }

    #[test]
    fn test_missing_required_slot_is_incomplete() {
        let spec = spec();
        let state = scan(&spec, &[QueryItem::new("b", Some("x"))]);
        assert_eq!(state.status(), ParseStatus::Incomplete);
    }

    #[test]
    fn test_unknown_name_fails() {
        let spec = spec();
        let state = scan(&spec, &[QueryItem::new("nope", Some("1"))]);
        assert_eq!(state.status(), ParseStatus::Failure);
    }

    #[test]
    fn test_undecodable_value_fails() {
        let spec = spec();
        let state = scan(&spec, &[QueryItem::new("a", Some("not-a-number"))]);
        assert_eq!(state.status(), ParseStatus::Failure);
    }

    #[test]
    fn test_reassignment_is_ignored() {
        let spec = spec();
        let mut state = scan(
            &spec,
            &[
                QueryItem::new("a", Some("1")),
                QueryItem::new("a", Some("2")),
            ],
        );
        assert_eq!(state.status(), ParseStatus::Complete);
        assert_eq!(
            state.result(&spec),
            Some(QueryValue::List(vec![
                QueryValue::Int(1),
                QueryValue::Text("dflt".into()),
            ]))
        );
    }

    #[test]
    fn test_bool_flag_item() {
        let spec = SerialSpec::new().required("verbose", SlotDecoder::Bool);
        let mut state = scan(&spec, &[QueryItem::new("verbose", None)]);
        assert_eq!(
            state.result(&spec),
            Some(QueryValue::List(vec![QueryValue::Bool(true)]))
        );
    }

    #[test]
    fn test_no_slots_completes_on_empty_query() {
        let spec = SerialSpec::new();
        let state = scan(&spec, &[]);
        assert_eq!(state.status(), ParseStatus::Complete);
    }
}
