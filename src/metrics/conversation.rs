// Conversation payload extraction
//
// Chat records store their turns in one of two shapes, and older rows
// mix both:
//
//   flat list:    { "messages": [ { "id": "m1", "model": "A", ... }, ... ] }
//   keyed map:    { "history": { "messages": { "m1": { "model": "A", ... } } } }
//
// Turns from both shapes are merged by message id so a turn stored in
// both places counts once.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: Option<String>,
    /// Model that produced the turn, when recorded
    pub model: Option<String>,
}

/// Per-chat aggregate of its turns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSummary {
    /// All turns, with or without a model
    pub turns: usize,
    /// Turn count per model name
    pub models: BTreeMap<String, usize>,
}

impl ConversationSummary {
    /// Distinct model names used in the chat
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

/// Extracts the turns of a chat payload from both storage shapes
///
/// Keyed-map entries are taken first. List entries are added when their
/// id has not been seen; list entries without an id are only used when
/// the keyed map contributed nothing, since they cannot be matched.
pub fn extract_turns(payload: &Value) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    if let Some(history) = payload
        .pointer("/history/messages")
        .and_then(Value::as_object)
    {
        for (key, message) in history {
            if !message.is_object() {
                continue;
            }
            let id = message
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(key)
                .to_string();
            if seen.insert(id.clone()) {
                turns.push(Turn {
                    id: Some(id),
                    model: model_of(message),
                });
            }
        }
    }

    let keyed = !turns.is_empty();

    if let Some(list) = payload.get("messages").and_then(Value::as_array) {
        for message in list.iter().filter(|m| m.is_object()) {
            match message.get("id").and_then(Value::as_str) {
                Some(id) => {
                    if seen.insert(id.to_string()) {
                        turns.push(Turn {
                            id: Some(id.to_string()),
                            model: model_of(message),
                        });
                    }
                }
                None if !keyed => turns.push(Turn {
                    id: None,
                    model: model_of(message),
                }),
                None => {}
            }
        }
    }

    turns
}

/// Summarizes a chat payload into turn and per-model counts
pub fn summarize(payload: &Value) -> ConversationSummary {
    let mut summary = ConversationSummary::default();
    for turn in extract_turns(payload) {
        summary.turns += 1;
        if let Some(model) = turn.model {
            *summary.models.entry(model).or_insert(0) += 1;
        }
    }
    summary
}

fn model_of(message: &Value) -> Option<String> {
    message
        .get("model")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counts(summary: &ConversationSummary) -> Vec<(&str, usize)> {
        summary
            .models
            .iter()
            .map(|(model, count)| (model.as_str(), *count))
            .collect()
    }

    #[test]
    fn test_flat_list_shape() {
        let payload = json!({
            "messages": [
                {"id": "1", "role": "assistant", "model": "A"},
                {"id": "2", "role": "assistant", "model": "A"},
                {"id": "3", "role": "assistant", "model": "B"}
            ]
        });
        let summary = summarize(&payload);
        assert_eq!(summary.turns, 3);
        assert_eq!(counts(&summary), vec![("A", 2), ("B", 1)]);
    }

    #[test]
    fn test_keyed_map_shape_matches_flat_list() {
        let payload = json!({
            "history": {
                "messages": {
                    "1": {"id": "1", "model": "A"},
                    "2": {"id": "2", "model": "A"},
                    "3": {"id": "3", "model": "B"}
                }
            }
        });
        let summary = summarize(&payload);
        assert_eq!(summary.turns, 3);
        assert_eq!(counts(&summary), vec![("A", 2), ("B", 1)]);
    }

    #[test]
    fn test_both_shapes_in_one_record_are_not_double_counted() {
        let payload = json!({
            "history": {
                "messages": {
                    "1": {"id": "1", "model": "A"},
                    "2": {"id": "2", "model": "B"}
                }
            },
            "messages": [
                {"id": "1", "model": "A"},
                {"id": "2", "model": "B"},
                {"id": "3", "model": "B"}
            ]
        });
        let summary = summarize(&payload);
        assert_eq!(summary.turns, 3);
        assert_eq!(counts(&summary), vec![("A", 1), ("B", 2)]);
    }

    #[test]
    fn test_keyed_map_without_inner_ids_uses_keys() {
        let payload = json!({
            "history": {"messages": {"x": {"model": "A"}, "y": {"role": "user"}}},
            "messages": [{"id": "x", "model": "A"}]
        });
        let summary = summarize(&payload);
        assert_eq!(summary.turns, 2);
        assert_eq!(counts(&summary), vec![("A", 1)]);
    }

    #[test]
    fn test_list_without_ids() {
        let payload = json!({
            "messages": [{"model": "A"}, {"role": "user"}, {"model": ""}]
        });
        let summary = summarize(&payload);
        assert_eq!(summary.turns, 3);
        assert_eq!(counts(&summary), vec![("A", 1)]);
    }

    #[test]
    fn test_unrecognized_payloads_are_empty() {
        for payload in [json!(null), json!([]), json!({"title": "x"}), json!({"messages": "nope"})] {
            assert_eq!(summarize(&payload), ConversationSummary::default());
        }
    }
}
