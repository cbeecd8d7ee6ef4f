//! Serialization adapter: domain values <-> JSON-safe persisted form
//!
//! Checkpoint rows hold plain JSONB, but several domain shapes need tagging
//! so they survive the round trip and stay readable by other consumers of
//! the store:
//!
//! | Domain shape | Persisted form |
//! |---|---|
//! | message list | `{"__type__":"lc_message_list","data":[{role, content, ...}]}` |
//! | fan-out send | `{"__type__":"Send","node":...,"arg":...}` |
//! | datetime | `{"__type__":"datetime","data":"<ISO-8601>"}` |
//! | UUID | `{"__type__":"uuid","data":"<string>"}` |
//! | write triple | `{"__type__":"tuple","data":[...]}` |
//!
//! Decoding reverses the tags; an unknown `__type__` passes its `data`
//! through, so newer writers do not break older readers. Metadata is
//! trimmed before persisting: engine-internal keys (`writes`, `tasks`,
//! `pending_writes`, `commands`, `task_path`) are dropped at the top level
//! and one nested level, and a strict `{source, step, parents}` allow-list
//! is the fallback when a full metadata row was rejected by the store.

use crate::checkpoint::CheckpointMetadata;
use serde_json::{json, Map, Value};

const TYPE_KEY: &str = "__type__";
const MESSAGE_LIST: &str = "lc_message_list";
const SEND: &str = "Send";
const DATETIME: &str = "datetime";
const UUID_TAG: &str = "uuid";
const TUPLE: &str = "tuple";

/// Metadata keys that may carry non-persistable engine internals
const TRIMMED_METADATA_KEYS: [&str; 5] =
    ["writes", "tasks", "pending_writes", "commands", "task_path"];

/// Recursively convert a state value into its persisted form.
pub fn to_jsonable(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            if is_message_list(items) {
                json!({
                    TYPE_KEY: MESSAGE_LIST,
                    "data": items.clone(),
                })
            } else {
                Value::Array(items.iter().map(to_jsonable).collect())
            }
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), to_jsonable(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Reverse [`to_jsonable`]: strip tags back to the domain shapes.
pub fn from_jsonable(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(tag) = map.get(TYPE_KEY).and_then(Value::as_str) {
                let data = map.get("data").cloned().unwrap_or(Value::Null);
                return match tag {
                    MESSAGE_LIST => from_jsonable(&data),
                    SEND => json!({
                        "node": map.get("node").cloned().unwrap_or(Value::Null),
                        "arg": from_jsonable(&map.get("arg").cloned().unwrap_or(Value::Null)),
                    }),
                    DATETIME | UUID_TAG => data,
                    TUPLE => from_jsonable(&data),
                    // forward compatibility: unwrap unknown tags
                    _ => from_jsonable(&data),
                };
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), from_jsonable(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(from_jsonable).collect()),
        other => other.clone(),
    }
}

/// Encode a channel-values map, tagging each value as needed. A value that
/// fails to encode is reduced to `null` rather than failing the write.
pub fn encode_channel_values(values: &Map<String, Value>) -> Map<String, Value> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), to_jsonable(v)))
        .collect()
}

pub fn decode_channel_values(values: &Map<String, Value>) -> Map<String, Value> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), from_jsonable(v)))
        .collect()
}

/// Tag a fan-out send for persistence.
pub fn encode_send(send: &Value) -> Value {
    json!({
        TYPE_KEY: SEND,
        "node": send.get("node").cloned().unwrap_or(Value::Null),
        "arg": to_jsonable(send.get("arg").unwrap_or(&Value::Null)),
    })
}

pub fn encode_pending_sends(sends: &[Value]) -> Vec<Value> {
    sends.iter().map(encode_send).collect()
}

pub fn decode_pending_sends(sends: &[Value]) -> Vec<Value> {
    sends.iter().map(from_jsonable).collect()
}

/// Tag an ISO-8601 timestamp value.
pub fn tag_datetime(dt: chrono::DateTime<chrono::Utc>) -> Value {
    json!({ TYPE_KEY: DATETIME, "data": dt.to_rfc3339() })
}

/// Tag a UUID value.
pub fn tag_uuid(id: uuid::Uuid) -> Value {
    json!({ TYPE_KEY: UUID_TAG, "data": id.to_string() })
}

/// Tag a pending-write triple `(task_id, channel, value)`.
pub fn encode_write_tuple(task_id: &str, channel: &str, value: &Value) -> Value {
    json!({
        TYPE_KEY: TUPLE,
        "data": [task_id, channel, to_jsonable(value)],
    })
}

/// Trim engine internals out of metadata before persisting.
pub fn encode_metadata(metadata: &CheckpointMetadata) -> Value {
    let mut value = match serde_json::to_value(metadata) {
        Ok(v) => v,
        Err(_) => return fallback_metadata(metadata),
    };
    if let Value::Object(map) = &mut value {
        for key in TRIMMED_METADATA_KEYS {
            map.remove(key);
        }
        for (_, nested) in map.iter_mut() {
            if let Value::Object(inner) = nested {
                for key in TRIMMED_METADATA_KEYS {
                    inner.remove(key);
                }
            }
        }
    }
    value
}

/// Strict allow-list form used when the full metadata row was rejected.
pub fn fallback_metadata(metadata: &CheckpointMetadata) -> Value {
    json!({
        "source": metadata.source,
        "step": metadata.step,
        "parents": metadata.parents,
    })
}

/// Heuristic: a non-empty array of objects carrying `role` and `content`
/// is treated as an ordered message sequence.
fn is_message_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items.iter().all(|item| {
            item.as_object()
                .map(|o| o.contains_key("role") && o.contains_key("content"))
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use proptest::prelude::*;

    #[test]
    fn test_message_list_round_trip() {
        let messages = json!([
            {"id": "m1", "role": "human", "content": "hi"},
            {"id": "m2", "role": "assistant", "content": "hello", "tool_calls": [
                {"id": "c1", "name": "lookup", "args": {"q": "x"}}
            ]},
        ]);
        let encoded = to_jsonable(&messages);
        assert_eq!(encoded[TYPE_KEY], MESSAGE_LIST);
        assert_eq!(from_jsonable(&encoded), messages);
    }

    #[test]
    fn test_evidence_list_not_tagged() {
        let evidence = json!([{"text": "chunk", "score": 0.9, "metadata": {}, "source": "vector"}]);
        let encoded = to_jsonable(&evidence);
        assert!(encoded.is_array());
        assert_eq!(from_jsonable(&encoded), evidence);
    }

    #[test]
    fn test_send_round_trip() {
        let send = json!({"node": "worker_sql", "arg": {"step": {"call": "sql"}, "messages": [
            {"role": "human", "content": "q"}
        ]}});
        let encoded = encode_send(&send);
        assert_eq!(encoded[TYPE_KEY], SEND);
        // nested message list inside the arg gets tagged too
        assert_eq!(encoded["arg"]["messages"][TYPE_KEY], MESSAGE_LIST);
        assert_eq!(from_jsonable(&encoded), send);
    }

    #[test]
    fn test_datetime_and_uuid_tags_decode_to_strings() {
        let now = chrono::Utc::now();
        let tagged = tag_datetime(now);
        assert_eq!(from_jsonable(&tagged), json!(now.to_rfc3339()));

        let id = uuid::Uuid::new_v4();
        let tagged = tag_uuid(id);
        assert_eq!(from_jsonable(&tagged), json!(id.to_string()));
    }

    #[test]
    fn test_tuple_tag_decodes_to_array() {
        let tagged = encode_write_tuple("0:worker", "sql_results", &json!([1, 2]));
        assert_eq!(from_jsonable(&tagged), json!(["0:worker", "sql_results", [1, 2]]));
    }

    #[test]
    fn test_unknown_tag_passes_data_through() {
        let v = json!({TYPE_KEY: "SomeFutureThing", "data": {"a": 1}});
        assert_eq!(from_jsonable(&v), json!({"a": 1}));
    }

    #[test]
    fn test_metadata_trimming() {
        let meta = CheckpointMetadata::new(CheckpointSource::Loop, 2)
            .with_extra("writes", json!(["not", "persistable"]))
            .with_extra("nested", json!({"tasks": [1], "keep": true}))
            .with_extra("keep_me", json!(1));
        let encoded = encode_metadata(&meta);
        assert!(encoded.get("writes").is_none());
        assert!(encoded["nested"].get("tasks").is_none());
        assert_eq!(encoded["nested"]["keep"], true);
        assert_eq!(encoded["keep_me"], 1);
        assert_eq!(encoded["step"], 2);
    }

    #[test]
    fn test_fallback_metadata_allow_list() {
        let meta = CheckpointMetadata::new(CheckpointSource::Input, -1)
            .with_extra("junk", json!({"deep": "stuff"}));
        let fallback = fallback_metadata(&meta);
        let obj = fallback.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(fallback["source"], "input");
        assert_eq!(fallback["step"], -1);
    }

    // Arbitrary JSON without the tag key, to check the general round trip
    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::hash_map("[a-z]{1,6}", inner, 0..4).prop_map(|m| {
                    Value::Object(m.into_iter().collect())
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip_preserves_values(v in arb_json()) {
            // "role"/"content" objects would be message-tagged; the generated
            // keys are 1-6 chars so "content" never appears, making the
            // round trip an identity.
            prop_assert_eq!(from_jsonable(&to_jsonable(&v)), v);
        }
    }
}
