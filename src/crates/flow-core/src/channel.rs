//! State channels and their reducers
//!
//! Every field of the graph state is a channel with a [`ChannelKind`] that
//! governs how concurrent writes from one superstep merge:
//!
//! | Kind | Update semantics |
//! |---|---|
//! | `LastValue` | overwrite (last writer wins within the ordered merge) |
//! | `Messages` | append with de-dup by message id ([`add_messages`]) |
//! | `ClearableList` | `null` = clear, `[]` = no-op, `[x…]` = append |
//! | `Counter` | integer addition |
//!
//! `ClearableList` is the load-bearing one: a worker that found nothing
//! returns `[]` and must not wipe what a sibling appended, while the turn
//! initializer needs an explicit reset signal. The sentinel for reset is
//! JSON `null`, kept distinct from the empty list.

use crate::messages::{add_messages, Message};
use serde::Serialize;
use serde_json::Value;

/// Merge semantics of a state channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Overwrite with the newest value
    LastValue,
    /// Message list with id-based de-duplication
    Messages,
    /// Three-valued list: clear / no-op / append
    ClearableList,
    /// Additive integer (fan-in barrier accounting)
    Counter,
}

/// Typed writer for `ClearableList` channels.
///
/// Nodes build their partial state with this instead of hand-rolling the
/// sentinel values.
#[derive(Debug, Clone, PartialEq)]
pub enum ListUpdate<T> {
    /// Reset the channel to an empty list
    Clear,
    /// Leave the channel untouched
    Noop,
    /// Append the items
    Append(Vec<T>),
}

impl<T: Serialize> ListUpdate<T> {
    /// Wire form consumed by the `ClearableList` reducer.
    pub fn into_value(self) -> Value {
        match self {
            ListUpdate::Clear => Value::Null,
            ListUpdate::Noop => Value::Array(vec![]),
            ListUpdate::Append(items) => {
                serde_json::to_value(items).unwrap_or_else(|_| Value::Array(vec![]))
            }
        }
    }
}

/// Apply one update to a channel's current value.
///
/// Pure; called once per (node, field) pair in deterministic node order.
pub fn reduce(kind: ChannelKind, current: Option<&Value>, update: Value) -> Value {
    match kind {
        ChannelKind::LastValue => update,
        ChannelKind::Counter => {
            let cur = current.and_then(Value::as_i64).unwrap_or(0);
            let upd = update.as_i64().unwrap_or(0);
            Value::from(cur + upd)
        }
        ChannelKind::ClearableList => reduce_clearable(current, update),
        ChannelKind::Messages => reduce_messages(current, update),
    }
}

fn reduce_clearable(current: Option<&Value>, update: Value) -> Value {
    // null is the explicit clear signal, distinct from the empty list no-op
    if update.is_null() {
        return Value::Array(vec![]);
    }
    let cur_items = match current {
        Some(Value::Array(items)) => items.clone(),
        _ => vec![],
    };
    match update {
        Value::Array(items) if items.is_empty() => Value::Array(cur_items),
        Value::Array(items) => {
            let mut merged = cur_items;
            merged.extend(items);
            Value::Array(merged)
        }
        // non-list update is a no-op
        _ => Value::Array(cur_items),
    }
}

fn reduce_messages(current: Option<&Value>, update: Value) -> Value {
    let left: Vec<Message> = current
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let right: Vec<Message> = match serde_json::from_value(update.clone()) {
        Ok(msgs) => msgs,
        // single message written without the surrounding array
        Err(_) => match serde_json::from_value::<Message>(update) {
            Ok(msg) => vec![msg],
            Err(_) => vec![],
        },
    };
    serde_json::to_value(add_messages(left, right)).unwrap_or_else(|_| Value::Array(vec![]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_last_value_overwrites() {
        let v = reduce(ChannelKind::LastValue, Some(&json!("old")), json!("new"));
        assert_eq!(v, json!("new"));
    }

    #[test]
    fn test_counter_adds() {
        let v = reduce(ChannelKind::Counter, Some(&json!(2)), json!(-1));
        assert_eq!(v, json!(1));
        let v = reduce(ChannelKind::Counter, None, json!(3));
        assert_eq!(v, json!(3));
    }

    #[test]
    fn test_clearable_null_clears() {
        let v = reduce(
            ChannelKind::ClearableList,
            Some(&json!([1, 2, 3])),
            Value::Null,
        );
        assert_eq!(v, json!([]));
    }

    #[test]
    fn test_clearable_empty_is_noop() {
        let v = reduce(ChannelKind::ClearableList, Some(&json!([1, 2])), json!([]));
        assert_eq!(v, json!([1, 2]));
    }

    #[test]
    fn test_clearable_appends() {
        let v = reduce(ChannelKind::ClearableList, Some(&json!([1])), json!([2, 3]));
        assert_eq!(v, json!([1, 2, 3]));
        let v = reduce(ChannelKind::ClearableList, None, json!([9]));
        assert_eq!(v, json!([9]));
    }

    #[test]
    fn test_clearable_non_list_is_noop() {
        let v = reduce(ChannelKind::ClearableList, Some(&json!([1])), json!("junk"));
        assert_eq!(v, json!([1]));
    }

    #[test]
    fn test_list_update_wire_forms() {
        assert_eq!(ListUpdate::<i32>::Clear.into_value(), Value::Null);
        assert_eq!(ListUpdate::<i32>::Noop.into_value(), json!([]));
        assert_eq!(ListUpdate::Append(vec![1, 2]).into_value(), json!([1, 2]));
    }

    #[test]
    fn test_messages_reducer_dedups() {
        let left = json!([{"id": "m1", "role": "human", "content": "a"}]);
        let update = json!([
            {"id": "m1", "role": "human", "content": "a2"},
            {"id": "m2", "role": "assistant", "content": "b"}
        ]);
        let merged = reduce(ChannelKind::Messages, Some(&left), update);
        let arr = merged.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["content"], "a2");
    }

    fn arb_items() -> impl Strategy<Value = Vec<i64>> {
        proptest::collection::vec(any::<i64>(), 0..8)
    }

    proptest! {
        // clear always yields empty, regardless of current contents
        #[test]
        fn prop_clear_wins(cur in arb_items()) {
            let current = json!(cur);
            let out = reduce(ChannelKind::ClearableList, Some(&current), Value::Null);
            prop_assert_eq!(out, json!([]));
        }

        // empty update never changes the current value
        #[test]
        fn prop_empty_is_noop(cur in arb_items()) {
            let current = json!(cur.clone());
            let out = reduce(ChannelKind::ClearableList, Some(&current), json!([]));
            prop_assert_eq!(out, json!(cur));
        }

        // non-empty update is exactly concatenation
        #[test]
        fn prop_append_concats(cur in arb_items(), upd in arb_items()) {
            prop_assume!(!upd.is_empty());
            let current = json!(cur.clone());
            let out = reduce(ChannelKind::ClearableList, Some(&current), json!(upd.clone()));
            let mut expected = cur;
            expected.extend(upd);
            prop_assert_eq!(out, json!(expected));
        }

        // counter updates commute
        #[test]
        fn prop_counter_commutes(a in -1000i64..1000, b in -1000i64..1000) {
            let ab = reduce(ChannelKind::Counter, Some(&reduce(ChannelKind::Counter, None, json!(a))), json!(b));
            let ba = reduce(ChannelKind::Counter, Some(&reduce(ChannelKind::Counter, None, json!(b))), json!(a));
            prop_assert_eq!(ab, ba);
        }
    }
}
