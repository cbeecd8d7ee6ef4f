//! Turn state: the channel layout the graph operates on
//!
//! One user turn is a JSON state object whose fields are declared as
//! channels with explicit merge semantics. The evidence lists are
//! clearable-append (`null` clears, `[]` is a no-op, `[x…]` appends) so
//! parallel workers can write without clobbering each other and the turn
//! initializer can reset them explicitly; `waiting` is additive and exists
//! as the observable form of the fan-in barrier.
//!
//! [`TurnState`] wraps the raw JSON with typed accessors; nodes read
//! through it and write partial states built with the field constants.

use flow_core::{ChannelKind, Graph, Message};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// State field names
pub mod fields {
    pub const MESSAGES: &str = "messages";
    pub const THREAD_ID: &str = "thread_id";
    pub const USER_ID: &str = "user_id";
    pub const FILE_ID: &str = "file_id";
    pub const INTENT: &str = "intent";
    pub const INTENT_SLOTS: &str = "intent_slots";
    pub const INTENT_ANALYSIS: &str = "intent_analysis";
    pub const INTENT_COMPOSED: &str = "intent_composed";
    pub const PLAN: &str = "plan";
    pub const STAGE_INDEX: &str = "stage_index";
    pub const SQL_RESULTS: &str = "sql_results";
    pub const VEC_RESULTS: &str = "vec_results";
    pub const KG_RESULTS: &str = "kg_results";
    pub const MERGED: &str = "merged";
    pub const WAITING: &str = "waiting";
    pub const AGG_ROUTE: &str = "agg_route";
    pub const CANDIDATE_TOOL_CALLS: &str = "candidate_tool_calls";
    pub const APPROVAL_PENDING: &str = "approval_pending";
    pub const ALREADY_STREAMED: &str = "already_streamed";
    pub const FINAL_ANSWER: &str = "final_answer";
}

/// Declare every turn-state channel on a graph.
pub fn declare_channels(graph: &mut Graph) {
    graph.add_channel(fields::MESSAGES, ChannelKind::Messages);
    graph.add_channel(fields::SQL_RESULTS, ChannelKind::ClearableList);
    graph.add_channel(fields::VEC_RESULTS, ChannelKind::ClearableList);
    graph.add_channel(fields::KG_RESULTS, ChannelKind::ClearableList);
    graph.add_channel(fields::MERGED, ChannelKind::ClearableList);
    graph.add_channel(fields::WAITING, ChannelKind::Counter);
    // identifiers, intent, plan, routes, flags: LastValue (the default)
}

/// Where a piece of evidence came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceSource {
    Sql,
    Vector,
    Kg,
}

/// Normalized retrieval result, identical across workers.
///
/// SQL rows leave `text` empty in structured mode; vector hits carry the
/// chunk text; KG items carry a fact string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub source: EvidenceSource,
}

impl EvidenceRecord {
    pub fn new(source: EvidenceSource, text: impl Into<String>, score: f64) -> Self {
        Self {
            text: text.into(),
            score,
            metadata: Map::new(),
            source,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Dedup key: `(source, metadata.id)` when an id is present, otherwise
    /// a hash of the text.
    pub fn dedup_key(&self) -> String {
        match self.metadata.get("id") {
            Some(id) if !id.is_null() => format!("{:?}:{id}", self.source),
            _ => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                self.text.hash(&mut hasher);
                format!("{:?}:text:{:x}", self.source, hasher.finish())
            }
        }
    }
}

/// Read-only typed view over the raw state object
#[derive(Debug, Clone, Copy)]
pub struct TurnState<'a>(pub &'a Value);

impl<'a> TurnState<'a> {
    pub fn messages(&self) -> Vec<Message> {
        self.0
            .get(fields::MESSAGES)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn last_user_text(&self) -> Option<String> {
        let messages = self.messages();
        flow_core::last_human_text(&messages).map(str::to_string)
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.str_field(fields::THREAD_ID)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.str_field(fields::USER_ID)
    }

    pub fn intent(&self) -> Option<&str> {
        self.str_field(fields::INTENT)
    }

    pub fn stage_index(&self) -> usize {
        self.0
            .get(fields::STAGE_INDEX)
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize
    }

    pub fn waiting(&self) -> i64 {
        self.0
            .get(fields::WAITING)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn bool_field(&self, field: &str) -> bool {
        self.0.get(field).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn evidence(&self, field: &str) -> Vec<EvidenceRecord> {
        self.0
            .get(field)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn intent_signals(&self) -> Vec<String> {
        self.0
            .get(fields::INTENT_ANALYSIS)
            .and_then(|v| v.get("signals"))
            .and_then(Value::as_array)
            .map(|signals| {
                signals
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
