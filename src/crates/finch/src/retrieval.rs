//! Retrieval backend interfaces
//!
//! The workers call out to three external collaborators (a relational
//! query service, a vector index, and a knowledge graph) through the
//! traits defined here. Implementations live outside this crate; the
//! [`Unconfigured`] stand-in keeps a development deployment running (every
//! query answers empty, loudly) and tests inject mocks.

use crate::error::Result;
use crate::state::EvidenceRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

/// Tables whose rows are scoped to the requesting user; the SQL worker
/// injects the user id into the predicate set for these.
pub const USER_SCOPED_TABLES: [&str; 2] = ["order", "payment"];

fn default_limit() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderByItem {
    pub field: String,
    #[serde(default = "OrderByItem::default_direction")]
    pub direction: String,
}

impl OrderByItem {
    fn default_direction() -> String {
        "ASC".to_string()
    }
}

/// Simple relational query: one table, field list, condition map.
/// Conditions support operator objects (`{"gte": ..., "like": ...}`) or
/// bare equality values; raw SQL strings are not representable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleQuery {
    pub table: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub conditions: Map<String, Value>,
    #[serde(default)]
    pub order_by: Vec<OrderByItem>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

/// SQL worker input, discriminated by shape
#[derive(Debug, Clone)]
pub enum SqlQueryInput {
    Simple(SimpleQuery),
    /// Structured draft interpreted by the query service
    Structured { query_draft: Value },
}

impl SqlQueryInput {
    /// Pick the tool by parameter shape: a `query_draft` key selects the
    /// structured form, anything else parses as a simple query.
    pub fn from_args(args: &Value) -> std::result::Result<Self, String> {
        if let Some(draft) = args.get("query_draft") {
            return Ok(SqlQueryInput::Structured {
                query_draft: draft.clone(),
            });
        }
        serde_json::from_value::<SimpleQuery>(args.clone())
            .map(SqlQueryInput::Simple)
            .map_err(|e| format!("invalid sql query args: {e}"))
    }

    /// Scope the query to the requesting user where the table demands it.
    pub fn inject_user_id(&mut self, user_id: &str) {
        if let SqlQueryInput::Simple(query) = self {
            if USER_SCOPED_TABLES.contains(&query.table.as_str())
                && !query.conditions.contains_key("user_id")
            {
                query
                    .conditions
                    .insert("user_id".to_string(), Value::String(user_id.to_string()));
            }
        }
    }
}

/// Vector index query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorQuery {
    pub query: String,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default = "VectorQuery::default_limit")]
    pub limit: usize,
}

impl VectorQuery {
    fn default_limit() -> usize {
        5
    }

    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: Map::new(),
            limit: Self::default_limit(),
        }
    }
}

/// Knowledge-graph call types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KgCallType {
    Search,
    WriteEpisode,
    WriteEntity,
    WriteEdge,
    IngestDetect,
    IngestCommit,
}

impl KgCallType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "graph.search" => Some(Self::Search),
            "graph.write.episode" => Some(Self::WriteEpisode),
            "graph.write.entity" => Some(Self::WriteEntity),
            "graph.write.edge" => Some(Self::WriteEdge),
            "graph.ingest.detect" => Some(Self::IngestDetect),
            "graph.ingest.commit" => Some(Self::IngestCommit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "graph.search",
            Self::WriteEpisode => "graph.write.episode",
            Self::WriteEntity => "graph.write.entity",
            Self::WriteEdge => "graph.write.edge",
            Self::IngestDetect => "graph.ingest.detect",
            Self::IngestCommit => "graph.ingest.commit",
        }
    }

    /// Anything that mutates the graph needs a human to sign off first.
    pub fn requires_approval(&self) -> bool {
        !matches!(self, Self::Search)
    }
}

impl fmt::Display for KgCallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool names the turn-level probe may propose that require the approval
/// round trip before execution. Underscored because providers reject dots
/// in function names.
pub const APPROVAL_NEEDED_TOOLS: [&str; 2] = ["graph_ingest_detect", "graph_ingest_commit"];

/// Map an approval tool name onto its knowledge-graph call.
pub fn kg_call_for_tool(tool_name: &str) -> Option<KgCallType> {
    match tool_name {
        "graph_ingest_detect" => Some(KgCallType::IngestDetect),
        "graph_ingest_commit" => Some(KgCallType::IngestCommit),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct KgRequest {
    pub call_type: KgCallType,
    pub args: Value,
}

/// Relational query backend
#[async_trait]
pub trait SqlQueryService: Send + Sync {
    async fn query(&self, input: &SqlQueryInput) -> Result<Vec<EvidenceRecord>>;
}

/// Vector search backend
#[async_trait]
pub trait VectorSearchService: Send + Sync {
    async fn search(&self, query: &VectorQuery) -> Result<Vec<EvidenceRecord>>;
}

/// Knowledge-graph backend
#[async_trait]
pub trait GraphService: Send + Sync {
    async fn call(&self, request: &KgRequest) -> Result<Vec<EvidenceRecord>>;
}

/// Slot bundle produced by the external intent extractor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotBundle {
    #[serde(default)]
    pub slots: Map<String, Value>,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub composed: Option<String>,
}

/// External slot/intent extractor
#[async_trait]
pub trait SlotExtractor: Send + Sync {
    async fn extract(&self, utterance: &str) -> Result<SlotBundle>;
}

/// Stand-in backend for deployments without retrieval services configured.
/// Every call answers empty and logs what was skipped.
#[derive(Debug, Default, Clone)]
pub struct Unconfigured;

#[async_trait]
impl SqlQueryService for Unconfigured {
    async fn query(&self, input: &SqlQueryInput) -> Result<Vec<EvidenceRecord>> {
        warn!(?input, "sql backend not configured, returning no rows");
        Ok(vec![])
    }
}

#[async_trait]
impl VectorSearchService for Unconfigured {
    async fn search(&self, query: &VectorQuery) -> Result<Vec<EvidenceRecord>> {
        warn!(query = %query.query, "vector backend not configured, returning no hits");
        Ok(vec![])
    }
}

#[async_trait]
impl GraphService for Unconfigured {
    async fn call(&self, request: &KgRequest) -> Result<Vec<EvidenceRecord>> {
        warn!(call = %request.call_type, "kg backend not configured, returning no items");
        Ok(vec![])
    }
}

#[async_trait]
impl SlotExtractor for Unconfigured {
    async fn extract(&self, _utterance: &str) -> Result<SlotBundle> {
        Ok(SlotBundle::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_input_shape_detection() {
        let simple = SqlQueryInput::from_args(&json!({
            "table": "order",
            "fields": ["*"],
            "order_by": [{"field": "create_time", "direction": "DESC"}],
            "limit": 10
        }))
        .unwrap();
        match simple {
            SqlQueryInput::Simple(q) => {
                assert_eq!(q.table, "order");
                assert_eq!(q.limit, 10);
                assert_eq!(q.order_by[0].direction, "DESC");
            }
            _ => panic!("expected simple query"),
        }

        let structured =
            SqlQueryInput::from_args(&json!({"query_draft": {"intent": "top customers"}}))
                .unwrap();
        assert!(matches!(structured, SqlQueryInput::Structured { .. }));

        assert!(SqlQueryInput::from_args(&json!({"fields": ["*"]})).is_err());
    }

    #[test]
    fn test_user_id_injection_scoped_tables_only() {
        let mut input = SqlQueryInput::from_args(&json!({
            "table": "order",
            "fields": ["*"]
        }))
        .unwrap();
        input.inject_user_id("u1");
        match &input {
            SqlQueryInput::Simple(q) => assert_eq!(q.conditions["user_id"], json!("u1")),
            _ => unreachable!(),
        }

        let mut input = SqlQueryInput::from_args(&json!({
            "table": "market_news",
            "fields": ["title"]
        }))
        .unwrap();
        input.inject_user_id("u1");
        match &input {
            SqlQueryInput::Simple(q) => assert!(!q.conditions.contains_key("user_id")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_user_id_injection_keeps_existing_condition() {
        let mut input = SqlQueryInput::from_args(&json!({
            "table": "order",
            "fields": ["*"],
            "conditions": {"user_id": "explicit"}
        }))
        .unwrap();
        input.inject_user_id("u1");
        match &input {
            SqlQueryInput::Simple(q) => assert_eq!(q.conditions["user_id"], json!("explicit")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_kg_call_type_parsing() {
        assert_eq!(KgCallType::parse("graph.search"), Some(KgCallType::Search));
        assert_eq!(
            KgCallType::parse("graph.ingest.commit"),
            Some(KgCallType::IngestCommit)
        );
        assert_eq!(KgCallType::parse("graph.unknown"), None);
        assert!(!KgCallType::Search.requires_approval());
        assert!(KgCallType::WriteEdge.requires_approval());
        assert!(KgCallType::IngestCommit.requires_approval());
    }
}
