//! Planner: turn the utterance plus intent slots into a validated plan
//!
//! The LLM is an untrusted source here. Whatever binding method is used
//! (JSON Schema, JSON mode with an inline schema hint, or a single forced
//! `submit_plan` tool), the emitted plan is validated and a deterministic
//! keyword-routed fallback takes over when validation fails, so the
//! orchestrator always receives a usable plan.

use crate::context::AppContext;
use crate::config::PlannerMethod;
use crate::state::{fields, TurnState};
use flow_core::llm::{ChatRequest, ResponseFormat, ToolDefinition};
use flow_core::{GraphError, Message};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// Worker a plan step dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerCall {
    Sql,
    Vec,
    Kg,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub call: WorkerCall,
    #[serde(default)]
    pub args: Value,
    #[serde(default = "default_true")]
    pub when: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Stage {
    /// Steps that survive the `when` filter
    pub fn active_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.when).collect()
    }

    /// How many sends the orchestrator will emit for this stage
    pub fn dispatch_count(&self) -> usize {
        let active = self.active_steps().len();
        if self.parallel {
            active
        } else {
            active.min(1)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub fast_path: bool,
}

impl Plan {
    /// A plan is usable when it has at least one stage and the first stage
    /// keeps at least one step after `when` filtering.
    pub fn is_valid(&self) -> bool {
        !self.stages.is_empty()
            && self
                .stages
                .first()
                .map(|s| !s.active_steps().is_empty())
                .unwrap_or(false)
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }
}

/// JSON Schema for the plan, used by all binding methods
pub fn plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "stages": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "properties": {
                        "parallel": {"type": "boolean"},
                        "steps": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "properties": {
                                    "call": {"type": "string", "enum": ["sql", "vec", "kg"]},
                                    "args": {"type": "object"},
                                    "when": {"type": "boolean"}
                                },
                                "required": ["call"]
                            }
                        }
                    },
                    "required": ["steps"]
                }
            },
            "fast_path": {"type": "boolean"}
        },
        "required": ["stages"]
    })
}

/// Business-data lexicon routed to the SQL worker
const SQL_KEYWORDS: [&str; 10] = [
    "order", "orders", "payment", "pay", "refund", "revenue", "sales", "customer", "invoice",
    "price",
];

/// Knowledge-graph lexicon
const KG_KEYWORDS: [&str; 6] = [
    "relationship",
    "related to",
    "entity",
    "entities",
    "graph",
    "connection",
];

/// Deterministic keyword-routed plan used when the LLM output is unusable.
pub fn fallback_plan(utterance: &str) -> Plan {
    let lower = utterance.to_lowercase();
    let step = if SQL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Step {
            call: WorkerCall::Sql,
            args: json!({
                "table": "order",
                "fields": ["*"],
                "order_by": [{"field": "create_time", "direction": "DESC"}],
                "limit": 10
            }),
            when: true,
        }
    } else if KG_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Step {
            call: WorkerCall::Kg,
            args: json!({"call_type": "graph.search", "query": utterance}),
            when: true,
        }
    } else {
        Step {
            call: WorkerCall::Vec,
            args: json!({"query": utterance, "limit": 5}),
            when: true,
        }
    };
    Plan {
        stages: vec![Stage {
            parallel: false,
            steps: vec![step],
        }],
        fast_path: false,
    }
}

fn planner_system_prompt(turn: &TurnState, include_schema_hint: bool) -> String {
    let mut prompt = String::from(
        "You are a retrieval planner. Break the user's request into stages of \
         retrieval steps. Each step calls one worker: \"sql\" for business \
         records, \"vec\" for document search, \"kg\" for the knowledge graph. \
         Steps in a stage with \"parallel\": true run concurrently. Put a step's \
         worker arguments in \"args\"; set \"when\": false to disable a step.",
    );
    if let Some(composed) = turn.str_field(fields::INTENT_COMPOSED) {
        prompt.push_str("\nInterpreted request: ");
        prompt.push_str(composed);
    }
    if let Some(slots) = turn.0.get(fields::INTENT_SLOTS) {
        if slots.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            prompt.push_str("\nExtracted slots: ");
            prompt.push_str(&slots.to_string());
        }
    }
    if include_schema_hint {
        prompt.push_str("\nRespond with a single JSON object matching this schema: ");
        prompt.push_str(&plan_schema().to_string());
        prompt.push_str("\nDo not wrap the JSON in code fences.");
    }
    prompt
}

/// Extract a plan from the model's reply: forced-tool arguments first,
/// then the message content as JSON.
fn parse_plan(message: &Message) -> Option<Plan> {
    if let Some(calls) = &message.tool_calls {
        if let Some(call) = calls.iter().find(|c| c.name == "submit_plan") {
            if let Ok(plan) = serde_json::from_value::<Plan>(call.args.clone()) {
                return Some(plan);
            }
        }
    }
    let text = message.text()?;
    // tolerate stray prose around the object
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    serde_json::from_str(&text[start..=end]).ok()
}

/// Planner node: emits `plan` and resets `stage_index`.
pub async fn run_planner(ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    let utterance = turn.last_user_text().unwrap_or_default();
    let method = ctx.settings.effective_planner_method();

    let plan = if method == PlannerMethod::Disabled {
        fallback_plan(&utterance)
    } else {
        match request_plan(&ctx, &turn, &utterance, method).await {
            Ok(plan) if plan.is_valid() => plan,
            Ok(_) => {
                warn!("planner emitted an empty plan, using keyword fallback");
                fallback_plan(&utterance)
            }
            Err(err) => {
                warn!(error = %err, "planner call failed, using keyword fallback");
                fallback_plan(&utterance)
            }
        }
    };

    if let Some(thread_id) = turn.thread_id() {
        ctx.events.trace(
            thread_id,
            "plan_ready",
            json!({
                "stages": plan.stages.len(),
                "fast_path": plan.fast_path,
            }),
        );
    }

    Ok(json!({
        fields::PLAN: serde_json::to_value(&plan).map_err(GraphError::Serde)?,
        fields::STAGE_INDEX: 0,
    }))
}

async fn request_plan(
    ctx: &AppContext,
    turn: &TurnState<'_>,
    utterance: &str,
    method: PlannerMethod,
) -> flow_core::Result<Plan> {
    let schema_hint = matches!(method, PlannerMethod::JsonMode);
    let mut messages = vec![Message::system(planner_system_prompt(turn, schema_hint))];
    messages.push(Message::human(utterance.to_string()));

    let mut request = ChatRequest::new(messages).with_temperature(0.0);
    request = match method {
        PlannerMethod::JsonSchema => request.with_response_format(ResponseFormat::JsonSchema {
            name: "plan".into(),
            schema: plan_schema(),
        }),
        PlannerMethod::JsonMode => request.with_response_format(ResponseFormat::JsonObject),
        PlannerMethod::ToolCalling => request
            .with_tools(vec![ToolDefinition {
                name: "submit_plan".into(),
                description: "Submit the retrieval plan for this request".into(),
                parameters: plan_schema(),
            }])
            .with_forced_tool("submit_plan"),
        PlannerMethod::Auto | PlannerMethod::Disabled => unreachable!("resolved by caller"),
    };

    let response = ctx.model.chat(request).await?;
    parse_plan(&response.message)
        .ok_or_else(|| GraphError::Llm("planner reply did not contain a plan".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_routes_business_lexicon_to_sql() {
        let plan = fallback_plan("Show me the latest 10 orders.");
        assert!(plan.is_valid());
        assert_eq!(plan.stages.len(), 1);
        let step = &plan.stages[0].steps[0];
        assert_eq!(step.call, WorkerCall::Sql);
        assert_eq!(step.args["table"], "order");
        assert_eq!(step.args["limit"], 10);
    }

    #[test]
    fn test_fallback_routes_kg_lexicon() {
        let plan = fallback_plan("What entities are related to ACME Corp?");
        assert_eq!(plan.stages[0].steps[0].call, WorkerCall::Kg);
    }

    #[test]
    fn test_fallback_defaults_to_vector() {
        let plan = fallback_plan("Summarize the Q3 earnings call transcript");
        assert_eq!(plan.stages[0].steps[0].call, WorkerCall::Vec);
    }

    #[test]
    fn test_plan_validation() {
        let empty = Plan {
            stages: vec![],
            fast_path: false,
        };
        assert!(!empty.is_valid());

        // all steps disabled by when=false
        let disabled: Plan = serde_json::from_value(json!({
            "stages": [{"steps": [{"call": "sql", "when": false}]}]
        }))
        .unwrap();
        assert!(!disabled.is_valid());

        let ok: Plan = serde_json::from_value(json!({
            "stages": [{"parallel": true, "steps": [
                {"call": "sql", "args": {"table": "order", "fields": ["*"]}},
                {"call": "vec", "args": {"query": "orders"}}
            ]}]
        }))
        .unwrap();
        assert!(ok.is_valid());
        assert_eq!(ok.stages[0].dispatch_count(), 2);
    }

    #[test]
    fn test_dispatch_count_sequential_stage() {
        let stage: Stage = serde_json::from_value(json!({
            "parallel": false,
            "steps": [
                {"call": "sql"},
                {"call": "vec"}
            ]
        }))
        .unwrap();
        assert_eq!(stage.dispatch_count(), 1);
    }

    #[test]
    fn test_parse_plan_from_content() {
        let message = Message::assistant(
            r#"Here is the plan: {"stages": [{"parallel": false, "steps": [{"call": "vec", "args": {"query": "q"}}]}]}"#,
        );
        let plan = parse_plan(&message).unwrap();
        assert_eq!(plan.stages[0].steps[0].call, WorkerCall::Vec);
    }

    #[test]
    fn test_parse_plan_from_forced_tool() {
        let message = Message::assistant("").with_tool_calls(vec![flow_core::ToolCall {
            id: "c1".into(),
            name: "submit_plan".into(),
            args: json!({"stages": [{"steps": [{"call": "kg"}]}]}),
        }]);
        let plan = parse_plan(&message).unwrap();
        assert_eq!(plan.stages[0].steps[0].call, WorkerCall::Kg);
    }

    #[test]
    fn test_step_when_defaults_true() {
        let step: Step = serde_json::from_value(json!({"call": "sql"})).unwrap();
        assert!(step.when);
    }
}
