//! Domain records owned by the external store and cached by the gateway
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Slug of the plan every unknown plan falls back to
pub const FREE_PLAN_SLUG: &str = "free";

/// Id of the consumer behind requests without a consumer segment. Routing
/// slugs cannot contain '@', so no stored consumer is reachable under it.
pub const ANONYMOUS_CONSUMER_ID: &str = "@anonymous";

/// A configured set of origin tools reachable under one routing id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Routing id
    pub id: String,
    /// Revision of the tool definitions; part of every schema cache key
    #[serde(default = "default_version")]
    pub version: String,
    /// Base URL tool calls are sent to (`{origin_base_url}/{tool}`)
    pub origin_base_url: String,
    /// Tool definitions by tool name
    #[serde(default)]
    pub tools: HashMap<String, ToolDefinition>,
    /// Total dispatch budget for one tool call
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Deployment {
    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn timeout_budget(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// A single tool exposed by a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, also the last path segment on the origin
    pub name: String,
    /// Human readable description
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema for the call arguments; absent means any JSON is accepted
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
}

/// An authenticated caller bound to a pricing plan.
///
/// Live usage counters are not part of this record: the rate limiter owns them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
    pub id: String,
    #[serde(default = "default_plan_slug")]
    pub plan_slug: String,
}

impl Consumer {
    /// Consumer used for requests that carry no consumer segment
    pub fn anonymous() -> Self {
        Self {
            id: ANONYMOUS_CONSUMER_ID.to_string(),
            plan_slug: FREE_PLAN_SLUG.to_string(),
        }
    }
}

/// Request ceilings for one plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPlan {
    pub slug: String,
    pub requests_per_minute: u64,
    pub requests_per_day: u64,
}

impl PricingPlan {
    /// Built-in limits used when the store knows no "free" plan
    pub fn free() -> Self {
        Self {
            slug: FREE_PLAN_SLUG.to_string(),
            requests_per_minute: 10,
            requests_per_day: 100,
        }
    }
}

impl Default for PricingPlan {
    fn default() -> Self {
        Self::free()
    }
}

fn default_version() -> String {
    "0".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_plan_slug() -> String {
    FREE_PLAN_SLUG.to_string()
}
