//! Tollgate - edge gateway for tool-calling deployments
//!
//! Tollgate sits in front of deployed tool origins and, on Cloudflare's
//! Pingora framework, provides:
//! - Routing of `/{deployment}/{tool}` and `/@{consumer}/{deployment}/{tool}` paths
//! - Single-flight lookup caches for deployments, consumers, plans and schemas
//! - Per-plan minute and day rate limits
//! - JSON Schema validation of tool arguments
//! - Pooled origin dispatch with deadlines, retries and streamed bodies
//! - Prometheus metrics and structured access records

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod origin;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod routing;
pub mod schema;
pub mod store;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use cache::{CacheStatus, LookupCache};
pub use config::*;
pub use dispatcher::{Dispatcher, RetryPolicy};
pub use error::{GatewayError, StoreError, UpstreamFault};
pub use gateway::{RequestContext, ToolGateway};
pub use metrics::MetricsCollector;
pub use model::{Consumer, Deployment, PricingPlan, ToolDefinition};
pub use pipeline::{GatewayResponse, InboundRequest, ResolutionPipeline};
pub use rate_limit::RateLimiter;
pub use routing::RoutingIdentifier;
pub use schema::SchemaRegistry;
pub use store::{InMemoryStore, Store};
