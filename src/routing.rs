//! Routing identifier parsing for inbound tool-call paths
//!
//! Accepted shapes:
//!
//! ```text
//! /{deployment}/{tool}
//! /@{consumer}/{deployment}/{tool}
//! ```
//!
//! A trailing slash and a query string are ignored.
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::error::GatewayError;

static SEGMENT_PATTERN: OnceLock<Regex> = OnceLock::new();

fn segment_pattern() -> &'static Regex {
    SEGMENT_PATTERN.get_or_init(|| {
        Regex::new("^[A-Za-z0-9._-]+$").expect("segment pattern is a valid regex")
    })
}

/// Parsed `{deployment, tool, consumer?}` triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingIdentifier {
    deployment_id: String,
    tool_name: String,
    consumer_slug: Option<String>,
}

impl RoutingIdentifier {
    /// Parse the identifier out of a request path (query string allowed)
    pub fn parse(path: &str) -> Result<Self, GatewayError> {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        let trimmed = path
            .strip_prefix('/')
            .ok_or_else(|| malformed(path, "path must start with '/'"))?;
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

        let segments: Vec<&str> = trimmed.split('/').collect();
        let (consumer, rest) = match segments.first() {
            Some(first) if first.starts_with('@') => (Some(&first[1..]), &segments[1..]),
            _ => (None, &segments[..]),
        };

        let [deployment, tool] = rest else {
            return Err(malformed(
                path,
                "expected /{deployment}/{tool} or /@{consumer}/{deployment}/{tool}",
            ));
        };

        for (name, value) in [("deployment", *deployment), ("tool", *tool)]
            .into_iter()
            .chain(consumer.map(|c| ("consumer", c)))
        {
            if !segment_pattern().is_match(value) {
                return Err(malformed(path, &format!("invalid {} segment '{}'", name, value)));
            }
        }

        Ok(Self {
            deployment_id: deployment.to_string(),
            tool_name: tool.to_string(),
            consumer_slug: consumer.map(str::to_string),
        })
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn consumer_slug(&self) -> Option<&str> {
        self.consumer_slug.as_deref()
    }
}

impl fmt::Display for RoutingIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(consumer) = &self.consumer_slug {
            write!(f, "/@{}", consumer)?;
        }
        write!(f, "/{}/{}", self.deployment_id, self.tool_name)
    }
}

fn malformed(path: &str, reason: &str) -> GatewayError {
    GatewayError::MalformedRequest(format!("{}: {}", reason, path))
}
