//! ABAC conditions attached to tuples.
//!
//! A conditional tuple only grants when the caller's [`CheckContext`]
//! satisfies every predicate present. No context means no grant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    /// Exact addresses, or prefixes ending in `.` / `:` (e.g. `"10.0."`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<String>,
    /// Each key must be present in the context with an equal value.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Request-time attributes evaluated against tuple conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckContext {
    /// Evaluation time; `None` uses the current time.
    pub now: Option<DateTime<Utc>>,
    pub client_ip: Option<String>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl CheckContext {
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

impl Conditions {
    pub fn is_empty(&self) -> bool {
        self.time_window.is_none() && self.allowed_ips.is_empty() && self.attributes.is_empty()
    }

    /// Whether `context` satisfies every predicate.
    pub fn evaluate(&self, context: Option<&CheckContext>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(context) = context else {
            return false;
        };

        if let Some(window) = &self.time_window {
            let now = context.now.unwrap_or_else(Utc::now);
            if window.start.is_some_and(|start| now < start) {
                return false;
            }
            if window.end.is_some_and(|end| now >= end) {
                return false;
            }
        }

        if !self.allowed_ips.is_empty() {
            let Some(ip) = context.client_ip.as_deref() else {
                return false;
            };
            if !self.allowed_ips.iter().any(|allowed| ip_matches(allowed, ip)) {
                return false;
            }
        }

        self.attributes
            .iter()
            .all(|(key, want)| context.attributes.get(key) == Some(want))
    }
}

fn ip_matches(allowed: &str, ip: &str) -> bool {
    if allowed.ends_with('.') || allowed.ends_with(':') {
        ip.starts_with(allowed)
    } else {
        allowed == ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn empty_conditions_always_pass() {
        assert!(Conditions::default().evaluate(None));
    }

    #[test]
    fn missing_context_fails_closed() {
        let c = Conditions {
            allowed_ips: vec!["10.0.".into()],
            ..Default::default()
        };
        assert!(!c.evaluate(None));
    }

    #[test]
    fn time_window_bounds() {
        let now = Utc::now();
        let c = Conditions {
            time_window: Some(TimeWindow {
                start: Some(now - Duration::hours(1)),
                end: Some(now + Duration::hours(1)),
            }),
            ..Default::default()
        };
        assert!(c.evaluate(Some(&CheckContext::default().at(now))));
        assert!(!c.evaluate(Some(&CheckContext::default().at(now + Duration::hours(2)))));
        assert!(!c.evaluate(Some(&CheckContext::default().at(now - Duration::hours(2)))));
    }

    #[test]
    fn ip_prefix_and_exact() {
        let c = Conditions {
            allowed_ips: vec!["10.0.".into(), "192.168.1.7".into()],
            ..Default::default()
        };
        assert!(c.evaluate(Some(&CheckContext::default().with_ip("10.0.3.4"))));
        assert!(c.evaluate(Some(&CheckContext::default().with_ip("192.168.1.7"))));
        assert!(!c.evaluate(Some(&CheckContext::default().with_ip("192.168.1.70"))));
        assert!(!c.evaluate(Some(&CheckContext::default())));
    }

    #[test]
    fn attributes_must_all_match() {
        let c: Conditions =
            serde_json::from_value(json!({"attributes": {"device": "managed", "mfa": true}}))
                .unwrap();
        let ok = CheckContext::default()
            .with_attribute("device", json!("managed"))
            .with_attribute("mfa", json!(true));
        assert!(c.evaluate(Some(&ok)));
        let partial = CheckContext::default().with_attribute("device", json!("managed"));
        assert!(!c.evaluate(Some(&partial)));
    }
}
