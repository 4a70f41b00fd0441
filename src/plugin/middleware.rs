//! Per-endpoint request middleware
//!
//! Endpoints may declare a request quota and validation rules in their
//! manifest. Both are checked by the dispatch path before the plugin is
//! invoked, so a rejected request never reaches plugin code. Quotas are
//! kept per bound route; rebinding a route (reload) starts a fresh window.

use crate::core::error::{PluginError, PluginResult};
use crate::plugin::api::PluginRequest;
use crate::plugin::manifest::{EndpointSpec, RateLimitSpec, ValidationSpec};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Callers without a forwarding header share this quota bucket
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Sliding-window limiter keyed by caller
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(spec: &RateLimitSpec) -> Self {
        Self {
            window: Duration::from_millis(spec.window_ms),
            max_requests: spec.requests as usize,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request from `key`, or report how long until a slot frees up
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let stamps = entries.entry(key.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            stamps.pop_front();
        }

        if stamps.len() >= self.max_requests {
            let oldest = stamps.front().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now.duration_since(oldest)));
        }
        stamps.push_back(now);
        Ok(())
    }

    /// Drop callers with no request inside the window
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, stamps| {
            stamps.retain(|t| now.duration_since(*t) < self.window);
            !stamps.is_empty()
        });
    }

    fn callers(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Quota and validation attached to one bound route
#[derive(Debug, Default)]
pub struct EndpointPolicy {
    limiter: Option<RateLimiter>,
    validation: Option<ValidationSpec>,
}

impl EndpointPolicy {
    pub fn for_endpoint(endpoint: &EndpointSpec) -> Self {
        Self {
            limiter: endpoint.rate_limit.as_ref().map(RateLimiter::new),
            validation: endpoint.validation.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.limiter.is_none() && self.validation.is_none()
    }

    /// Check quota first, then the request rules
    pub fn admit(&self, route: &str, request: &PluginRequest) -> PluginResult<()> {
        if let Some(limiter) = &self.limiter {
            if let Err(wait) = limiter.check(&caller_key(request)) {
                // Round up so callers never retry too early
                let retry_after_secs = wait.as_millis().div_ceil(1000).max(1) as u64;
                return Err(PluginError::RateLimited {
                    route: route.to_string(),
                    retry_after_secs,
                });
            }
            if limiter.callers() > 1024 {
                limiter.cleanup();
            }
        }
        match &self.validation {
            Some(rules) => validate_request(rules, request),
            None => Ok(()),
        }
    }
}

/// First `x-forwarded-for` hop, then `x-real-ip`
fn caller_key(request: &PluginRequest) -> String {
    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    };
    header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .or_else(|| header("x-real-ip"))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .unwrap_or(ANONYMOUS_CALLER)
        .to_string()
}

fn validate_request(rules: &ValidationSpec, request: &PluginRequest) -> PluginResult<()> {
    if !rules.content_types.is_empty() {
        let content_type = request
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.to_ascii_lowercase())
            .unwrap_or_default();
        if !rules
            .content_types
            .iter()
            .any(|accepted| content_type.contains(accepted.as_str()))
        {
            return Err(PluginError::InvalidRequest(format!(
                "content type must be one of {}",
                rules.content_types.join(", ")
            )));
        }
    }

    if !rules.required.is_empty() {
        let Value::Object(body) = &request.body else {
            return Err(PluginError::InvalidRequest(
                "body must be a JSON object".to_string(),
            ));
        };
        if let Some(missing) = rules.required.iter().find(|field| !body.contains_key(*field)) {
            return Err(PluginError::InvalidRequest(format!(
                "required field '{missing}' is missing"
            )));
        }
    }
    Ok(())
}
