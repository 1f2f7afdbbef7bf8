//! Types for talking to bridgestrap, the external reachability tester.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A batch of bridge lines to test.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TesterRequest {
    pub bridge_lines: Vec<String>,
}

/// The tester's verdict for a single bridge line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TesterResult {
    pub functional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The tester's response for a whole batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TesterResponse {
    #[serde(default)]
    pub bridge_results: HashMap<String, TesterResult>,
    #[serde(default)]
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
