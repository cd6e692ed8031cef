//! The request adapter: everything the evaluator may read from an HTTP
//! request, provided by the embedder.
//!
//! The adapter is plain data. POST values may be arrays (multi-selects
//! submit repeated keys); `session` is opaque and only reachable through
//! [`RequestAdapter::session`]; `answers` and `data` seed the per-request
//! evaluation context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use rustc_hash::FxHashMap;

/// Where an answer mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationSource {
    Load,
    Access,
    Action,
    Submit,
    Post,
}

/// One entry in a field's mutation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    pub value: Value,
    pub source: MutationSource,
}

/// A field's answer: the current value plus the append-only mutation log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerEntry {
    pub current: Value,
    #[serde(default)]
    pub mutations: Vec<Mutation>,
}

impl AnswerEntry {
    pub fn with_current(value: Value) -> Self {
        Self {
            current: value,
            mutations: Vec::new(),
        }
    }
}

/// Answers keyed by field code.
pub type AnswerMap = FxHashMap<String, AnswerEntry>;

/// Per-request input to the evaluator.
#[derive(Debug, Clone, Default)]
pub struct RequestAdapter {
    /// Raw submitted values; entries may be arrays.
    pub post: Map<String, Value>,
    /// Query-string parameters.
    pub query: Map<String, Value>,
    /// URL path parameters.
    pub params: Map<String, Value>,
    /// Per-request derived state (csrf token and the like).
    pub state: Map<String, Value>,
    /// Answers loaded from the embedder's store at request start.
    pub answers: AnswerMap,
    /// Request data seeded by the embedder (extended by onLoad effects).
    pub data: Map<String, Value>,
    session: Value,
}

impl RequestAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opaque session payload; only exposed through this accessor.
    pub fn session(&self) -> &Value {
        &self.session
    }

    pub fn with_session(mut self, session: Value) -> Self {
        self.session = session;
        self
    }

    pub fn with_post(mut self, key: impl Into<String>, value: Value) -> Self {
        self.post.insert(key.into(), value);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: Value) -> Self {
        self.query.insert(key.into(), value);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }

    pub fn with_answer(mut self, code: impl Into<String>, current: Value) -> Self {
        self.answers
            .insert(code.into(), AnswerEntry::with_current(current));
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_accumulates_request_parts() {
        let request = RequestAdapter::new()
            .with_post("email", json!("x@y.z"))
            .with_query("page", json!("2"))
            .with_param("id", json!("abc"))
            .with_answer("name", json!("Tom"))
            .with_session(json!({"user": "u1"}));

        assert_eq!(request.post["email"], json!("x@y.z"));
        assert_eq!(request.query["page"], json!("2"));
        assert_eq!(request.params["id"], json!("abc"));
        assert_eq!(request.answers["name"].current, json!("Tom"));
        assert_eq!(request.session()["user"], json!("u1"));
    }

    #[test]
    fn answer_entry_serialization_shape() {
        let entry = AnswerEntry {
            current: json!("10 Downing St"),
            mutations: vec![Mutation {
                value: json!("10 Downing St"),
                source: MutationSource::Action,
            }],
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["current"], "10 Downing St");
        assert_eq!(json["mutations"][0]["source"], "action");
    }
}
