//! Guardrails for runtime evaluation.
//!
//! Form definitions are authored data, so the evaluator bounds the work a
//! single request can trigger: iterate fan-out, pipeline depth, invocation
//! recursion, and overlay growth. Exceeding a limit is a handler error, not
//! a panic.

/// Evaluation limits, applied per request.
#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Maximum number of items a single iterate expression may expand.
    pub max_iterate_items: usize,

    /// Maximum number of steps in a single pipeline.
    pub max_pipeline_steps: usize,

    /// Maximum handler invocation depth (guards cyclic runtime wiring).
    pub max_invoke_depth: usize,

    /// Maximum number of runtime nodes a request may materialize through
    /// overlays.
    pub max_overlay_nodes: usize,

    /// Maximum length of a dynamically computed reference key.
    pub max_dynamic_key_len: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_iterate_items: 1_000,
            max_pipeline_steps: 64,
            max_invoke_depth: 128,
            max_overlay_nodes: 10_000,
            max_dynamic_key_len: 256,
        }
    }
}

impl EngineLimits {
    /// Restrictive limits for tests.
    pub fn strict() -> Self {
        Self {
            max_iterate_items: 20,
            max_pipeline_steps: 8,
            max_invoke_depth: 32,
            max_overlay_nodes: 200,
            max_dynamic_key_len: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_generous() {
        let limits = EngineLimits::default();
        assert!(limits.max_iterate_items >= 1_000);
        assert!(limits.max_invoke_depth >= 64);
    }

    #[test]
    fn strict_is_tighter_than_default() {
        let strict = EngineLimits::strict();
        let default = EngineLimits::default();
        assert!(strict.max_iterate_items < default.max_iterate_items);
        assert!(strict.max_overlay_nodes < default.max_overlay_nodes);
    }
}
