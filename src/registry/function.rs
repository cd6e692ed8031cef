//! Function registry: named conditions, transformers, effects, generators.
//!
//! Functions are registered by the embedder (or its plug-ins) and looked up
//! by `(kind, name)`. A spec carries an `is_async` flag consumed by the
//! thunk compiler's bottom-up async pass; sync functions keep whole
//! expression subtrees on the fast path.
//!
//! Sync functions register as plain closures via [`FunctionSpec::sync`].
//! Async functions implement [`NativeFunction`] (an async-trait object,
//! like any other pluggable backend) and register via
//! [`FunctionSpec::asynchronous`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::eval::EffectScope;
use crate::node::FunctionKind;
use crate::registry::RegistryError;

/// Arguments (and, for effects, the mutation handle) passed to a registered
/// function.
pub struct FunctionCall<'a> {
    pub args: Vec<Value>,
    /// Present only when an effect is being committed.
    pub effects: Option<EffectScope<'a>>,
}

impl<'a> FunctionCall<'a> {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            effects: None,
        }
    }

    pub fn with_effects(args: Vec<Value>, effects: EffectScope<'a>) -> Self {
        Self {
            args,
            effects: Some(effects),
        }
    }

    /// Argument at `index`, null when absent.
    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&Value::Null)
    }
}

/// An executable function body. Implement this directly for async
/// functions; sync closures get adapted by [`FunctionSpec::sync`].
#[async_trait]
pub trait NativeFunction: Send + Sync {
    /// Sync entry point. Only invoked for functions registered as sync.
    fn call_sync(&self, _call: FunctionCall<'_>) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("function has no sync path"))
    }

    /// Async entry point; defaults to the sync body.
    async fn call(&self, call: FunctionCall<'_>) -> anyhow::Result<Value> {
        self.call_sync(call)
    }
}

/// Adapter wrapping a sync closure as a [`NativeFunction`].
struct SyncFn<F>(F);

#[async_trait]
impl<F> NativeFunction for SyncFn<F>
where
    F: Fn(FunctionCall<'_>) -> anyhow::Result<Value> + Send + Sync,
{
    fn call_sync(&self, call: FunctionCall<'_>) -> anyhow::Result<Value> {
        (self.0)(call)
    }
}

/// One registered function.
#[derive(Clone)]
pub struct FunctionSpec {
    pub kind: FunctionKind,
    pub name: String,
    is_async: bool,
    body: Arc<dyn NativeFunction>,
}

impl FunctionSpec {
    /// Register a synchronous function body.
    pub fn sync<F>(kind: FunctionKind, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(FunctionCall<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            kind,
            name: name.into(),
            is_async: false,
            body: Arc::new(SyncFn(body)),
        }
    }

    /// Register an asynchronous function body.
    pub fn asynchronous(
        kind: FunctionKind,
        name: impl Into<String>,
        body: impl NativeFunction + 'static,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            is_async: true,
            body: Arc::new(body),
        }
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Invoke on the sync path. Callers must have checked `is_async` first;
    /// the thunk compiler guarantees this at evaluation time.
    pub fn call_sync(&self, call: FunctionCall<'_>) -> anyhow::Result<Value> {
        if self.is_async {
            return Err(anyhow::anyhow!(
                "function '{}' is async and cannot run on the sync path",
                self.name
            ));
        }
        self.body.call_sync(call)
    }

    pub async fn call(&self, call: FunctionCall<'_>) -> anyhow::Result<Value> {
        self.body.call(call).await
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("is_async", &self.is_async)
            .finish()
    }
}

/// Process-wide function catalogue, keyed `(kind, name)`.
#[derive(Default, Debug)]
pub struct FunctionRegistry {
    entries: DashMap<(FunctionKind, String), Arc<FunctionSpec>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one function. Duplicates are rejected.
    pub fn register(&self, spec: FunctionSpec) -> Result<(), RegistryError> {
        if spec.name.trim().is_empty() {
            return Err(RegistryError::Invalid {
                message: "function name is empty".into(),
            });
        }
        let key = (spec.kind, spec.name.clone());
        // Entry API keeps check-and-insert atomic.
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateFunction {
                kind: spec.kind,
                name: spec.name,
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(spec));
                Ok(())
            }
        }
    }

    /// Register a batch, collecting every failure instead of stopping at the
    /// first.
    pub fn register_many(
        &self,
        specs: impl IntoIterator<Item = FunctionSpec>,
    ) -> Result<(), RegistryError> {
        let mut errors = Vec::new();
        for spec in specs {
            if let Err(err) = self.register(spec) {
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Aggregate { errors })
        }
    }

    pub fn get(&self, kind: FunctionKind, name: &str) -> Option<Arc<FunctionSpec>> {
        self.entries
            .get(&(kind, name.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn has(&self, kind: FunctionKind, name: &str) -> bool {
        self.entries.contains_key(&(kind, name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trim_spec() -> FunctionSpec {
        FunctionSpec::sync(FunctionKind::Transformer, "trim", |call| {
            Ok(match call.arg(0) {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other.clone(),
            })
        })
    }

    #[test]
    fn register_and_call_sync() {
        let registry = FunctionRegistry::new();
        registry.register(trim_spec()).unwrap();

        let spec = registry.get(FunctionKind::Transformer, "trim").unwrap();
        assert!(!spec.is_async());

        let result = spec
            .call_sync(FunctionCall::new(vec![json!("  tom  ")]))
            .unwrap();
        assert_eq!(result, json!("tom"));
    }

    #[test]
    fn duplicates_are_rejected() {
        let registry = FunctionRegistry::new();
        registry.register(trim_spec()).unwrap();

        let err = registry.register(trim_spec()).unwrap_err();
        assert!(err.to_string().contains("FF-013"));
        assert!(err.to_string().contains("trim"));
    }

    #[test]
    fn same_name_different_kind_is_allowed() {
        let registry = FunctionRegistry::new();
        registry.register(trim_spec()).unwrap();
        registry
            .register(FunctionSpec::sync(FunctionKind::Condition, "trim", |_| {
                Ok(json!(true))
            }))
            .unwrap();

        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn register_many_aggregates_errors() {
        let registry = FunctionRegistry::new();
        let result = registry.register_many(vec![
            trim_spec(),
            trim_spec(),
            FunctionSpec::sync(FunctionKind::Generator, "", |_| Ok(Value::Null)),
        ]);

        match result {
            Err(RegistryError::Aggregate { errors }) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn async_function_roundtrip() {
        struct Today;

        #[async_trait]
        impl NativeFunction for Today {
            async fn call(&self, _call: FunctionCall<'_>) -> anyhow::Result<Value> {
                Ok(json!("2026-01-01"))
            }
        }

        let registry = FunctionRegistry::new();
        registry
            .register(FunctionSpec::asynchronous(
                FunctionKind::Generator,
                "today",
                Today,
            ))
            .unwrap();

        let spec = registry.get(FunctionKind::Generator, "today").unwrap();
        assert!(spec.is_async());
        let value = spec.call(FunctionCall::new(vec![])).await.unwrap();
        assert_eq!(value, json!("2026-01-01"));

        // The sync path refuses async bodies.
        assert!(spec.call_sync(FunctionCall::new(vec![])).is_err());
    }
}
