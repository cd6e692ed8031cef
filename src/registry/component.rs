//! Component registry: block variant → renderer.
//!
//! Consulted by the template layer only; the core never calls `render`.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::registry::RegistryError;

/// Renderer for an evaluated block: the view-model JSON in, markup out.
pub type RenderFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// One registered component variant.
#[derive(Clone)]
pub struct ComponentSpec {
    pub variant: String,
    render: RenderFn,
}

impl ComponentSpec {
    pub fn new<F>(variant: impl Into<String>, render: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        Self {
            variant: variant.into(),
            render: Arc::new(render),
        }
    }

    pub fn render(&self, evaluated_block: &Value) -> String {
        (self.render)(evaluated_block)
    }
}

impl fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentSpec")
            .field("variant", &self.variant)
            .finish()
    }
}

/// Variant → renderer mapping.
#[derive(Default)]
pub struct ComponentRegistry {
    entries: DashMap<String, ComponentSpec>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: ComponentSpec) -> Result<(), RegistryError> {
        if spec.variant.trim().is_empty() {
            return Err(RegistryError::Invalid {
                message: "component variant is empty".into(),
            });
        }
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(spec.variant.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateComponent {
                variant: spec.variant,
            }),
            Entry::Vacant(slot) => {
                slot.insert(spec);
                Ok(())
            }
        }
    }

    pub fn get(&self, variant: &str) -> Option<ComponentSpec> {
        self.entries.get(variant).map(|entry| entry.value().clone())
    }

    pub fn has(&self, variant: &str) -> bool {
        self.entries.contains_key(variant)
    }

    /// All registered variant names.
    pub fn variants(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
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

    #[test]
    fn register_and_render() {
        let registry = ComponentRegistry::new();
        registry
            .register(ComponentSpec::new("text-input", |block| {
                format!("<input name=\"{}\">", block["properties"]["code"].as_str().unwrap_or(""))
            }))
            .unwrap();

        let spec = registry.get("text-input").unwrap();
        let html = spec.render(&json!({"properties": {"code": "email"}}));
        assert_eq!(html, "<input name=\"email\">");
    }

    #[test]
    fn duplicate_variant_is_rejected() {
        let registry = ComponentRegistry::new();
        registry
            .register(ComponentSpec::new("radios", |_| String::new()))
            .unwrap();

        let err = registry
            .register(ComponentSpec::new("radios", |_| String::new()))
            .unwrap_err();
        assert!(err.to_string().contains("radios"));
    }

    #[test]
    fn variants_enumerate_sorted() {
        let registry = ComponentRegistry::new();
        registry
            .register(ComponentSpec::new("radios", |_| String::new()))
            .unwrap();
        registry
            .register(ComponentSpec::new("date-input", |_| String::new()))
            .unwrap();

        assert_eq!(registry.variants(), vec!["date-input", "radios"]);
    }
}
