//! NodeFactory: turns the tagged-JSON definition tree into typed AST nodes.
//!
//! Detection rules: an object carrying `expressionType`, `predicateType`,
//! `transitionType`, or `outcomeType` is always a definition (an unknown tag
//! value there is a hard error). An object whose `type` is `journey`, `step`
//! or `block` is a structural definition; any other `type` value is plain
//! data and passes through untouched, so display properties may freely use
//! a `type` key of their own.
//!
//! Iterator templates (`MAP.yield`, `FILTER.predicate`, `FIND.predicate`)
//! are deliberately NOT compiled here: they stay as raw JSON and are
//! instantiated per item by the runtime overlay, so `@item` references
//! resolve against the iteration scope.

use serde_json::Value;

use crate::error::CompileError;
use crate::node::{
    AstNode, BlockNode, BlockType, ExprNode, FunctionKind, IteratorKind, JourneyNode, NodeId,
    NodeIdGenerator, NodeKind, OutcomeNode, PathSegment, PredicateNode, PropValue, PropertyMap,
    StepNode, SubmitBranch, TransitionNode,
};

/// A node produced by the factory, waiting to be registered.
#[derive(Debug)]
pub struct CreatedNode {
    pub node: AstNode,
    pub path: String,
    pub parent: Option<NodeId>,
}

/// Recursive transformer from definition JSON to typed nodes.
///
/// The factory only creates; registration happens in a separate pass so the
/// registry can enforce id uniqueness over the whole batch.
pub struct NodeFactory<'a> {
    ids: &'a NodeIdGenerator,
    created: Vec<CreatedNode>,
}

impl<'a> NodeFactory<'a> {
    pub fn new(ids: &'a NodeIdGenerator) -> Self {
        Self {
            ids,
            created: Vec::new(),
        }
    }

    /// Everything created so far, in creation order.
    pub fn into_created(self) -> Vec<CreatedNode> {
        self.created
    }

    /// Entry point: the root of a definition tree must be a journey.
    pub fn create_journey(&mut self, def: &Value) -> Result<NodeId, CompileError> {
        match tag_of(def) {
            Some(Tag::Structural("journey")) => self.create_node(def, "journey", None),
            _ => Err(CompileError::invalid(
                "journey",
                "definition root must be a journey",
            )),
        }
    }

    /// Transform an arbitrary property value: tagged definitions become
    /// child nodes, arrays map element-wise, anything else passes through.
    pub fn transform_value(
        &mut self,
        value: &Value,
        path: &str,
        parent: Option<NodeId>,
    ) -> Result<PropValue, CompileError> {
        if tag_of(value).is_some() {
            return Ok(PropValue::Node(self.create_node(value, path, parent)?));
        }
        if let Value::Array(items) = value {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(self.transform_value(item, &format!("{path}[{i}]"), parent)?);
            }
            return Ok(PropValue::List(out));
        }
        Ok(PropValue::Literal(value.clone()))
    }

    /// Transform a tagged definition into a node, registering it in the
    /// created list. Errors carry the structural path as a breadcrumb.
    pub fn create_node(
        &mut self,
        def: &Value,
        path: &str,
        parent: Option<NodeId>,
    ) -> Result<NodeId, CompileError> {
        let tag = tag_of(def).ok_or_else(|| {
            CompileError::invalid(path, "expected a tagged node definition")
        })?;

        let id = self.ids.ast_id();
        let kind = match tag {
            Tag::Structural("journey") => self.journey(def, path, id)?,
            Tag::Structural("step") => self.step(def, path, id)?,
            Tag::Structural("block") => self.block(def, path, id)?,
            Tag::Structural(other) => {
                return Err(CompileError::UnknownNodeType {
                    path: path.to_string(),
                    found: other.to_string(),
                })
            }
            Tag::Expression(name) => self.expression(name, def, path, id)?,
            Tag::Predicate(name) => self.predicate(name, def, path, id)?,
            Tag::Transition(name) => self.transition(name, def, path, id)?,
            Tag::Outcome(name) => self.outcome(name, def, path, id)?,
        };

        self.created.push(CreatedNode {
            node: AstNode {
                id,
                kind,
                raw: def.clone(),
            },
            path: path.to_string(),
            parent,
        });
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Structural factories
    // ------------------------------------------------------------------

    fn journey(&mut self, def: &Value, path: &str, id: NodeId) -> Result<NodeKind, CompileError> {
        let journey_path = require_str(def, "path", path)?;
        let steps = self.node_list(def, "steps", path, id)?;
        if steps.is_empty() {
            return Err(CompileError::invalid(path, "journey has no steps"));
        }
        let on_load = self.optional_node(def, "onLoad", path, id)?;
        let on_access = self.node_list(def, "onAccess", path, id)?;
        let properties = self.rest_properties(
            def,
            &["type", "path", "steps", "onLoad", "onAccess"],
            path,
            id,
        )?;

        Ok(NodeKind::Journey(JourneyNode {
            path: journey_path,
            steps,
            on_load,
            on_access,
            properties,
        }))
    }

    fn step(&mut self, def: &Value, path: &str, id: NodeId) -> Result<NodeKind, CompileError> {
        let step_path = require_str(def, "path", path)?;
        let blocks = self.node_list(def, "blocks", path, id)?;
        let next = self.node_list(def, "next", path, id)?;
        let on_load = self.optional_node(def, "onLoad", path, id)?;
        let on_access = self.node_list(def, "onAccess", path, id)?;
        let on_action = self.node_list(def, "onAction", path, id)?;
        let on_submission = self.node_list(def, "onSubmission", path, id)?;
        let properties = self.rest_properties(
            def,
            &[
                "type",
                "path",
                "blocks",
                "next",
                "onLoad",
                "onAccess",
                "onAction",
                "onSubmission",
            ],
            path,
            id,
        )?;

        Ok(NodeKind::Step(StepNode {
            path: step_path,
            blocks,
            next,
            on_load,
            on_access,
            on_action,
            on_submission,
            properties,
        }))
    }

    fn block(&mut self, def: &Value, path: &str, id: NodeId) -> Result<NodeKind, CompileError> {
        let block_type = match get_str(def, "blockType") {
            Some("field") => BlockType::Field,
            Some("basic") | None => BlockType::Basic,
            Some(other) => {
                return Err(CompileError::UnknownNodeType {
                    path: format!("{path}.blockType"),
                    found: other.to_string(),
                })
            }
        };
        let variant = require_str(def, "variant", path)?;

        let code = get_str(def, "code").map(str::to_string);
        if block_type == BlockType::Field && code.is_none() {
            return Err(CompileError::invalid(path, "field block requires a code"));
        }

        let default_value = match def.get("defaultValue") {
            Some(v) => Some(self.transform_value(v, &format!("{path}.defaultValue"), Some(id))?),
            None => None,
        };

        // Raw formatter definitions are preserved verbatim; the formatters
        // normalizer derives the format pipeline from them.
        let formatters = match def.get("formatters") {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(CompileError::invalid(
                    format!("{path}.formatters"),
                    "formatters must be a list",
                ))
            }
            None => Vec::new(),
        };

        let validate = self.node_list(def, "validate", path, id)?;
        let dependent = match def.get("dependent") {
            Some(v) => Some(self.transform_value(v, &format!("{path}.dependent"), Some(id))?),
            None => None,
        };
        let multiple = def
            .get("multiple")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let blocks = self.node_list(def, "blocks", path, id)?;

        let properties = self.rest_properties(
            def,
            &[
                "type",
                "blockType",
                "variant",
                "code",
                "defaultValue",
                "formatters",
                "validate",
                "dependent",
                "multiple",
                "blocks",
            ],
            path,
            id,
        )?;

        Ok(NodeKind::Block(BlockNode {
            block_type,
            variant,
            code,
            default_value,
            formatters,
            format_pipeline: None,
            validate,
            dependent,
            multiple,
            blocks,
            properties,
        }))
    }

    // ------------------------------------------------------------------
    // Expression factories
    // ------------------------------------------------------------------

    fn expression(
        &mut self,
        name: &str,
        def: &Value,
        path: &str,
        id: NodeId,
    ) -> Result<NodeKind, CompileError> {
        let expr = match name {
            "reference" => self.reference(def, path, id)?,
            "pipeline" => {
                let input = self.required_value(def, "input", path, id)?;
                let steps = self.node_list(def, "steps", path, id)?;
                ExprNode::Pipeline { input, steps }
            }
            "format" => {
                let template = require_str(def, "template", path)?;
                let arguments = self.value_list(def, "arguments", path, id)?;
                ExprNode::Format {
                    template,
                    arguments,
                }
            }
            "iterate" => {
                let input = self.required_value(def, "input", path, id)?;
                let iterator = iterator_of(def, path)?;
                ExprNode::Iterate { input, iterator }
            }
            "conditional" => {
                let predicate = self.required_value(def, "predicate", path, id)?;
                let then_value = self.optional_value(def, "thenValue", path, id)?;
                let else_value = self.optional_value(def, "elseValue", path, id)?;
                ExprNode::Conditional {
                    predicate,
                    then_value,
                    else_value,
                }
            }
            "next" => {
                let when = self.optional_node(def, "when", path, id)?;
                let goto = self.required_value(def, "goto", path, id)?;
                ExprNode::Next { when, goto }
            }
            "validation" => {
                let when = self.required_node(def, "when", path, id)?;
                let message = self.required_value(def, "message", path, id)?;
                let submission_only = def
                    .get("submissionOnly")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let details = def.get("details").cloned();
                ExprNode::Validation {
                    when,
                    message,
                    submission_only,
                    details,
                    block_code: None,
                }
            }
            tag => {
                // The four function categories share the expression tag space.
                let kind = FunctionKind::from_tag(tag).ok_or_else(|| {
                    CompileError::UnknownNodeType {
                        path: path.to_string(),
                        found: tag.to_string(),
                    }
                })?;
                let fn_name = require_str(def, "name", path)?;
                let arguments = self.value_list(def, "arguments", path, id)?;
                ExprNode::Function {
                    kind,
                    name: fn_name,
                    arguments,
                }
            }
        };
        Ok(NodeKind::Expression(expr))
    }

    fn reference(&mut self, def: &Value, path: &str, id: NodeId) -> Result<ExprNode, CompileError> {
        let raw_path = def
            .get("path")
            .and_then(Value::as_array)
            .ok_or_else(|| CompileError::invalid(path, "reference requires a path list"))?;
        if raw_path.is_empty() {
            return Err(CompileError::invalid(path, "reference path is empty"));
        }

        let mut segments = Vec::with_capacity(raw_path.len());
        for (i, segment) in raw_path.iter().enumerate() {
            let seg_path = format!("{path}.path[{i}]");
            let segment = match segment {
                Value::String(s) => PathSegment::Key(s.clone()),
                Value::Number(n) => {
                    let idx = n.as_u64().ok_or_else(|| {
                        CompileError::invalid(
                            seg_path.as_str(),
                            "path index must be a non-negative integer",
                        )
                    })?;
                    PathSegment::Index(idx as usize)
                }
                v if tag_of(v).is_some() => {
                    PathSegment::Node(self.create_node(v, &seg_path, Some(id))?)
                }
                _ => {
                    return Err(CompileError::invalid(
                        seg_path.as_str(),
                        "path segment must be a string, an index, or an expression",
                    ))
                }
            };
            segments.push(segment);
        }

        let base = match def.get("base") {
            Some(v) => Some(self.required_tagged(v, &format!("{path}.base"), id)?),
            None => None,
        };

        Ok(ExprNode::Reference {
            path: segments,
            base,
        })
    }

    // ------------------------------------------------------------------
    // Predicate factories
    // ------------------------------------------------------------------

    fn predicate(
        &mut self,
        name: &str,
        def: &Value,
        path: &str,
        id: NodeId,
    ) -> Result<NodeKind, CompileError> {
        let predicate = match name {
            "test" => {
                let subject = self.required_value(def, "subject", path, id)?;
                let condition_def = def.get("condition").ok_or_else(|| {
                    CompileError::invalid(path, "test requires a condition")
                })?;
                if !matches!(tag_of(condition_def), Some(Tag::Expression("condition"))) {
                    return Err(CompileError::invalid(
                        format!("{path}.condition"),
                        "test condition must be a condition function",
                    ));
                }
                let condition =
                    self.create_node(condition_def, &format!("{path}.condition"), Some(id))?;
                let negate = def
                    .get("negate")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                PredicateNode::Test {
                    subject,
                    condition,
                    negate,
                }
            }
            "and" => PredicateNode::And {
                operands: self.value_list(def, "operands", path, id)?,
            },
            "or" => PredicateNode::Or {
                operands: self.value_list(def, "operands", path, id)?,
            },
            "xor" => PredicateNode::Xor {
                operands: self.value_list(def, "operands", path, id)?,
            },
            "not" => PredicateNode::Not {
                operand: self.required_value(def, "operand", path, id)?,
            },
            other => {
                return Err(CompileError::UnknownNodeType {
                    path: path.to_string(),
                    found: other.to_string(),
                })
            }
        };
        Ok(NodeKind::Predicate(predicate))
    }

    // ------------------------------------------------------------------
    // Transition factories
    // ------------------------------------------------------------------

    fn transition(
        &mut self,
        name: &str,
        def: &Value,
        path: &str,
        id: NodeId,
    ) -> Result<NodeKind, CompileError> {
        let transition = match name {
            "load" => TransitionNode::Load {
                effects: self.node_list(def, "effects", path, id)?,
            },
            "access" => {
                let guards = self.optional_value(def, "guards", path, id)?;
                let guards = match guards {
                    PropValue::Literal(Value::Null) => None,
                    other => Some(other),
                };
                TransitionNode::Access {
                    guards,
                    effects: self.node_list(def, "effects", path, id)?,
                    next: self.node_list(def, "next", path, id)?,
                }
            }
            "action" => {
                let when = self.required_value(def, "when", path, id)?;
                TransitionNode::Action {
                    when,
                    effects: self.node_list(def, "effects", path, id)?,
                }
            }
            "submit" => {
                let when = match def.get("when") {
                    Some(v) => Some(self.transform_value(v, &format!("{path}.when"), Some(id))?),
                    None => None,
                };
                let guards = match def.get("guards") {
                    Some(v) => Some(self.transform_value(v, &format!("{path}.guards"), Some(id))?),
                    None => None,
                };
                let validate = def
                    .get("validate")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                TransitionNode::Submit {
                    when,
                    guards,
                    validate,
                    on_valid: self.branch(def, "onValid", path, id)?,
                    on_invalid: self.branch(def, "onInvalid", path, id)?,
                    on_always: self.branch(def, "onAlways", path, id)?,
                }
            }
            other => {
                return Err(CompileError::UnknownNodeType {
                    path: path.to_string(),
                    found: other.to_string(),
                })
            }
        };
        Ok(NodeKind::Transition(transition))
    }

    fn branch(
        &mut self,
        def: &Value,
        key: &str,
        path: &str,
        parent: NodeId,
    ) -> Result<SubmitBranch, CompileError> {
        let Some(branch) = def.get(key) else {
            return Ok(SubmitBranch::default());
        };
        if !branch.is_object() {
            return Err(CompileError::invalid(
                format!("{path}.{key}"),
                "submit branch must be an object",
            ));
        }
        Ok(SubmitBranch {
            effects: self.node_list(branch, "effects", &format!("{path}.{key}"), parent)?,
            next: self.node_list(branch, "next", &format!("{path}.{key}"), parent)?,
        })
    }

    // ------------------------------------------------------------------
    // Outcome factories
    // ------------------------------------------------------------------

    fn outcome(
        &mut self,
        name: &str,
        def: &Value,
        path: &str,
        id: NodeId,
    ) -> Result<NodeKind, CompileError> {
        let when = match def.get("when") {
            Some(v) => Some(self.transform_value(v, &format!("{path}.when"), Some(id))?),
            None => None,
        };
        let outcome = match name {
            "redirect" => OutcomeNode::Redirect {
                when,
                goto: self.required_value(def, "goto", path, id)?,
            },
            "throwError" => {
                let status = def
                    .get("status")
                    .and_then(Value::as_u64)
                    .unwrap_or(500) as u16;
                OutcomeNode::ThrowError {
                    when,
                    status,
                    message: self.required_value(def, "message", path, id)?,
                }
            }
            other => {
                return Err(CompileError::UnknownNodeType {
                    path: path.to_string(),
                    found: other.to_string(),
                })
            }
        };
        Ok(NodeKind::Outcome(outcome))
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    fn required_value(
        &mut self,
        def: &Value,
        key: &str,
        path: &str,
        parent: NodeId,
    ) -> Result<PropValue, CompileError> {
        let value = def.get(key).ok_or_else(|| {
            CompileError::invalid(path, format!("missing required property '{key}'"))
        })?;
        self.transform_value(value, &format!("{path}.{key}"), Some(parent))
    }

    fn optional_value(
        &mut self,
        def: &Value,
        key: &str,
        path: &str,
        parent: NodeId,
    ) -> Result<PropValue, CompileError> {
        match def.get(key) {
            Some(v) => self.transform_value(v, &format!("{path}.{key}"), Some(parent)),
            None => Ok(PropValue::NULL),
        }
    }

    fn required_node(
        &mut self,
        def: &Value,
        key: &str,
        path: &str,
        parent: NodeId,
    ) -> Result<NodeId, CompileError> {
        let value = def.get(key).ok_or_else(|| {
            CompileError::invalid(path, format!("missing required property '{key}'"))
        })?;
        self.required_tagged(value, &format!("{path}.{key}"), parent)
    }

    fn optional_node(
        &mut self,
        def: &Value,
        key: &str,
        path: &str,
        parent: NodeId,
    ) -> Result<Option<NodeId>, CompileError> {
        match def.get(key) {
            Some(v) => Ok(Some(self.required_tagged(v, &format!("{path}.{key}"), parent)?)),
            None => Ok(None),
        }
    }

    fn required_tagged(
        &mut self,
        value: &Value,
        path: &str,
        parent: NodeId,
    ) -> Result<NodeId, CompileError> {
        if tag_of(value).is_none() {
            return Err(CompileError::invalid(path, "expected a node definition"));
        }
        self.create_node(value, path, Some(parent))
    }

    /// A list property whose every element must be a definition.
    fn node_list(
        &mut self,
        def: &Value,
        key: &str,
        path: &str,
        parent: NodeId,
    ) -> Result<Vec<NodeId>, CompileError> {
        match def.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.required_tagged(item, &format!("{path}.{key}[{i}]"), parent)?);
                }
                Ok(out)
            }
            Some(_) => Err(CompileError::invalid(
                format!("{path}.{key}"),
                "expected a list of node definitions",
            )),
        }
    }

    /// A list property whose elements may be definitions or literals.
    fn value_list(
        &mut self,
        def: &Value,
        key: &str,
        path: &str,
        parent: NodeId,
    ) -> Result<Vec<PropValue>, CompileError> {
        match def.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.transform_value(
                        item,
                        &format!("{path}.{key}[{i}]"),
                        Some(parent),
                    )?);
                }
                Ok(out)
            }
            Some(_) => Err(CompileError::invalid(
                format!("{path}.{key}"),
                "expected a list",
            )),
        }
    }

    /// Transform all keys not consumed by the typed fields into the node's
    /// property map.
    fn rest_properties(
        &mut self,
        def: &Value,
        consumed: &[&str],
        path: &str,
        parent: NodeId,
    ) -> Result<PropertyMap, CompileError> {
        let mut properties = PropertyMap::new();
        if let Value::Object(map) = def {
            for (key, value) in map {
                if consumed.contains(&key.as_str()) {
                    continue;
                }
                let transformed =
                    self.transform_value(value, &format!("{path}.{key}"), Some(parent))?;
                properties.insert(key.clone(), transformed);
            }
        }
        Ok(properties)
    }
}

// ============================================================================
// TAG DETECTION
// ============================================================================

/// Whether a value is a tagged node definition (as opposed to plain data).
pub fn is_definition(value: &Value) -> bool {
    tag_of(value).is_some()
}

enum Tag<'a> {
    Structural(&'a str),
    Expression(&'a str),
    Predicate(&'a str),
    Transition(&'a str),
    Outcome(&'a str),
}

fn tag_of(value: &Value) -> Option<Tag<'_>> {
    let map = value.as_object()?;
    if let Some(tag) = map.get("expressionType").and_then(Value::as_str) {
        return Some(Tag::Expression(tag));
    }
    if let Some(tag) = map.get("predicateType").and_then(Value::as_str) {
        return Some(Tag::Predicate(tag));
    }
    if let Some(tag) = map.get("transitionType").and_then(Value::as_str) {
        return Some(Tag::Transition(tag));
    }
    if let Some(tag) = map.get("outcomeType").and_then(Value::as_str) {
        return Some(Tag::Outcome(tag));
    }
    match map.get("type").and_then(Value::as_str) {
        Some(tag) if matches!(tag, "journey" | "step" | "block") => Some(Tag::Structural(tag)),
        _ => None,
    }
}

fn iterator_of(def: &Value, path: &str) -> Result<IteratorKind, CompileError> {
    let iterator = def
        .get("iterator")
        .and_then(Value::as_object)
        .ok_or_else(|| CompileError::invalid(path, "iterate requires an iterator"))?;

    let kind = iterator
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CompileError::invalid(format!("{path}.iterator"), "missing iterator type"))?;

    match kind {
        "map" => {
            let template = iterator.get("yield").cloned().ok_or_else(|| {
                CompileError::invalid(format!("{path}.iterator"), "map iterator requires a yield")
            })?;
            Ok(IteratorKind::Map { template })
        }
        "filter" => {
            let template = iterator.get("predicate").cloned().ok_or_else(|| {
                CompileError::invalid(
                    format!("{path}.iterator"),
                    "filter iterator requires a predicate",
                )
            })?;
            Ok(IteratorKind::Filter { template })
        }
        "find" => {
            let template = iterator.get("predicate").cloned().ok_or_else(|| {
                CompileError::invalid(
                    format!("{path}.iterator"),
                    "find iterator requires a predicate",
                )
            })?;
            Ok(IteratorKind::Find { template })
        }
        other => Err(CompileError::UnknownNodeType {
            path: format!("{path}.iterator"),
            found: other.to_string(),
        }),
    }
}

fn get_str<'v>(def: &'v Value, key: &str) -> Option<&'v str> {
    def.get(key).and_then(Value::as_str)
}

fn require_str(def: &Value, key: &str, path: &str) -> Result<String, CompileError> {
    get_str(def, key).map(str::to_string).ok_or_else(|| {
        CompileError::invalid(path, format!("missing required string property '{key}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeIdGenerator;
    use serde_json::json;

    fn factory_for(ids: &NodeIdGenerator) -> NodeFactory<'_> {
        NodeFactory::new(ids)
    }

    #[test]
    fn literal_values_pass_through() {
        let ids = NodeIdGenerator::new();
        let mut factory = factory_for(&ids);

        let value = factory
            .transform_value(&json!("plain"), "p", None)
            .unwrap();
        assert_eq!(value, PropValue::Literal(json!("plain")));

        // An object with a foreign `type` key is data, not a definition.
        let value = factory
            .transform_value(&json!({"type": "button", "text": "Go"}), "p", None)
            .unwrap();
        assert!(matches!(value, PropValue::Literal(_)));
    }

    #[test]
    fn arrays_map_elementwise() {
        let ids = NodeIdGenerator::new();
        let mut factory = factory_for(&ids);

        let value = factory
            .transform_value(
                &json!([1, {"expressionType": "reference", "path": ["data", "x"]}]),
                "p",
                None,
            )
            .unwrap();

        match value {
            PropValue::List(items) => {
                assert_eq!(items[0], PropValue::Literal(json!(1)));
                assert!(matches!(items[1], PropValue::Node(_)));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn reference_paths_are_typed() {
        let ids = NodeIdGenerator::new();
        let mut factory = factory_for(&ids);

        let id = factory
            .create_node(
                &json!({"expressionType": "reference", "path": ["data", "items", 0]}),
                "p",
                None,
            )
            .unwrap();

        let created = factory.into_created();
        let node = &created.iter().find(|c| c.node.id == id).unwrap().node;
        match &node.kind {
            NodeKind::Expression(ExprNode::Reference { path, base }) => {
                assert_eq!(path.len(), 3);
                assert!(matches!(path[0], PathSegment::Key(ref k) if k == "data"));
                assert!(matches!(path[2], PathSegment::Index(0)));
                assert!(base.is_none());
            }
            other => panic!("expected reference, got {other:?}"),
        }
    }

    #[test]
    fn iterate_template_stays_raw() {
        let ids = NodeIdGenerator::new();
        let mut factory = factory_for(&ids);

        let yield_def = json!({"expressionType": "reference", "path": ["@item", "id"]});
        let id = factory
            .create_node(
                &json!({
                    "expressionType": "iterate",
                    "input": {"expressionType": "reference", "path": ["data", "items"]},
                    "iterator": {"type": "map", "yield": yield_def},
                }),
                "p",
                None,
            )
            .unwrap();

        let created = factory.into_created();
        let node = &created.iter().find(|c| c.node.id == id).unwrap().node;
        match &node.kind {
            NodeKind::Expression(ExprNode::Iterate { iterator, .. }) => {
                // The yield template must NOT have been compiled to a node.
                assert_eq!(iterator.template(), &yield_def);
            }
            other => panic!("expected iterate, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_child_is_invalid_node() {
        let ids = NodeIdGenerator::new();
        let mut factory = factory_for(&ids);

        let err = factory
            .create_node(&json!({"expressionType": "format"}), "step.blocks[0].label", None)
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("FF-001"));
        assert!(text.contains("step.blocks[0].label"));
    }

    #[test]
    fn unknown_expression_tag_is_rejected() {
        let ids = NodeIdGenerator::new();
        let mut factory = factory_for(&ids);

        let err = factory
            .create_node(&json!({"expressionType": "frobnicate"}), "p", None)
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownNodeType { .. }));
    }

    #[test]
    fn field_block_requires_code() {
        let ids = NodeIdGenerator::new();
        let mut factory = factory_for(&ids);

        let err = factory
            .create_node(
                &json!({"type": "block", "blockType": "field", "variant": "text-input"}),
                "p",
                None,
            )
            .unwrap_err();
        assert!(err.to_string().contains("code"));
    }

    #[test]
    fn journey_parents_are_recorded() {
        let ids = NodeIdGenerator::new();
        let mut factory = factory_for(&ids);

        let journey = factory
            .create_journey(&json!({
                "type": "journey",
                "path": "/j",
                "steps": [
                    {"type": "step", "path": "/a", "blocks": [
                        {"type": "block", "blockType": "basic", "variant": "html"}
                    ]}
                ],
            }))
            .unwrap();

        let created = factory.into_created();
        assert_eq!(created.len(), 3);

        let step = created
            .iter()
            .find(|c| matches!(c.node.kind, NodeKind::Step(_)))
            .unwrap();
        assert_eq!(step.parent, Some(journey));
        assert_eq!(step.path, "journey.steps[0]");

        let block = created
            .iter()
            .find(|c| matches!(c.node.kind, NodeKind::Block(_)))
            .unwrap();
        assert_eq!(block.parent, Some(step.node.id));
    }
}
