//! Structural handlers: journey, step, block.
//!
//! The step handler produces the evaluated view model the template layer
//! renders. Blocks off the target step only evaluate their
//! validation-relevant subset; a falsy `dependent` empties a block's
//! validation list.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::eval::context::EvalContext;
use crate::eval::handler::{HandlerResult, ThunkHandler};
use crate::eval::handlers::eval_prop;
use crate::eval::invoke::Invoker;
use crate::node::{BlockType, Namespace, NodeId, PropValue, SourceKey};
use crate::walk::is_truthy;

pub struct BlockHandler {
    pub id: NodeId,
    pub block_type: BlockType,
    pub variant: String,
    pub code: Option<String>,
    pub multiple: bool,
    pub properties: Vec<(String, PropValue)>,
    pub validate: Vec<NodeId>,
    pub dependent: Option<PropValue>,
    /// Raw formatter definitions, passed through verbatim for submission.
    pub formatters: Vec<Value>,
    pub child_blocks: Vec<NodeId>,
    pub on_target: bool,
}

impl BlockHandler {
    fn block_type_tag(&self) -> &'static str {
        match self.block_type {
            BlockType::Field => "field",
            BlockType::Basic => "basic",
        }
    }
}

#[async_trait]
impl ThunkHandler for BlockHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        // Dependent gating comes first: a gated-off block keeps no
        // validations.
        let gated = match &self.dependent {
            Some(dependent) => eval_prop(dependent, ctx, inv)
                .await
                .map(|value| is_truthy(&value))
                .unwrap_or(false),
            None => true,
        };

        let mut properties = Map::new();
        if let Some(code) = &self.code {
            properties.insert("code".into(), json!(code));
        }
        if self.dependent.is_some() {
            properties.insert("dependent".into(), json!(gated));
        }

        let mut blocks = Vec::new();
        if self.on_target {
            for (key, prop) in &self.properties {
                properties.insert(key.clone(), eval_prop(prop, ctx, inv).await?);
            }
            if self.block_type == BlockType::Field {
                properties.insert("multiple".into(), json!(self.multiple));
                if !self.formatters.is_empty() {
                    properties.insert("formatters".into(), Value::Array(self.formatters.clone()));
                }
                // The field's resolved answer, via its ANSWER_LOCAL pseudo.
                if let Some(code) = &self.code {
                    if let Some(answer) =
                        ctx.pseudo_for(&SourceKey::new(Namespace::Answers, code.as_str()))
                    {
                        properties.insert("value".into(), inv.invoke(answer, ctx).await?);
                    }
                }
            }
            for child in &self.child_blocks {
                blocks.push(inv.invoke(*child, ctx).await?);
            }
        }

        let mut validations = Vec::new();
        if gated {
            for validation in &self.validate {
                validations.push(inv.invoke(*validation, ctx).await?);
            }
        }
        properties.insert("validate".into(), Value::Array(validations));

        let mut output = json!({
            "id": self.id.to_string(),
            "type": "block",
            "blockType": self.block_type_tag(),
            "variant": self.variant,
            "properties": properties,
        });
        if !blocks.is_empty() {
            output["blocks"] = Value::Array(blocks);
        }
        Ok(output)
    }
}

pub struct StepHandler {
    pub id: NodeId,
    pub path: String,
    pub blocks: Vec<NodeId>,
    pub properties: Vec<(String, PropValue)>,
}

#[async_trait]
impl ThunkHandler for StepHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let mut properties = Map::new();
        for (key, prop) in &self.properties {
            properties.insert(key.clone(), eval_prop(prop, ctx, inv).await?);
        }

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            blocks.push(inv.invoke(*block, ctx).await?);
        }

        Ok(json!({
            "id": self.id.to_string(),
            "type": "step",
            "path": self.path,
            "properties": properties,
            "blocks": blocks,
        }))
    }
}

pub struct JourneyHandler {
    pub id: NodeId,
    pub path: String,
    pub step_paths: Vec<String>,
    pub properties: Vec<(String, PropValue)>,
    /// Ancestors of the target step evaluate their display properties;
    /// other journeys stay structural.
    pub ancestor_of_target: bool,
}

#[async_trait]
impl ThunkHandler for JourneyHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let mut properties = Map::new();
        if self.ancestor_of_target {
            for (key, prop) in &self.properties {
                properties.insert(key.clone(), eval_prop(prop, ctx, inv).await?);
            }
        }

        Ok(json!({
            "id": self.id.to_string(),
            "type": "journey",
            "path": self.path,
            "steps": self.step_paths,
            "properties": properties,
        }))
    }
}
