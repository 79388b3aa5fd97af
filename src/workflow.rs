use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ComfyError, Result};

/// Reference to output slot `slot` of node `node_id`.
///
/// Encoded on the wire as a two-element array: `["4", 0]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u32)", into = "(String, u32)")]
pub struct NodeLink {
    pub node_id: String,
    pub slot: u32,
}

impl NodeLink {
    pub fn new(node_id: impl Into<String>, slot: u32) -> Self {
        Self {
            node_id: node_id.into(),
            slot,
        }
    }
}

impl From<(String, u32)> for NodeLink {
    fn from((node_id, slot): (String, u32)) -> Self {
        Self { node_id, slot }
    }
}

impl From<NodeLink> for (String, u32) {
    fn from(link: NodeLink) -> Self {
        (link.node_id, link.slot)
    }
}

/// A node input: either an edge from another node's output or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Link(NodeLink),
    Literal(Value),
}

impl InputValue {
    pub fn as_link(&self) -> Option<&NodeLink> {
        match self {
            InputValue::Link(link) => Some(link),
            InputValue::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            InputValue::Literal(v) => Some(v),
            InputValue::Link(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_literal().and_then(Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_literal().and_then(Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_literal().and_then(Value::as_f64)
    }
}

impl From<NodeLink> for InputValue {
    fn from(link: NodeLink) -> Self {
        InputValue::Link(link)
    }
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for InputValue {
            fn from(v: $ty) -> Self {
                InputValue::Literal(Value::from(v))
            }
        })*
    };
}

literal_from!(&str, String, bool, i32, i64, u32, u64, f32, f64);

impl From<Value> for InputValue {
    fn from(v: Value) -> Self {
        InputValue::Literal(v)
    }
}

/// One operation in a workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Editor metadata (`{"title": ...}`) carried by exported API workflows.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Node {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            ..Default::default()
        }
    }

    /// Builder-style input setter.
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputValue> {
        self.inputs.get(name)
    }

    /// Iterate over the edges feeding this node as `(input_name, link)`.
    pub fn links(&self) -> impl Iterator<Item = (&str, &NodeLink)> {
        self.inputs
            .iter()
            .filter_map(|(name, v)| v.as_link().map(|l| (name.as_str(), l)))
    }
}

/// A ComfyUI workflow in API format: node id → [`Node`].
///
/// `Clone` produces a fully independent copy; a submitted workflow is
/// serialized at submission time, so later edits never reach the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow {
    nodes: BTreeMap<String, Node>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an API-format workflow from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load an API-format workflow from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ComfyError::Io {
            context: format!("Failed to read workflow {}", path.display()),
            source: e,
        })?;
        Self::from_json_str(&data)
    }

    /// Write the workflow as pretty-printed JSON.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).map_err(|e| ComfyError::Io {
            context: format!("Failed to write workflow {}", path.display()),
            source: e,
        })
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node, replacing any node already stored under `id`.
    /// Returns the replaced node.
    pub fn add_node<S>(
        &mut self,
        id: impl Into<String>,
        class_type: impl Into<String>,
        inputs: impl IntoIterator<Item = (S, InputValue)>,
    ) -> Option<Node>
    where
        S: Into<String>,
    {
        let node = Node {
            class_type: class_type.into(),
            inputs: inputs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            meta: None,
        };
        self.insert_node(id, node)
    }

    pub fn insert_node(&mut self, id: impl Into<String>, node: Node) -> Option<Node> {
        self.nodes.insert(id.into(), node)
    }

    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Set one input on an existing node.
    pub fn set_input(
        &mut self,
        node_id: &str,
        input: impl Into<String>,
        value: impl Into<InputValue>,
    ) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ComfyError::NodeNotFound(node_id.to_string()))?;
        node.inputs.insert(input.into(), value.into());
        Ok(())
    }

    pub fn input(&self, node_id: &str, input: &str) -> Result<&InputValue> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| ComfyError::NodeNotFound(node_id.to_string()))?;
        node.inputs.get(input).ok_or_else(|| ComfyError::InputNotFound {
            node_id: node_id.to_string(),
            input: input.to_string(),
        })
    }

    /// All node ids. Callers must not rely on the order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(id, n)| (id.as_str(), n))
    }

    pub fn nodes_by_class<'a>(
        &'a self,
        class_type: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Node)> + 'a {
        self.nodes().filter(move |(_, n)| n.class_type == class_type)
    }

    /// Shallow structural check. Dangling links are left for the server
    /// to report.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ComfyError::EmptyGraph);
        }
        match self.nodes.iter().find(|(_, n)| n.class_type.is_empty()) {
            Some((id, _)) => Err(ComfyError::MissingNodeType(id.clone())),
            None => Ok(()),
        }
    }
}

impl FromIterator<(String, Node)> for Workflow {
    fn from_iter<T: IntoIterator<Item = (String, Node)>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

/// Builds a [`Workflow`] with automatically numbered node ids.
///
/// # Example
/// ```
/// use comfyui_client::{InputValue, WorkflowBuilder};
///
/// let mut b = WorkflowBuilder::new();
/// let ckpt = b.add_node("CheckpointLoaderSimple", [("ckpt_name", InputValue::from("sd15.safetensors"))]);
/// let text = b.add_node("CLIPTextEncode", [("text", InputValue::from("a lighthouse"))]);
/// b.connect(&ckpt, 1, &text, "clip").unwrap();
///
/// let workflow = b.build();
/// assert_eq!(workflow.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    workflow: Workflow,
    next_id: u64,
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self {
            workflow: Workflow::new(),
            next_id: 1,
        }
    }

    /// Continue numbering after the highest numeric id already present.
    pub fn from_workflow(workflow: Workflow) -> Self {
        let next_id = workflow
            .node_ids()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1);
        Self { workflow, next_id }
    }

    /// Add a node under the next free sequential id and return that id.
    pub fn add_node<S>(
        &mut self,
        class_type: impl Into<String>,
        inputs: impl IntoIterator<Item = (S, InputValue)>,
    ) -> String
    where
        S: Into<String>,
    {
        let id = self.allocate_id();
        self.workflow.add_node(id.clone(), class_type, inputs);
        id
    }

    /// Add a prepared [`Node`] under the next free sequential id.
    pub fn push(&mut self, node: Node) -> String {
        let id = self.allocate_id();
        self.workflow.insert_node(id.clone(), node);
        id
    }

    /// Add (or replace) a node under a caller-chosen id.
    pub fn add_node_with_id<S>(
        &mut self,
        id: impl Into<String>,
        class_type: impl Into<String>,
        inputs: impl IntoIterator<Item = (S, InputValue)>,
    ) where
        S: Into<String>,
    {
        self.workflow.add_node(id, class_type, inputs);
    }

    /// Wire output `slot` of `source` into input `input` of `target`.
    ///
    /// Only the target must exist; the source is resolved by the server.
    pub fn connect(
        &mut self,
        source: &str,
        slot: u32,
        target: &str,
        input: impl Into<String>,
    ) -> Result<()> {
        self.workflow
            .set_input(target, input, NodeLink::new(source, slot))
    }

    pub fn set_input(
        &mut self,
        node_id: &str,
        input: impl Into<String>,
        value: impl Into<InputValue>,
    ) -> Result<()> {
        self.workflow.set_input(node_id, input, value)
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn build(self) -> Workflow {
        self.workflow
    }

    fn allocate_id(&mut self) -> String {
        loop {
            let id = self.next_id.to_string();
            self.next_id += 1;
            if !self.workflow.contains(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sample() -> Workflow {
        let mut b = WorkflowBuilder::new();
        let ckpt = b.add_node(
            "CheckpointLoaderSimple",
            [("ckpt_name", InputValue::from("dreamshaper_8.safetensors"))],
        );
        let text = b.add_node("CLIPTextEncode", [("text", InputValue::from("a cat"))]);
        b.connect(&ckpt, 1, &text, "clip").unwrap();
        b.build()
    }

    #[test]
    fn test_builder_assigns_sequential_ids() {
        let wf = sample();
        let ids: Vec<_> = wf.node_ids().collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_builder_skips_taken_ids() {
        let mut b = WorkflowBuilder::new();
        b.add_node_with_id("1", "Fixed", [("x", InputValue::from(1))]);
        let id = b.add_node("Auto", [("y", InputValue::from(2))]);
        assert_eq!(id, "2");
    }

    #[test]
    fn test_from_workflow_continues_numbering() {
        let mut b = WorkflowBuilder::from_workflow(sample());
        let id = b.push(Node::new("SaveImage"));
        assert_eq!(id, "3");
    }

    #[test]
    fn test_connect_writes_link_tuple() {
        let wf = sample();
        let value = wf.to_value().unwrap();
        assert_eq!(value["2"]["inputs"]["clip"], json!(["1", 1]));
        assert_eq!(
            wf.input("2", "clip").unwrap().as_link(),
            Some(&NodeLink::new("1", 1))
        );
    }

    #[test]
    fn test_connect_missing_target() {
        let mut b = WorkflowBuilder::new();
        let err = b.connect("1", 0, "9", "samples").unwrap_err();
        assert_matches!(err, ComfyError::NodeNotFound(id) if id == "9");
    }

    #[test]
    fn test_set_and_get_input() {
        let mut wf = sample();
        wf.set_input("2", "text", "a dog").unwrap();
        assert_eq!(wf.input("2", "text").unwrap().as_str(), Some("a dog"));
    }

    #[test]
    fn test_input_errors() {
        let wf = sample();
        assert_matches!(wf.input("42", "text"), Err(ComfyError::NodeNotFound(_)));
        assert_matches!(
            wf.input("2", "nope"),
            Err(ComfyError::InputNotFound { node_id, input }) if node_id == "2" && input == "nope"
        );
    }

    #[test]
    fn test_add_replaces_and_remove() {
        let mut wf = sample();
        let old = wf.add_node("1", "Other", [("a", InputValue::from(true))]);
        assert_eq!(old.unwrap().class_type, "CheckpointLoaderSimple");
        assert_eq!(wf.node("1").unwrap().class_type, "Other");
        assert!(wf.remove_node("1").is_some());
        assert!(wf.node("1").is_none());
        assert!(wf.remove_node("1").is_none());
    }

    #[test]
    fn test_nodes_by_class() {
        let mut wf = sample();
        wf.insert_node("7", Node::new("CLIPTextEncode").with_input("text", "negative"));
        let mut ids: Vec<_> = wf.nodes_by_class("CLIPTextEncode").map(|(id, _)| id).collect();
        ids.sort();
        assert_eq!(ids, vec!["2", "7"]);
        assert_eq!(wf.nodes_by_class("Missing").count(), 0);
    }

    #[test]
    fn test_clone_is_independent() {
        let original = sample();
        let mut copy = original.clone();
        copy.set_input("1", "ckpt_name", "other.safetensors").unwrap();
        copy.remove_node("2");
        assert_eq!(
            original.input("1", "ckpt_name").unwrap().as_str(),
            Some("dreamshaper_8.safetensors")
        );
        assert!(original.node("2").is_some());
    }

    #[test]
    fn test_validate() {
        assert_matches!(Workflow::new().validate(), Err(ComfyError::EmptyGraph));

        let mut wf = sample();
        assert!(wf.validate().is_ok());

        wf.insert_node("9", Node::new(""));
        assert_matches!(wf.validate(), Err(ComfyError::MissingNodeType(id)) if id == "9");
    }

    #[test]
    fn test_validate_ignores_dangling_links() {
        let mut wf = Workflow::new();
        wf.insert_node("1", Node::new("VAEDecode").with_input("samples", NodeLink::new("99", 0)));
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_parse_api_format() {
        let wf = Workflow::from_json_str(
            r#"{
                "3": {"class_type": "KSampler", "inputs": {"seed": 5, "cfg": 7.5, "model": ["4", 0]}},
                "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "x"}, "_meta": {"title": "Load"}}
            }"#,
        )
        .unwrap();
        let sampler = wf.node("3").unwrap();
        assert_eq!(sampler.input("seed").unwrap().as_i64(), Some(5));
        assert_eq!(sampler.input("cfg").unwrap().as_f64(), Some(7.5));
        assert_eq!(sampler.links().count(), 1);
        assert_eq!(wf.node("4").unwrap().meta, Some(json!({"title": "Load"})));
    }

    #[test]
    fn test_literal_list_is_not_a_link() {
        let wf = Workflow::from_json_str(
            r#"{"1": {"class_type": "X", "inputs": {"sizes": [512, 768]}}}"#,
        )
        .unwrap();
        assert!(wf.input("1", "sizes").unwrap().as_link().is_none());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        let wf = sample();
        wf.to_file(&path).unwrap();
        assert_eq!(Workflow::from_file(&path).unwrap(), wf);
    }

    #[test]
    fn test_from_file_missing() {
        assert_matches!(
            Workflow::from_file("/definitely/not/here.json"),
            Err(ComfyError::Io { .. })
        );
    }
}
