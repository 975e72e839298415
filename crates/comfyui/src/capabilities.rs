//! Node catalogue fetched from `GET /object_info` and local workflow
//! validation against it.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// Maximum "did you mean" suggestions per unknown node class.
const MAX_SUGGESTIONS: usize = 3;

/// Input requirements for one node class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSpec {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

/// Every node class a backend instance knows, with its required inputs.
#[derive(Debug, Clone, Default)]
pub struct NodeCatalog {
    nodes: BTreeMap<String, NodeSpec>,
}

/// One defect found in a workflow before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowIssue {
    pub node_id: String,
    pub class_type: Option<String>,
    pub message: String,
    pub suggestions: Vec<String>,
}

impl fmt::Display for WorkflowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.class_type {
            Some(class) => write!(f, "node {} [{class}]: {}", self.node_id, self.message)?,
            None => write!(f, "node {}: {}", self.node_id, self.message)?,
        }
        if !self.suggestions.is_empty() {
            write!(f, " (did you mean: {}?)", self.suggestions.join(", "))?;
        }
        Ok(())
    }
}

impl NodeCatalog {
    /// Build from the raw `/object_info` body:
    /// `{"<Class>": {"input": {"required": {...}, "optional": {...}}}}`.
    pub fn from_object_info(info: &Value) -> Self {
        let keys = |node: &Value, section: &str| -> Vec<String> {
            node.get("input")
                .and_then(|i| i.get(section))
                .and_then(Value::as_object)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default()
        };

        let nodes = info
            .as_object()
            .map(|classes| {
                classes
                    .iter()
                    .map(|(class, node)| {
                        (
                            class.clone(),
                            NodeSpec {
                                required: keys(node, "required"),
                                optional: keys(node, "optional"),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, class_type: &str) -> bool {
        self.nodes.contains_key(class_type)
    }

    pub fn node(&self, class_type: &str) -> Option<&NodeSpec> {
        self.nodes.get(class_type)
    }

    /// Known classes whose name contains `class_type` or is contained in
    /// it, compared case-insensitively.
    pub fn suggest(&self, class_type: &str) -> Vec<String> {
        let needle = class_type.to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.nodes
            .keys()
            .filter(|known| {
                let known = known.to_lowercase();
                known.contains(&needle) || needle.contains(&known)
            })
            .take(MAX_SUGGESTIONS)
            .cloned()
            .collect()
    }

    /// Check node kinds, required inputs and links of an API-format
    /// workflow. An empty result means the workflow is submittable as far
    /// as the catalogue can tell.
    pub fn validate_workflow(&self, workflow: &Value) -> Vec<WorkflowIssue> {
        let Some(nodes) = workflow.as_object() else {
            return vec![WorkflowIssue {
                node_id: "-".to_string(),
                class_type: None,
                message: "workflow is not a JSON object".to_string(),
                suggestions: Vec::new(),
            }];
        };

        let mut issues = Vec::new();
        for (node_id, node) in nodes {
            let issue = |class_type: Option<&str>, message: String| WorkflowIssue {
                node_id: node_id.clone(),
                class_type: class_type.map(String::from),
                message,
                suggestions: Vec::new(),
            };

            let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
                issues.push(issue(None, "missing class_type".to_string()));
                continue;
            };

            let Some(spec) = self.node(class_type) else {
                issues.push(WorkflowIssue {
                    suggestions: self.suggest(class_type),
                    ..issue(Some(class_type), "unknown node type".to_string())
                });
                continue;
            };

            let inputs = node.get("inputs").and_then(Value::as_object);
            for name in &spec.required {
                if !inputs.is_some_and(|i| i.contains_key(name)) {
                    issues.push(issue(
                        Some(class_type),
                        format!("missing required input '{name}'"),
                    ));
                }
            }

            // Links are `[source_node_id, output_slot]`.
            for (name, value) in inputs.into_iter().flatten() {
                if let Some(source) = link_source(value) {
                    if !nodes.contains_key(source) {
                        issues.push(issue(
                            Some(class_type),
                            format!("input '{name}' links to missing node {source}"),
                        ));
                    }
                }
            }
        }
        issues
    }
}

fn link_source(value: &Value) -> Option<&str> {
    match value.as_array()?.as_slice() {
        [Value::String(source), Value::Number(_)] => Some(source.as_str()),
        _ => None,
    }
}
