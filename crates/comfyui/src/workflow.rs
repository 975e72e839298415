//! Workflow templates and the builder that fills them.
//!
//! Templates are API-format workflows whose inputs carry `{{NAME}}`
//! placeholders. [`WorkflowBuilder`] collects the values through named
//! setters and [`WorkflowBuilder::build`] produces an immutable
//! [`Workflow`]. Image placeholders stay bound to local paths until the
//! job client uploads them and calls [`Workflow::bind_uploads`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};

pub const PROMPT: &str = "{{PROMPT}}";
pub const NEGATIVE_PROMPT: &str = "{{NEGATIVE_PROMPT}}";
pub const REFERENCE: &str = "{{REFERENCE}}";
pub const REFERENCE2: &str = "{{REFERENCE2}}";
pub const REFERENCE3: &str = "{{REFERENCE3}}";
pub const START_FRAME: &str = "{{START_FRAME}}";
pub const END_FRAME: &str = "{{END_FRAME}}";
pub const POSE: &str = "{{POSE}}";
pub const MODEL_NAME: &str = "{{MODEL_NAME}}";
pub const LORA_NAME: &str = "{{LORA_NAME}}";

/// Used when no negative prompt is set.
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "blurry, low quality, distorted, deformed, poorly drawn, worst quality";

// ---------------------------------------------------------------------------
// Resolution presets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Named output sizes trading quality for memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPreset {
    Low,
    Medium,
    High,
}

impl ResolutionPreset {
    pub fn resolution(self) -> Resolution {
        match self {
            Self::Low => Resolution { width: 640, height: 384 },
            Self::Medium => Resolution { width: 832, height: 480 },
            Self::High => Resolution { width: 1280, height: 720 },
        }
    }

    /// Frame count used for video when the plan gives none.
    pub fn default_length(self) -> u32 {
        match self {
            Self::Low => 49,
            Self::Medium | Self::High => 81,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for ResolutionPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!(
                "unknown resolution preset '{other}' (expected low, medium or high)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid workflow JSON in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Workflow must be a JSON object of nodes")]
    NotAnObject,

    #[error("Node {node_id} input '{input}' still holds {placeholder}")]
    Unfilled {
        node_id: String,
        input: String,
        placeholder: String,
    },

    #[error("No upload provided for {path}")]
    MissingUpload { path: String },
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A fully parameterised workflow, ready for upload binding and submission.
#[derive(Debug, Clone)]
pub struct Workflow {
    graph: Value,
    images: Vec<(&'static str, PathBuf)>,
}

impl Workflow {
    /// Wrap a graph that needs no image uploads.
    pub fn from_graph(graph: Value) -> Result<Self, WorkflowError> {
        WorkflowBuilder::new(graph).build()
    }

    pub fn graph(&self) -> &Value {
        &self.graph
    }

    /// Local files that must be uploaded before submission, deduplicated.
    pub fn uploads(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = Vec::new();
        for (_, path) in &self.images {
            if !paths.contains(&path.as_path()) {
                paths.push(path);
            }
        }
        paths
    }

    /// Produce the submittable graph with every image placeholder replaced
    /// by the server-side name its file was uploaded under.
    pub fn bind_uploads(
        &self,
        uploaded: &BTreeMap<PathBuf, String>,
    ) -> Result<Value, WorkflowError> {
        let mut bindings = Vec::with_capacity(self.images.len());
        for (token, path) in &self.images {
            let name = uploaded
                .get(path)
                .ok_or_else(|| WorkflowError::MissingUpload {
                    path: path.display().to_string(),
                })?;
            bindings.push((*token, name.clone()));
        }

        let mut graph = self.graph.clone();
        for_each_input(&mut graph, |_, _, _, value| substitute(value, &bindings));
        Ok(graph)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Named-setter builder over a workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    template: Value,
    prompt: Option<String>,
    negative_prompt: Option<String>,
    model_name: Option<String>,
    lora_name: Option<String>,
    references: [Option<PathBuf>; 3],
    start_frame: Option<PathBuf>,
    end_frame: Option<PathBuf>,
    pose: Option<PathBuf>,
    resolution: Option<Resolution>,
    length: Option<u32>,
    seed: Option<i64>,
    steps: Option<u32>,
    cfg: Option<f64>,
    control_strength: Option<f64>,
}

impl WorkflowBuilder {
    pub fn new(template: Value) -> Self {
        Self {
            template,
            prompt: None,
            negative_prompt: None,
            model_name: None,
            lora_name: None,
            references: [None, None, None],
            start_frame: None,
            end_frame: None,
            pose: None,
            resolution: None,
            length: None,
            seed: None,
            steps: None,
            cfg: None,
            control_strength: None,
        }
    }

    /// Load a template from a JSON file.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let template = serde_json::from_str(&text).map_err(|source| WorkflowError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(template))
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn negative_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(prompt.into());
        self
    }

    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = Some(name.into());
        self
    }

    pub fn lora_name(mut self, name: impl Into<String>) -> Self {
        self.lora_name = Some(name.into());
        self
    }

    /// Primary reference image. `{{REFERENCE2}}` and `{{REFERENCE3}}` fall
    /// back to it when not set.
    pub fn reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.references[0] = Some(path.into());
        self
    }

    /// Additional reference image; `slot` is 2 or 3. Other slots are
    /// ignored.
    pub fn extra_reference(mut self, slot: usize, path: impl Into<PathBuf>) -> Self {
        if (2..=3).contains(&slot) {
            self.references[slot - 1] = Some(path.into());
        }
        self
    }

    pub fn start_frame(mut self, path: impl Into<PathBuf>) -> Self {
        self.start_frame = Some(path.into());
        self
    }

    pub fn end_frame(mut self, path: impl Into<PathBuf>) -> Self {
        self.end_frame = Some(path.into());
        self
    }

    pub fn pose(mut self, path: impl Into<PathBuf>) -> Self {
        self.pose = Some(path.into());
        self
    }

    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn preset(self, preset: ResolutionPreset) -> Self {
        self.resolution(preset.resolution())
    }

    /// Frame count for video nodes.
    pub fn length(mut self, frames: u32) -> Self {
        self.length = Some(frames);
        self
    }

    /// Sampler seed. Zero or negative keeps the template's seed.
    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = (seed > 0).then_some(seed);
        self
    }

    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn cfg(mut self, cfg: f64) -> Self {
        self.cfg = Some(cfg);
        self
    }

    pub fn control_strength(mut self, strength: f64) -> Self {
        self.control_strength = Some(strength);
        self
    }

    /// Apply every setter and check that no placeholder is left unfilled.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let mut graph = self.template;
        if !graph.is_object() {
            return Err(WorkflowError::NotAnObject);
        }

        let negative = self
            .negative_prompt
            .unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string());
        let mut text_bindings = vec![(NEGATIVE_PROMPT, negative)];
        for (token, value) in [
            (PROMPT, self.prompt),
            (MODEL_NAME, self.model_name),
            (LORA_NAME, self.lora_name),
        ] {
            if let Some(value) = value {
                text_bindings.push((token, value));
            }
        }

        let [reference, reference2, reference3] = self.references;
        let mut images = Vec::new();
        for (token, path) in [
            (REFERENCE2, reference2.or_else(|| reference.clone())),
            (REFERENCE3, reference3.or_else(|| reference.clone())),
            (REFERENCE, reference),
            (START_FRAME, self.start_frame),
            (END_FRAME, self.end_frame),
            (POSE, self.pose),
        ] {
            if let Some(path) = path {
                images.push((token, path));
            }
        }

        let resolution = self.resolution;
        let length = self.length;
        let seed = self.seed;
        let steps = self.steps;
        let cfg = self.cfg;
        let strength = self.control_strength;

        for_each_node(&mut graph, |class_type, inputs| {
            if let Some(res) = resolution {
                if is_number(inputs, "width") && is_number(inputs, "height") {
                    inputs.insert("width".into(), res.width.into());
                    inputs.insert("height".into(), res.height.into());
                }
            }
            if let Some(frames) = length {
                set_number(inputs, "length", frames.into());
            }
            if is_sampler(class_type) {
                if let Some(seed) = seed {
                    set_number(inputs, "seed", seed.into());
                    set_number(inputs, "noise_seed", seed.into());
                }
                if let Some(steps) = steps {
                    set_number(inputs, "steps", steps.into());
                }
                if let Some(cfg) = cfg {
                    set_number(inputs, "cfg", cfg.into());
                }
            }
            if class_type == "RandomNoise" {
                if let Some(seed) = seed {
                    set_number(inputs, "noise_seed", seed.into());
                }
            }
            if class_type.starts_with("ControlNetApply") {
                if let Some(strength) = strength {
                    set_number(inputs, "strength", strength.into());
                }
            }
        });

        for_each_input(&mut graph, |_, _, _, value| substitute(value, &text_bindings));

        let mut unfilled = None;
        for_each_input(&mut graph, |node_id, _, input, value| {
            if unfilled.is_some() {
                return;
            }
            let Some(text) = value.as_str() else {
                return;
            };
            if let Some(token) = placeholders(text)
                .into_iter()
                .find(|token| !images.iter().any(|(bound, _)| bound == token))
            {
                unfilled = Some(WorkflowError::Unfilled {
                    node_id: node_id.to_string(),
                    input: input.to_string(),
                    placeholder: token.to_string(),
                });
            }
        });
        if let Some(err) = unfilled {
            return Err(err);
        }

        // Only keep image bindings the graph actually references.
        let mut used: Vec<String> = Vec::new();
        for_each_input(&mut graph, |_, _, _, value| {
            if let Some(text) = value.as_str() {
                used.extend(placeholders(text).into_iter().map(String::from));
            }
        });
        images.retain(|(token, _)| used.iter().any(|u| u == token));

        Ok(Workflow { graph, images })
    }
}

// ---- helpers ----

fn is_sampler(class_type: &str) -> bool {
    class_type.starts_with("KSampler") || class_type == "SamplerCustom"
}

fn is_number(inputs: &Map<String, Value>, key: &str) -> bool {
    inputs.get(key).is_some_and(Value::is_number)
}

/// Overwrite a literal numeric input; linked inputs are left alone.
fn set_number(inputs: &mut Map<String, Value>, key: &str, value: Value) {
    if is_number(inputs, key) {
        inputs.insert(key.to_string(), value);
    }
}

fn for_each_node(graph: &mut Value, mut f: impl FnMut(&str, &mut Map<String, Value>)) {
    let Some(nodes) = graph.as_object_mut() else {
        return;
    };
    for node in nodes.values_mut() {
        let class_type = node
            .get("class_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
            f(&class_type, inputs);
        }
    }
}

fn for_each_input(graph: &mut Value, mut f: impl FnMut(&str, &str, &str, &mut Value)) {
    let Some(nodes) = graph.as_object_mut() else {
        return;
    };
    for (node_id, node) in nodes.iter_mut() {
        let class_type = node
            .get("class_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
            for (name, value) in inputs.iter_mut() {
                f(node_id, &class_type, name, value);
            }
        }
    }
}

fn substitute<S: AsRef<str>>(value: &mut Value, bindings: &[(&str, S)]) {
    let Value::String(text) = value else {
        return;
    };
    for (token, replacement) in bindings {
        if text.contains(token) {
            *text = text.replace(token, replacement.as_ref());
        }
    }
}

/// Every `{{...}}` token in `text`, in order.
fn placeholders(text: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        found.push(&rest[start..start + len + 2]);
        rest = &rest[start + len + 2..];
    }
    found
}
