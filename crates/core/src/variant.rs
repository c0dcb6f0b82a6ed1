//! Workflow variants and their pre-submission hooks.
//!
//! Each variant is one template family with its own node addresses.
//! Everything else about running a job (submission, progress, artifact
//! retrieval) is shared; the only variant-specific steps are the binding
//! table, parameter normalization, and input-image preparation.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde_json::Value;

use crate::binder::{self, Binding, DefaultValue, FieldAddr};
use crate::error::CoreError;
use crate::params::{ParamValue, ParameterRecord};
use crate::workflow::WorkflowGraph;

/// Accepted input image extensions (lower-case, without the dot).
pub const VALID_INPUT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

/// Node addresses checked first for the image-to-image input image.
pub const IMAGE_INPUT_CANDIDATES: &[&str] = &["2", "3", "10", "82", "image_loader"];

/// Square size bounds for the three-views template.
pub const THREE_VIEWS_MIN_SIZE: i64 = 512;
pub const THREE_VIEWS_MAX_SIZE: i64 = 2048;

macro_rules! at {
    ($node:literal, $field:literal) => {
        FieldAddr {
            node: $node,
            field: $field,
        }
    };
}

macro_rules! lora_bindings {
    ($node:literal) => {
        [
            Binding::plain("lora_01", &[at!($node, "lora_01")], DefaultValue::Text("None")),
            Binding::plain("strength_01", &[at!($node, "strength_01")], DefaultValue::Float(0.8)),
            Binding::plain("lora_02", &[at!($node, "lora_02")], DefaultValue::Text("None")),
            Binding::plain("strength_02", &[at!($node, "strength_02")], DefaultValue::Float(0.8)),
            Binding::plain("lora_03", &[at!($node, "lora_03")], DefaultValue::Text("None")),
            Binding::plain("strength_03", &[at!($node, "strength_03")], DefaultValue::Int(1)),
            Binding::plain("lora_04", &[at!($node, "lora_04")], DefaultValue::Text("None")),
            Binding::plain("strength_04", &[at!($node, "strength_04")], DefaultValue::Int(1)),
        ]
    };
}

const DEFAULT_UNET: &str = "FLUX/flux-dev.safetensors";
const DEFAULT_CLIP_1: &str = "flux/t5xxl_fp16.safetensors";
const DEFAULT_CLIP_2: &str = "flux/clip_l.safetensors";
const DEFAULT_VAE: &str = "flux/ae.safetensors";
const DEFAULT_CONTROLNET: &str = "flux/Shakker-Labs/diffusion_pytorch_model.safetensors";

static TEXT_TO_IMAGE_BASE: [Binding; 16] = [
    Binding::plain("width", &[at!("1", "width")], DefaultValue::Int(512)),
    Binding::plain("height", &[at!("1", "height")], DefaultValue::Int(512)),
    Binding::plain("image_name", &[at!("303", "text")], DefaultValue::Text("")),
    Binding::plain("sampler_name", &[at!("8", "sampler_name")], DefaultValue::Text("euler")),
    Binding::plain("scheduler", &[at!("9", "scheduler")], DefaultValue::Text("simple")),
    Binding::plain("steps", &[at!("9", "steps")], DefaultValue::Int(20)),
    Binding::plain("denoise", &[at!("9", "denoise")], DefaultValue::Int(1)),
    Binding::plain(
        "noise_seed",
        &[at!("11", "noise_seed"), at!("79", "noise_seed")],
        DefaultValue::Int(0),
    ),
    Binding::plain("guidance", &[at!("14", "guidance")], DefaultValue::Float(3.5)),
    Binding::plain("unet_name", &[at!("6", "unet_name")], DefaultValue::Text(DEFAULT_UNET)),
    Binding::plain("clip_name1", &[at!("5", "clip_name1")], DefaultValue::Text(DEFAULT_CLIP_1)),
    Binding::plain("clip_name2", &[at!("5", "clip_name2")], DefaultValue::Text(DEFAULT_CLIP_2)),
    Binding::plain("vae_name", &[at!("4", "vae_name")], DefaultValue::Text(DEFAULT_VAE)),
    Binding::plain("face_prompt", &[at!("33", "text")], DefaultValue::Text("")),
    Binding::plain("clothes_prompt", &[at!("36", "text")], DefaultValue::Text("")),
    Binding::plain("environment_prompt", &[at!("37", "text")], DefaultValue::Text("")),
];
static TEXT_TO_IMAGE_LORAS: [Binding; 8] = lora_bindings!("12");

static IMAGE_TO_IMAGE_BASE: [Binding; 16] = [
    Binding::plain("image_name", &[at!("303", "text")], DefaultValue::Text("")),
    Binding::plain("width", &[at!("1", "width")], DefaultValue::Int(512)),
    Binding::plain("height", &[at!("1", "height")], DefaultValue::Int(512)),
    Binding::plain("sampler_name", &[at!("77", "sampler_name")], DefaultValue::Text("euler")),
    Binding::plain("scheduler", &[at!("78", "scheduler")], DefaultValue::Text("simple")),
    Binding::plain("steps", &[at!("78", "steps")], DefaultValue::Int(20)),
    Binding::plain("redraw_strength", &[at!("94", "string")], DefaultValue::Float(0.75))
        .stringified(),
    Binding::plain("noise_seed", &[at!("79", "noise_seed")], DefaultValue::Int(0)),
    Binding::plain("guidance", &[at!("80", "guidance")], DefaultValue::Float(3.5)),
    Binding::plain("unet_name", &[at!("87", "unet_name")], DefaultValue::Text(DEFAULT_UNET)),
    Binding::plain("clip_name1", &[at!("75", "clip_name1")], DefaultValue::Text(DEFAULT_CLIP_1)),
    Binding::plain("clip_name2", &[at!("75", "clip_name2")], DefaultValue::Text(DEFAULT_CLIP_2)),
    Binding::plain("vae_name", &[at!("84", "vae_name")], DefaultValue::Text(DEFAULT_VAE)),
    Binding::plain("face_prompt", &[at!("150", "text")], DefaultValue::Text("")),
    Binding::plain("clothes_prompt", &[at!("151", "text")], DefaultValue::Text("")),
    Binding::plain("environment_prompt", &[at!("152", "text")], DefaultValue::Text("")),
];
static IMAGE_TO_IMAGE_LORAS: [Binding; 8] = lora_bindings!("88");

static THREE_VIEWS_BASE: [Binding; 16] = [
    Binding::plain("image_name", &[at!("25", "string")], DefaultValue::Text(""))
        .auto_create("Simple String"),
    Binding::plain("pose_image", &[at!("10", "image")], DefaultValue::Text("")),
    Binding::plain("prompt", &[at!("18", "text")], DefaultValue::Text(""))
        .auto_create("CLIPTextEncode"),
    Binding::plain(
        "controlnet_name",
        &[at!("12", "control_net_name")],
        DefaultValue::Text(DEFAULT_CONTROLNET),
    ),
    Binding::plain(
        "width",
        &[at!("21", "width"), at!("23", "width"), at!("24", "width")],
        DefaultValue::Int(1280),
    ),
    Binding::plain(
        "height",
        &[at!("21", "height"), at!("23", "height"), at!("24", "height")],
        DefaultValue::Int(1280),
    ),
    Binding::plain("unet_name", &[at!("13", "unet_name")], DefaultValue::Text(DEFAULT_UNET)),
    Binding::plain("clip_name1", &[at!("14", "clip_name1")], DefaultValue::Text(DEFAULT_CLIP_1)),
    Binding::plain("clip_name2", &[at!("14", "clip_name2")], DefaultValue::Text(DEFAULT_CLIP_2)),
    Binding::plain("vae_name", &[at!("15", "vae_name")], DefaultValue::Text(DEFAULT_VAE)),
    Binding::plain("sampler_name", &[at!("3", "sampler_name")], DefaultValue::Text("euler")),
    Binding::plain("scheduler", &[at!("2", "scheduler")], DefaultValue::Text("simple")),
    Binding::plain("steps", &[at!("2", "steps")], DefaultValue::Int(20)),
    Binding::plain("denoise", &[at!("2", "denoise")], DefaultValue::Int(1)),
    Binding::plain("noise_seed", &[at!("16", "noise_seed")], DefaultValue::Int(0)),
    Binding::plain("guidance", &[at!("8", "guidance")], DefaultValue::Float(3.5)),
];
static THREE_VIEWS_LORAS: [Binding; 8] = lora_bindings!("17");

/// The template families the front-end can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowVariant {
    TextToImage,
    ImageToImage,
    ThreeViews,
}

impl WorkflowVariant {
    pub const ALL: [WorkflowVariant; 3] = [Self::TextToImage, Self::ImageToImage, Self::ThreeViews];

    pub fn name(self) -> &'static str {
        match self {
            Self::TextToImage => "txt2img",
            Self::ImageToImage => "img2img",
            Self::ThreeViews => "three-views",
        }
    }

    /// Binding table for this variant.
    pub fn bindings(self) -> Vec<Binding> {
        let (base, loras): (&[Binding], &[Binding]) = match self {
            Self::TextToImage => (&TEXT_TO_IMAGE_BASE, &TEXT_TO_IMAGE_LORAS),
            Self::ImageToImage => (&IMAGE_TO_IMAGE_BASE, &IMAGE_TO_IMAGE_LORAS),
            Self::ThreeViews => (&THREE_VIEWS_BASE, &THREE_VIEWS_LORAS),
        };
        base.iter().chain(loras).copied().collect()
    }

    /// Write `params` into a copy of `graph`.
    pub fn bind(self, graph: &WorkflowGraph, params: &ParameterRecord) -> WorkflowGraph {
        binder::bind(graph, params, &self.bindings())
    }

    /// Read this variant's parameters back from `graph`.
    pub fn extract(self, graph: &WorkflowGraph) -> ParameterRecord {
        binder::extract(graph, &self.bindings())
    }

    /// Apply variant constraints to a record before binding.
    ///
    /// Three-views renders square images: the width is clamped to
    /// `512..=2048` and the height follows it.
    pub fn normalize_params(self, params: &mut ParameterRecord) {
        if self != Self::ThreeViews {
            return;
        }
        let Some(width) = params.get("width").and_then(ParamValue::as_i64) else {
            return;
        };
        let size = width.clamp(THREE_VIEWS_MIN_SIZE, THREE_VIEWS_MAX_SIZE);
        params.insert("width", size);
        params.insert("height", size);
    }

    /// Pre-submission hook: validate the input image (if the variant
    /// needs one) and point the graph's image-input node at it.
    ///
    /// The engine resolves image inputs by file name inside its own input
    /// folder, so only the file name is written.
    pub fn prepare_input(
        self,
        graph: &mut WorkflowGraph,
        input_image: Option<&Path>,
    ) -> Result<(), CoreError> {
        match self {
            Self::ImageToImage => {
                let path = match input_image {
                    Some(p) if p.exists() => p,
                    other => return Err(CoreError::MissingInputImage(other.map(Path::to_path_buf))),
                };
                validate_extension(path)?;
                let filename = file_name(path)?;
                attach_image_input(graph, &filename)
            }
            Self::TextToImage | Self::ThreeViews => {
                if let Some(path) = input_image.filter(|p| p.exists()) {
                    let filename = file_name(path)?;
                    let updated = attach_load_image_nodes(graph, &filename);
                    tracing::debug!(updated, filename = %filename, "Attached input image");
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for WorkflowVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkflowVariant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "txt2img" | "text-to-image" => Ok(Self::TextToImage),
            "img2img" | "image-to-image" => Ok(Self::ImageToImage),
            "three-views" | "three_views" | "3views" => Ok(Self::ThreeViews),
            other => Err(CoreError::Validation(format!("unknown workflow variant '{other}'"))),
        }
    }
}

fn validate_extension(path: &Path) -> Result<(), CoreError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if VALID_INPUT_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(CoreError::UnsupportedInputImage {
            extension,
            expected: "png, jpg, jpeg, webp, bmp",
        })
    }
}

fn file_name(path: &Path) -> Result<String, CoreError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| CoreError::MissingInputImage(Some(path.to_path_buf())))
}

/// Write `filename` into the first image input node: the known candidate
/// addresses first, then any node with an `image` field.
fn attach_image_input(graph: &mut WorkflowGraph, filename: &str) -> Result<(), CoreError> {
    let value = Value::String(filename.to_string());

    for candidate in IMAGE_INPUT_CANDIDATES {
        if graph.field(candidate, "image").is_some() {
            graph.set_field(candidate, "image", value);
            return Ok(());
        }
    }

    let fallback = graph
        .nodes()
        .find(|(_, node)| node.fields.contains_key("image"))
        .map(|(id, _)| id.clone());

    match fallback {
        Some(id) => {
            graph.set_field(&id, "image", value);
            Ok(())
        }
        None => Err(CoreError::NoImageInputNode),
    }
}

/// Write `filename` into every `LoadImage` node; returns how many changed.
fn attach_load_image_nodes(graph: &mut WorkflowGraph, filename: &str) -> usize {
    let mut updated = 0;
    for (_, node) in graph.nodes_mut() {
        if node.kind == "LoadImage" && node.fields.contains_key("image") {
            node.fields
                .insert("image".to_string(), Value::String(filename.to_string()));
            updated += 1;
        }
    }
    updated
}
