//! Texture generation requests and ComfyUI graph construction.
//!
//! A [`TextureRequest`] is decoded from a task's resolved parameters.
//! Each requested map becomes its own ComfyUI prompt graph whose positive
//! prompt is tuned for the map type.

use miktos_core::builtin::DEFAULT_MODEL;
use miktos_core::task::OutputRef;
use miktos_core::types::TaskId;
use miktos_core::validation::ResolvedParameters;
use miktos_core::workflow::{ParameterKind, WorkflowDefinition};
use serde::Serialize;
use serde_json::{json, Value};

use crate::executor::{ExecutionError, ExecutorKind};

/// Map generated when a workflow does not ask for specific maps.
pub const DEFAULT_MAP: &str = "diffuse";

/// Id of the `SaveImage` node in [`build_texture_graph`] output.
pub const SAVE_NODE_ID: &str = "7";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextureRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f64,
    pub seed: u64,
    pub model_name: String,
    pub maps: Vec<String>,
}

impl TextureRequest {
    /// Decode from validated parameters. A missing `seed` is drawn at
    /// random so the value actually used can be reported in metadata.
    pub fn from_params(params: &ResolvedParameters) -> Result<Self, ExecutionError> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionError::Internal("resolved parameters lack 'prompt'".into()))?
            .to_string();

        let (width, height) = match params.get("size").and_then(Value::as_array) {
            Some(dims) if dims.len() == 2 => (dimension(&dims[0])?, dimension(&dims[1])?),
            Some(_) => {
                return Err(ExecutionError::Internal("'size' must have two components".into()))
            }
            None => (1024, 1024),
        };

        let maps = match params.get("maps").and_then(Value::as_array) {
            Some(maps) => maps
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => vec![DEFAULT_MAP.to_string()],
        };
        if maps.is_empty() {
            return Err(ExecutionError::Internal("no texture maps requested".into()));
        }

        Ok(Self {
            prompt,
            negative_prompt: str_param(params, "negative_prompt").unwrap_or_default(),
            width,
            height,
            steps: params
                .get("steps")
                .and_then(Value::as_u64)
                .map_or(20, |s| s.min(u64::from(u32::MAX)) as u32),
            cfg: params.get("cfg").and_then(Value::as_f64).unwrap_or(7.0),
            seed: params
                .get("seed")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| u64::from(rand::random::<u32>())),
            model_name: str_param(params, "model_name").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            maps,
        })
    }

    /// Generation metadata attached to the task result.
    pub fn metadata(&self, task_id: TaskId, executor: ExecutorKind, outputs: &[OutputRef]) -> Value {
        let output_paths: serde_json::Map<String, Value> = outputs
            .iter()
            .filter_map(|o| Some((o.map_type.clone()?, Value::String(o.location.clone()))))
            .collect();

        json!({
            "job_id": task_id,
            "prompt": self.prompt,
            "negative_prompt": self.negative_prompt,
            "size": [self.width, self.height],
            "maps": self.maps,
            "steps": self.steps,
            "cfg": self.cfg,
            "seed": self.seed,
            "model_name": self.model_name,
            "executor": executor,
            "generated_at": chrono::Utc::now(),
            "output_paths": output_paths,
        })
    }
}

/// Parameters a texture workflow may declare, with the kind each must have.
const TEXTURE_PARAMETERS: &[(&str, &[ParameterKind])] = &[
    ("prompt", &[ParameterKind::String]),
    ("negative_prompt", &[ParameterKind::String]),
    ("model_name", &[ParameterKind::String]),
    ("size", &[ParameterKind::Dimensions]),
    ("steps", &[ParameterKind::Integer]),
    ("cfg", &[ParameterKind::Number, ParameterKind::Integer]),
    ("seed", &[ParameterKind::Integer]),
    ("maps", &[ParameterKind::StringList]),
];

/// Check that every task validated against `definition` decodes into a
/// [`TextureRequest`], which is the only request shape the executors run.
///
/// The definition must declare a `prompt` string that is required or has
/// a string default, and the texture parameters it declares must have
/// the expected kinds.
pub fn check_texture_workflow(definition: &WorkflowDefinition) -> Result<(), String> {
    let prompt = definition
        .parameter("prompt")
        .ok_or_else(|| "texture workflows need a 'prompt' parameter".to_string())?;
    if !prompt.required && !prompt.default.as_ref().is_some_and(Value::is_string) {
        return Err("'prompt' must be required or have a string default".to_string());
    }

    for (name, kinds) in TEXTURE_PARAMETERS {
        let Some(spec) = definition.parameter(name) else {
            continue;
        };
        if !kinds.contains(&spec.kind) {
            return Err(format!("'{name}' must be of kind {}, not {}", kinds[0], spec.kind));
        }
    }
    if let Some(maps) = definition.parameter("maps") {
        if !maps.min.is_some_and(|min| min >= 1.0) {
            return Err("'maps' must declare a minimum of at least 1 item".to_string());
        }
    }
    Ok(())
}

fn str_param(params: &ResolvedParameters, name: &str) -> Option<String> {
    params.get(name).and_then(Value::as_str).map(str::to_string)
}

fn dimension(value: &Value) -> Result<u32, ExecutionError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ExecutionError::Internal(format!("invalid size component {value}")))
}

/// Tune the positive prompt for a texture map type. Unknown map types
/// keep the base prompt.
pub fn adjust_prompt_for_map(prompt: &str, map_type: &str) -> String {
    let suffix = match map_type {
        "normal" => "normal map, surface details, purple and blue tones",
        "roughness" => "roughness map, surface roughness, grayscale",
        "metallic" => "metallic map, metal reflectance, grayscale",
        "height" => "height map, displacement, grayscale",
        "ambient_occlusion" => "ambient occlusion, shadow detail, grayscale",
        _ => return prompt.to_string(),
    };
    format!("{prompt}, {suffix}")
}

/// Build the ComfyUI API-format graph that renders one texture map.
///
/// Nodes: positive/negative `CLIPTextEncode` (1, 2), `KSampler` (3),
/// `CheckpointLoaderSimple` (4), `EmptyLatentImage` (5), `VAEDecode` (6)
/// and `SaveImage` (7).
pub fn build_texture_graph(request: &TextureRequest, map_type: &str) -> Value {
    json!({
        "1": {
            "class_type": "CLIPTextEncode",
            "inputs": {
                "text": adjust_prompt_for_map(&request.prompt, map_type),
                "clip": ["4", 1]
            }
        },
        "2": {
            "class_type": "CLIPTextEncode",
            "inputs": {
                "text": request.negative_prompt,
                "clip": ["4", 1]
            }
        },
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": request.seed,
                "steps": request.steps,
                "cfg": request.cfg,
                "sampler_name": "euler",
                "scheduler": "normal",
                "denoise": 1.0,
                "model": ["4", 0],
                "positive": ["1", 0],
                "negative": ["2", 0],
                "latent_image": ["5", 0]
            }
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": {
                "ckpt_name": format!("{}.safetensors", request.model_name)
            }
        },
        "5": {
            "class_type": "EmptyLatentImage",
            "inputs": {
                "width": request.width,
                "height": request.height,
                "batch_size": 1
            }
        },
        "6": {
            "class_type": "VAEDecode",
            "inputs": {
                "samples": ["3", 0],
                "vae": ["4", 2]
            }
        },
        SAVE_NODE_ID: {
            "class_type": "SaveImage",
            "inputs": {
                "filename_prefix": format!("texture_{map_type}"),
                "images": ["6", 0]
            }
        }
    })
}
