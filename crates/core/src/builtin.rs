//! Built-in workflow definitions registered at startup.

use serde_json::json;

use crate::workflow::{ParameterKind, ParameterSpec, WorkflowDefinition};

pub const BASIC_TEXTURE: &str = "basic_texture";
pub const PBR_MATERIAL: &str = "pbr_material";

/// Texture map types a generation request may ask for.
pub const MAP_TYPES: [&str; 6] = [
    "diffuse",
    "normal",
    "roughness",
    "metallic",
    "height",
    "ambient_occlusion",
];

pub const DEFAULT_MODEL: &str = "stable-diffusion-xl";

/// Parameters shared by every texture workflow.
fn texture_parameters() -> Vec<ParameterSpec> {
    vec![
        ParameterSpec::new("prompt", ParameterKind::String)
            .required()
            .with_range(Some(1.0), Some(1000.0))
            .describe("Text description of the texture"),
        ParameterSpec::new("negative_prompt", ParameterKind::String)
            .with_default(json!(""))
            .with_range(None, Some(1000.0))
            .describe("Things the texture should avoid"),
        ParameterSpec::new("size", ParameterKind::Dimensions)
            .with_default(json!([1024, 1024]))
            .with_range(Some(64.0), Some(4096.0))
            .describe("Output size as [width, height] in pixels"),
        ParameterSpec::new("steps", ParameterKind::Integer)
            .with_default(json!(20))
            .with_range(Some(1.0), Some(150.0))
            .describe("Sampling steps"),
        ParameterSpec::new("cfg", ParameterKind::Number)
            .with_default(json!(7.0))
            .with_range(Some(1.0), Some(30.0))
            .describe("Classifier-free guidance scale"),
        ParameterSpec::new("seed", ParameterKind::Integer)
            .with_range(Some(0.0), None)
            .describe("Sampler seed; random when omitted"),
        ParameterSpec::new("model_name", ParameterKind::String)
            .with_default(json!(DEFAULT_MODEL))
            .with_pattern(r"^[A-Za-z0-9._-]+$")
            .describe("Checkpoint name without extension"),
    ]
}

pub fn builtin_workflows() -> Vec<WorkflowDefinition> {
    let mut pbr_parameters = texture_parameters();
    pbr_parameters.push(
        ParameterSpec::new("maps", ParameterKind::StringList)
            .with_default(json!(["diffuse", "normal", "roughness"]))
            .with_range(Some(1.0), Some(MAP_TYPES.len() as f64))
            .with_allowed(MAP_TYPES)
            .describe("Texture maps to generate"),
    );

    vec![
        WorkflowDefinition {
            name: BASIC_TEXTURE.to_string(),
            title: "Basic Texture Generation".to_string(),
            category: "texture".to_string(),
            description: "Generate a single diffuse texture from a text prompt".to_string(),
            parameters: texture_parameters(),
            required_models: vec![DEFAULT_MODEL.to_string()],
        },
        WorkflowDefinition {
            name: PBR_MATERIAL.to_string(),
            title: "PBR Material Set".to_string(),
            category: "material".to_string(),
            description: "Generate a set of PBR texture maps (diffuse, normal, roughness, ...)"
                .to_string(),
            parameters: pbr_parameters,
            required_models: vec![DEFAULT_MODEL.to_string()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::validation::validate_parameters;

    #[test]
    fn basic_texture_accepts_the_reference_request() {
        let workflows = builtin_workflows();
        let basic = workflows.iter().find(|w| w.name == BASIC_TEXTURE).unwrap();

        let resolved = validate_parameters(
            basic,
            &json!({"prompt": "red brick wall texture", "size": [512, 512]}),
        )
        .unwrap();

        assert_eq!(resolved["size"], json!([512, 512]));
        assert_eq!(resolved["steps"], json!(20));
        assert_eq!(resolved["model_name"], json!(DEFAULT_MODEL));
        assert!(!resolved.contains_key("seed"));
        assert!(!resolved.contains_key("maps"));
    }

    #[test]
    fn basic_texture_requires_prompt() {
        let workflows = builtin_workflows();
        let basic = workflows.iter().find(|w| w.name == BASIC_TEXTURE).unwrap();

        let errors = validate_parameters(basic, &json!({"size": [512, 512]})).unwrap_err();
        assert!(errors.mentions("prompt"));
    }

    #[test]
    fn pbr_material_defaults_three_maps() {
        let workflows = builtin_workflows();
        let pbr = workflows.iter().find(|w| w.name == PBR_MATERIAL).unwrap();

        let resolved = validate_parameters(pbr, &json!({"prompt": "rusty metal"})).unwrap();
        assert_eq!(resolved["maps"], json!(["diffuse", "normal", "roughness"]));
    }

    #[test]
    fn pbr_material_rejects_unknown_map() {
        let workflows = builtin_workflows();
        let pbr = workflows.iter().find(|w| w.name == PBR_MATERIAL).unwrap();

        let errors =
            validate_parameters(pbr, &json!({"prompt": "x", "maps": ["emissive"]})).unwrap_err();
        assert_eq!(errors.violations().len(), 1);
        assert_eq!(errors.violations()[0].rule_type, "enum");
    }
}
