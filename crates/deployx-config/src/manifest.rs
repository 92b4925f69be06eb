//! Pipeline manifest parsing.
//!
//! A manifest is an ordered list of named steps:
//!
//! ```kdl
//! step "install" { run "npm ci" }
//! step "test" run="npm test"
//! ```
//!
//! A step with several `run` children executes them in one shell, joined
//! with `&&`.

use async_trait::async_trait;
use deployx_core::manifest::{ManifestSource, validate_steps};
use deployx_core::{Repository, Step};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

use crate::{ConfigError, ConfigResult};

/// Default manifest file name.
pub const DEFAULT_MANIFEST: &str = ".deployx.kdl";

/// Parse a manifest from KDL text into its ordered steps.
pub fn parse_manifest(kdl: &str) -> ConfigResult<Vec<Step>> {
    let doc: KdlDocument = kdl.parse()?;

    let mut steps = Vec::new();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "step" => {
                let step = parse_step(node)?;
                if !seen.insert(step.name.clone()) {
                    return Err(ConfigError::Duplicate(format!("step '{}'", step.name)));
                }
                steps.push(step);
            }
            // `pipeline { ... }` groups steps under an optional name
            "pipeline" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        if child.name().value() == "step" {
                            let step = parse_step(child)?;
                            if !seen.insert(step.name.clone()) {
                                return Err(ConfigError::Duplicate(format!(
                                    "step '{}'",
                                    step.name
                                )));
                            }
                            steps.push(step);
                        }
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if steps.is_empty() {
        return Err(ConfigError::EmptyManifest);
    }

    Ok(steps)
}

fn parse_step(node: &KdlNode) -> ConfigResult<Step> {
    let name = get_first_string_arg(node)
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;

    let mut commands = Vec::new();
    if let Some(cmd) = get_string_prop(node, "run") {
        commands.push(cmd);
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "run" {
                commands.extend(get_all_string_args(child));
            }
        }
    }

    commands.retain(|c| !c.trim().is_empty());
    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run command for step '{}'",
            name
        )));
    }

    Ok(Step {
        name,
        command: commands.join(" && "),
    })
}

/// Loads the manifest from a file on the server's filesystem.
pub struct FileManifestSource {
    path: PathBuf,
}

impl FileManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn load(
        &self,
        repository: &Repository,
        branch: &str,
        _commit_id: Option<&str>,
    ) -> deployx_core::Result<Vec<Step>> {
        debug!(
            repository = %repository.name,
            branch = %branch,
            path = %self.path.display(),
            "Loading pipeline manifest"
        );

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(ConfigError::from)?;
        let steps = parse_manifest(&content)?;
        validate_steps(&steps)?;
        Ok(steps)
    }
}

// Helper functions for extracting values from KDL nodes

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ordered_steps() {
        let kdl = r#"
            step "install" {
                run "npm ci"
            }
            step "test" run="npm test"
            step "build" {
                run "npm run lint"
                run "npm run build"
            }
        "#;

        let steps = parse_manifest(kdl).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::new("install", "npm ci"),
                Step::new("test", "npm test"),
                Step::new("build", "npm run lint && npm run build"),
            ]
        );
    }

    #[test]
    fn test_parse_steps_inside_pipeline_block() {
        let kdl = r#"
            pipeline "web" {
                step "build" run="make"
                step "deploy" run="make deploy"
            }
        "#;

        let steps = parse_manifest(kdl).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].name, "deploy");
    }

    #[test]
    fn test_empty_manifest() {
        let result = parse_manifest("// nothing here\n");
        assert!(matches!(result, Err(ConfigError::EmptyManifest)));
    }

    #[test]
    fn test_step_without_command() {
        let result = parse_manifest(r#"step "build""#);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_duplicate_step_names() {
        let kdl = r#"
            step "build" run="make"
            step "build" run="make again"
        "#;
        assert!(matches!(
            parse_manifest(kdl),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_config_error_maps_to_validation() {
        let err: deployx_core::Error = ConfigError::EmptyManifest.into();
        assert!(matches!(err, deployx_core::Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_file_manifest_source() {
        let path = std::env::temp_dir().join(format!("deployx-manifest-{}.kdl", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "step \"build\" run=\"make\"\n")
            .await
            .unwrap();

        let now = chrono::Utc::now();
        let repository = Repository {
            id: deployx_core::RepositoryId::new(),
            name: "widgets".to_string(),
            url: "https://example.com/widgets.git".to_string(),
            description: None,
            created_at: now,
            updated_at: now,
        };

        let source = FileManifestSource::new(&path);
        let steps = source.load(&repository, "main", None).await.unwrap();
        assert_eq!(steps, vec![Step::new("build", "make")]);

        tokio::fs::remove_file(&path).await.unwrap();

        let missing = source.load(&repository, "main", None).await.unwrap_err();
        assert!(matches!(missing, deployx_core::Error::Validation(_)));
    }
}
