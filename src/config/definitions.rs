//! Job definition files.
//!
//! Each project is described by one YAML file named after it
//! (`<project>.yaml`):
//!
//! ```yaml
//! jobs:
//!   - name: nightly-backup
//!     schedule: "0 3 * * *"
//!     payload:
//!       command: backup.sh
//!       args: ["--full"]
//! ```
//!
//! The revision of every definition in a file is the SHA-256 of the file
//! contents, so any edit to the file counts as a new revision for all of its
//! jobs. Payloads are handed to the engine as JSON bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

use super::ConfigError;
use crate::core::schedule::Schedule;
use crate::core::types::{JobId, ProjectId};
use crate::engine::JobDefinition;

/// Contents of a project file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectFile {
    /// Jobs of the project.
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

/// One job in a project file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    /// Job name, unique within the project.
    pub name: String,
    /// Cron expression or shortcut.
    pub schedule: String,
    /// Payload for the executor.
    #[serde(default)]
    pub payload: serde_yaml::Value,
}

/// Definitions loaded from one project file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDefinitions {
    /// Project the file describes.
    pub project: ProjectId,
    /// Revision shared by every definition of the file.
    pub revision: String,
    /// Job definitions.
    pub definitions: Vec<JobDefinition>,
}

/// Parse the contents of a project file.
pub fn parse_project_file(
    project: &ProjectId,
    content: &str,
) -> Result<ProjectDefinitions, ConfigError> {
    if project.as_str().is_empty() || project.as_str().contains('/') {
        return Err(ConfigError::InvalidConfig(format!(
            "invalid project name '{}'",
            project
        )));
    }

    let file: ProjectFile = serde_yaml::from_str(content)?;
    let revision = hex::encode(Sha256::digest(content.as_bytes()));

    let mut names = HashSet::new();
    let mut definitions = Vec::with_capacity(file.jobs.len());
    for entry in file.jobs {
        if entry.name.is_empty() {
            return Err(ConfigError::MissingField("name".into()));
        }
        if entry.name.contains('/') {
            return Err(ConfigError::InvalidConfig(format!(
                "job name '{}' cannot contain '/'",
                entry.name
            )));
        }
        if !names.insert(entry.name.clone()) {
            return Err(ConfigError::InvalidConfig(format!(
                "duplicate job name: {}",
                entry.name
            )));
        }
        Schedule::parse(entry.schedule.as_str()).map_err(|e| {
            ConfigError::InvalidConfig(format!("job '{}': {}", entry.name, e))
        })?;

        let payload =
            serde_json::to_vec(&entry.payload).map_err(|source| ConfigError::PayloadError {
                job: entry.name.clone(),
                source,
            })?;
        definitions.push(JobDefinition {
            job_id: JobId::from_parts(project, &entry.name),
            revision: revision.clone(),
            schedule: entry.schedule,
            payload,
        });
    }

    Ok(ProjectDefinitions {
        project: project.clone(),
        revision,
        definitions,
    })
}

/// Load every project file from a directory, sorted by project.
pub fn load_definitions_from_directory(
    dir: impl AsRef<Path>,
) -> Result<Vec<ProjectDefinitions>, ConfigError> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::DirReadError {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut projects = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::DirReadError {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();

        // Only process .yaml and .yml files
        let Some(ext) = path.extension() else {
            continue;
        };
        if ext != "yaml" && ext != "yml" {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let content =
            std::fs::read_to_string(&path).map_err(|source| ConfigError::FileReadError {
                path: path.clone(),
                source,
            })?;
        let project = ProjectId::new(stem);
        let loaded = parse_project_file(&project, &content).map_err(|e| match e {
            ConfigError::YamlError(source) => ConfigError::YamlFileError {
                path: path.clone(),
                source,
            },
            other => other,
        })?;
        projects.push(loaded);
    }

    projects.sort_by(|a, b| a.project.cmp(&b.project));
    Ok(projects)
}
