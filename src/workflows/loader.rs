//! Resolution of named schemas.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::schema::{SchemaError, WorkflowSchema};

/// Resolves a workflow name and version to its schema.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait SchemaLoader: Send + Sync {
    async fn load(&self, name: &str, version: &str) -> Result<WorkflowSchema, SchemaError>;
}

/// Reads `<dir>/<name>@<version>.{yaml,yml,json}`, then falls back to the
/// unversioned `<dir>/<name>.{yaml,yml,json}` when its version matches.
#[derive(Debug, Clone)]
pub struct FileSchemaLoader {
    dir: PathBuf,
}

impl FileSchemaLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_first(&self, stem: &str) -> Result<Option<WorkflowSchema>, SchemaError> {
        for extension in ["yaml", "yml", "json"] {
            let path = self.dir.join(format!("{}.{}", stem, extension));
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            debug!(schema = %stem, file = ?path, "Loading workflow schema");
            let schema = if extension == "json" {
                WorkflowSchema::from_json_str(&contents)?
            } else {
                WorkflowSchema::from_yaml_str(&contents)?
            };
            return Ok(Some(schema));
        }
        Ok(None)
    }
}

fn is_plain_component(value: &str) -> bool {
    !value.is_empty() && !value.contains(['/', '\\']) && !value.starts_with('.')
}

#[async_trait::async_trait]
impl SchemaLoader for FileSchemaLoader {
    async fn load(&self, name: &str, version: &str) -> Result<WorkflowSchema, SchemaError> {
        let versioned = format!("{}@{}", name, version);
        let not_found = || SchemaError::NotFound {
            name: versioned.clone(),
        };
        if !is_plain_component(name) || !is_plain_component(version) {
            return Err(not_found());
        }

        if let Some(schema) = self.read_first(&versioned).await? {
            return Ok(schema);
        }
        match self.read_first(name).await? {
            Some(schema) if schema.version == version => Ok(schema),
            Some(schema) => {
                debug!(schema = %name, found = %schema.version, wanted = %version, "Unversioned schema has another version");
                Err(not_found())
            }
            None => Err(not_found()),
        }
    }
}
