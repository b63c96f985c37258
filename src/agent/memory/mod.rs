use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::agent::tools::base::{ExecutionContext, Tool};
use crate::errors::IronloomError;
use crate::providers::base::{FailureKind, ToolOutcome};

/// Persistent key/path store the agent uses as long-term memory. The core
/// treats it as opaque storage; all semantics live behind this trait.
#[async_trait]
pub trait PathStore: Send + Sync {
    async fn view(&self, path: &str) -> Result<String, IronloomError>;
    async fn create(&self, path: &str, content: &str) -> Result<(), IronloomError>;
    async fn update(&self, path: &str, content: &str) -> Result<(), IronloomError>;
    async fn delete(&self, path: &str) -> Result<(), IronloomError>;
}

/// Filesystem-backed store rooted at a directory. Paths are relative to the
/// root; anything escaping it is rejected before touching the disk.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, IronloomError> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return Err(IronloomError::Config(format!(
                "memory path must be relative: '{path}'"
            )));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(IronloomError::Config(format!(
                        "memory path escapes the store root: '{path}'"
                    )));
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl PathStore for FsStore {
    async fn view(&self, path: &str) -> Result<String, IronloomError> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read '{path}': {e}").into())
    }

    async fn create(&self, path: &str, content: &str) -> Result<(), IronloomError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!("cannot create '{path}': {e}"))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| anyhow::anyhow!("cannot create '{path}': {e}").into())
    }

    async fn update(&self, path: &str, content: &str) -> Result<(), IronloomError> {
        let full = self.resolve(path)?;
        if !tokio::fs::try_exists(&full)
            .await
            .map_err(|e| anyhow::anyhow!("cannot stat '{path}': {e}"))?
        {
            return Err(anyhow::anyhow!("cannot update '{path}': no such entry").into());
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| anyhow::anyhow!("cannot update '{path}': {e}").into())
    }

    async fn delete(&self, path: &str) -> Result<(), IronloomError> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| anyhow::anyhow!("cannot delete '{path}': {e}").into())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase", tag = "action")]
enum MemoryAction {
    View { path: String },
    Create { path: String, content: String },
    Update { path: String, content: String },
    Delete { path: String },
}

/// Tool wrapper exposing a [`PathStore`] to the model.
pub struct MemoryTool<S: PathStore> {
    store: S,
}

impl<S: PathStore> MemoryTool<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: PathStore> Tool for MemoryTool<S> {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "Persistent memory store. Actions: view, create, update, delete. \
         Paths are relative, e.g. 'notes/project.md'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["view", "create", "update", "delete"]
                },
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["action", "path"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> ToolOutcome {
        let action: MemoryAction = match serde_json::from_value(args) {
            Ok(action) => action,
            Err(e) => {
                return ToolOutcome::failure(
                    FailureKind::InvalidArguments,
                    format!("invalid memory arguments: {e}"),
                );
            }
        };

        let result = match &action {
            MemoryAction::View { path } => self.store.view(path).await,
            MemoryAction::Create { path, content } => self
                .store
                .create(path, content)
                .await
                .map(|()| format!("created '{path}'")),
            MemoryAction::Update { path, content } => self
                .store
                .update(path, content)
                .await
                .map(|()| format!("updated '{path}'")),
            MemoryAction::Delete { path } => self
                .store
                .delete(path)
                .await
                .map(|()| format!("deleted '{path}'")),
        };

        match result {
            Ok(payload) => {
                debug!("memory action completed: {action:?}");
                ToolOutcome::success(payload)
            }
            // Path rejections are argument errors the model can correct;
            // everything else reads as a missing entry.
            Err(e @ IronloomError::Config(_)) => {
                ToolOutcome::failure(FailureKind::InvalidArguments, e.to_string())
            }
            Err(e) => ToolOutcome::failure(FailureKind::NotFound, e.to_string()),
        }
    }
}
