//! Static resource registry.
//!
//! Resources are fixed at startup. The built-in set exposes the persistent
//! shell's working directory as `shell://cwd`.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::shell::ShellManager;
use crate::Result;

/// URI of the working-directory resource.
pub const CWD_URI: &str = "shell://cwd";

/// Produces the current text of a resource.
pub trait ResourceReader: Send + Sync + Debug {
    /// Read the resource body.
    fn read(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;
}

/// A registered resource.
#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    /// `resources/list` metadata.
    pub descriptor: ResourceDescriptor,
    /// Body producer.
    pub reader: Arc<dyn ResourceReader>,
}

/// `resources/list` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Resource URI.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// What the resource contains.
    pub description: String,
    /// Content type of the body.
    pub mime_type: String,
}

/// One element of a `resources/read` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    /// Resource URI.
    pub uri: String,
    /// Content type of `text`.
    pub mime_type: String,
    /// Body.
    pub text: String,
}

/// Immutable URI-to-resource table.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    resources: Vec<ResourceDefinition>,
}

impl ResourceRegistry {
    /// Build a registry from definitions.
    #[must_use]
    pub fn new(resources: Vec<ResourceDefinition>) -> Self {
        Self { resources }
    }

    /// Registry with the built-in shell resources.
    #[must_use]
    pub fn builtin(shell: &Arc<ShellManager>) -> Self {
        Self::new(vec![ResourceDefinition {
            descriptor: ResourceDescriptor {
                uri: CWD_URI.to_owned(),
                name: "Shell working directory".to_owned(),
                description: "Current working directory of the persistent shell".to_owned(),
                mime_type: "text/plain".to_owned(),
            },
            reader: Arc::new(CwdResource {
                shell: Arc::clone(shell),
            }),
        }])
    }

    /// Metadata for every resource, in registration order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ResourceDescriptor> {
        self.resources.iter().map(|r| r.descriptor.clone()).collect()
    }

    /// Exact-URI lookup.
    #[must_use]
    pub fn get(&self, uri: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.descriptor.uri == uri)
    }
}

impl ResourceDefinition {
    /// Read the body and wrap it for the wire.
    ///
    /// # Errors
    ///
    /// Propagates the reader's failure.
    pub async fn contents(&self) -> Result<ResourceContents> {
        let text = self.reader.read().await?;
        Ok(ResourceContents {
            uri: self.descriptor.uri.clone(),
            mime_type: self.descriptor.mime_type.clone(),
            text,
        })
    }
}

/// `shell://cwd`: the session's working directory.
#[derive(Debug)]
pub struct CwdResource {
    shell: Arc<ShellManager>,
}

impl ResourceReader for CwdResource {
    fn read(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            let cwd = self.shell.pwd().await?;
            Ok(cwd.to_string_lossy().into_owned())
        })
    }
}
