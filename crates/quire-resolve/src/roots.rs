use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Root;

/// Named locations the resolver is allowed to serve from.
///
/// These always come from configuration, never from a request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Roots {
    pub document_root: PathBuf,
    pub server_root: PathBuf,
    pub cache_dir: PathBuf,
    pub config_file: PathBuf,
    pub access_log: PathBuf,
    pub error_log: PathBuf,
    pub page_log: PathBuf,
}

impl Default for Roots {
    fn default() -> Self {
        Self {
            document_root: PathBuf::from("/usr/share/quire/doc-root"),
            server_root: PathBuf::from("/etc/quire"),
            cache_dir: PathBuf::from("/var/cache/quire"),
            config_file: PathBuf::from("/etc/quire/quired.conf"),
            access_log: PathBuf::from("/var/log/quire/access_log"),
            error_log: PathBuf::from("/var/log/quire/error_log"),
            page_log: PathBuf::from("/var/log/quire/page_log"),
        }
    }
}

impl Roots {
    /// Directory for a named root.
    pub fn dir(&self, root: Root) -> &Path {
        match root {
            Root::Document => &self.document_root,
            Root::Server => &self.server_root,
            Root::Cache => &self.cache_dir,
        }
    }

    /// File name of the server configuration, as it appears under `/admin/conf/`.
    pub fn config_name(&self) -> Option<&str> {
        self.config_file.file_name().and_then(|name| name.to_str())
    }

    /// The only URI that may be written with `PUT`.
    pub fn config_uri(&self) -> Option<String> {
        self.config_name().map(|name| format!("/admin/conf/{}", name))
    }
}
