//! Static-root containment for requested file paths.
//!
//! Resolution happens in two phases:
//!
//! 1. **Lexical**: the raw request string is checked for traversal markers and
//!    its extension against the allow-list ([`crate::validation`]). Nothing
//!    touches the filesystem until this passes.
//! 2. **Canonical**: the path is joined onto the canonical static root and
//!    canonicalized, following symlinks. The result must still lie under the
//!    root and must be a regular file.
//!
//! The second phase is what catches symlinks that point outside the root;
//! the first is what keeps obviously hostile input away from the filesystem.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::validation::{
    LexicalRejection, check_requested_path, content_type_for, file_extension, normalize_extension,
};

/// Extensions served when none are configured.
pub const DEFAULT_ALLOWED_EXTENSIONS: [&str; 10] = [
    ".html", ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp",
];

/// Why a requested path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRejection {
    Traversal(LexicalRejection),
    DisallowedExtension,
    /// Canonical target lies outside the static root (e.g. via a symlink).
    OutsideRoot,
    NotFound,
}

impl PathRejection {
    /// Convert into the pipeline error, carrying the requested path for logs.
    pub fn into_error(self, requested: &str) -> AppError {
        match self {
            PathRejection::Traversal(_) | PathRejection::OutsideRoot => {
                AppError::TraversalAttempt(requested.to_string())
            }
            PathRejection::DisallowedExtension => {
                AppError::DisallowedExtension(requested.to_string())
            }
            PathRejection::NotFound => AppError::ResourceNotFound(requested.to_string()),
        }
    }
}

/// Outcome of resolving a requested path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    /// Canonical path of an existing regular file under the root.
    Resolved(PathBuf),
    Rejected(PathRejection),
}

/// Immutable set of servable extensions, stored lowercased with a leading dot.
#[derive(Debug, Clone)]
pub struct AllowedExtensionSet(Arc<BTreeSet<String>>);

impl AllowedExtensionSet {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(Arc::new(
            extensions
                .into_iter()
                .filter_map(|ext| normalize_extension(ext.as_ref()))
                .collect(),
        ))
    }

    pub fn contains(&self, extension: &str) -> bool {
        self.0.contains(extension)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for AllowedExtensionSet {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_EXTENSIONS)
    }
}

/// A file read from the static root.
#[derive(Debug, Clone)]
pub struct StaticAsset {
    pub path: PathBuf,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Resolves and reads files strictly inside one static root.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: Arc<PathBuf>,
    extensions: AllowedExtensionSet,
    read_timeout: Duration,
}

impl PathGuard {
    /// Create a guard for `root`, which must be an existing directory.
    ///
    /// The root is canonicalized once here so later containment checks
    /// compare canonical paths.
    pub fn new(
        root: impl AsRef<Path>,
        extensions: AllowedExtensionSet,
        read_timeout: Duration,
    ) -> AppResult<Self> {
        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|e| {
            AppError::ConfigError(format!("static root {} is not usable: {e}", root.display()))
        })?;
        if !canonical.is_dir() {
            return Err(AppError::ConfigError(format!(
                "static root {} is not a directory",
                canonical.display()
            )));
        }

        Ok(Self {
            root: Arc::new(canonical),
            extensions,
            read_timeout,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allowed_extensions(&self) -> &AllowedExtensionSet {
        &self.extensions
    }

    /// Lexical phase only. `None` means the path may be looked up.
    pub fn check_lexical(&self, requested: &str) -> Option<PathRejection> {
        if let Err(reason) = check_requested_path(requested) {
            return Some(PathRejection::Traversal(reason));
        }
        match file_extension(requested) {
            Some(ext) if self.extensions.contains(&ext) => None,
            _ => Some(PathRejection::DisallowedExtension),
        }
    }

    /// Resolve a request path relative to the root.
    pub async fn resolve(&self, requested: &str) -> PathDecision {
        if let Some(rejection) = self.check_lexical(requested) {
            return PathDecision::Rejected(rejection);
        }

        let candidate = self.root.join(requested);
        let canonical = match tokio::fs::canonicalize(&candidate).await {
            Ok(path) => path,
            Err(e) => {
                debug!(path = %requested, error = %e, "Static path does not resolve");
                return PathDecision::Rejected(PathRejection::NotFound);
            }
        };

        if !canonical.starts_with(self.root.as_path()) {
            warn!(
                path = %requested,
                target = %canonical.display(),
                "Resolved path escapes static root"
            );
            return PathDecision::Rejected(PathRejection::OutsideRoot);
        }

        // A symlink inside the root may name a target with another extension.
        let target_allowed = canonical
            .to_str()
            .and_then(file_extension)
            .is_some_and(|ext| self.extensions.contains(&ext));
        if !target_allowed {
            return PathDecision::Rejected(PathRejection::DisallowedExtension);
        }

        match tokio::fs::metadata(&canonical).await {
            Ok(meta) if meta.is_file() => PathDecision::Resolved(canonical),
            _ => PathDecision::Rejected(PathRejection::NotFound),
        }
    }

    /// Read a resolved file, bounded by the configured timeout.
    pub async fn read(&self, resolved: &Path) -> AppResult<Vec<u8>> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.read_timeout, tokio::fs::read(resolved)).await;
        metrics::record_file_read_duration(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                AppError::ResourceNotFound(resolved.display().to_string()),
            ),
            Ok(Err(e)) => Err(AppError::InternalFault(format!(
                "reading {}: {e}",
                resolved.display()
            ))),
            Err(_) => Err(AppError::InternalFault(format!(
                "reading {} timed out after {:?}",
                resolved.display(),
                self.read_timeout
            ))),
        }
    }

    /// Resolve then read, mapping rejections to pipeline errors.
    pub async fn fetch(&self, requested: &str) -> AppResult<StaticAsset> {
        let path = match self.resolve(requested).await {
            PathDecision::Resolved(path) => path,
            PathDecision::Rejected(rejection) => return Err(rejection.into_error(requested)),
        };

        let bytes = self.read(&path).await?;
        let content_type = path
            .to_str()
            .and_then(file_extension)
            .map_or("application/octet-stream", |ext| content_type_for(&ext));

        Ok(StaticAsset {
            path,
            content_type,
            bytes,
        })
    }
}
