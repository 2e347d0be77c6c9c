//! Source resolution boundary.
//!
//! Cached values are produced from resources addressed by URI. The cache never
//! reads those resources itself; it goes through a [`SourceResolver`], and every
//! resolved handle is held in a [`SourceGuard`] that hands it back to the
//! resolver when dropped, on success and failure paths alike.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// Milliseconds since the Unix epoch, as reported by a source.
pub type LastModified = i64;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("source `{uri}` not found")]
    NotFound { uri: String },
    #[error("unsupported source uri `{uri}`: {reason}")]
    Unsupported { uri: String, reason: String },
    #[error("failed to access source `{uri}`: {source}")]
    Io {
        uri: String,
        #[source]
        source: io::Error,
    },
    #[error("source `{uri}` was already released")]
    Released { uri: String },
}

impl ResolveError {
    fn io(uri: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                uri: uri.to_string(),
            }
        } else {
            Self::Io {
                uri: uri.to_string(),
                source,
            }
        }
    }
}

/// A resolved resource.
pub trait Source: Send {
    fn uri(&self) -> &str;

    /// Current last-modified time of the underlying resource.
    fn last_modified(&self) -> Result<LastModified, ResolveError>;

    /// Read the full content of the resource.
    fn read(&mut self) -> Result<Bytes, ResolveError>;
}

/// Resolves URIs into [`Source`] handles.
pub trait SourceResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, uri: &str) -> Result<Box<dyn Source>, ResolveError>;

    /// Return a handle obtained from [`SourceResolver::resolve`].
    fn release(&self, source: Box<dyn Source>) {
        drop(source);
    }
}

/// Scoped ownership of a resolved source.
pub struct SourceGuard<'r> {
    resolver: &'r dyn SourceResolver,
    uri: String,
    source: Option<Box<dyn Source>>,
}

impl<'r> SourceGuard<'r> {
    pub fn acquire(resolver: &'r dyn SourceResolver, uri: &str) -> Result<Self, ResolveError> {
        let source = resolver.resolve(uri)?;
        Ok(Self {
            resolver,
            uri: uri.to_string(),
            source: Some(source),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn last_modified(&self) -> Result<LastModified, ResolveError> {
        match self.source.as_ref() {
            Some(source) => source.last_modified(),
            None => Err(ResolveError::Released {
                uri: self.uri.clone(),
            }),
        }
    }

    pub fn read(&mut self) -> Result<Bytes, ResolveError> {
        match self.source.as_mut() {
            Some(source) => source.read(),
            None => Err(ResolveError::Released {
                uri: self.uri.clone(),
            }),
        }
    }
}

impl Drop for SourceGuard<'_> {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            self.resolver.release(source);
        }
    }
}

/// Resolves `file:` URLs and plain paths relative to a base directory.
#[derive(Debug, Clone)]
pub struct FileSourceResolver {
    base: PathBuf,
}

impl FileSourceResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn locate(&self, uri: &str) -> Result<PathBuf, ResolveError> {
        if uri.starts_with("file:") {
            let url = Url::parse(uri).map_err(|err| ResolveError::Unsupported {
                uri: uri.to_string(),
                reason: err.to_string(),
            })?;
            return url
                .to_file_path()
                .map_err(|()| ResolveError::Unsupported {
                    uri: uri.to_string(),
                    reason: "not a local file path".to_string(),
                });
        }

        if uri.contains("://") {
            return Err(ResolveError::Unsupported {
                uri: uri.to_string(),
                reason: "only file sources are supported".to_string(),
            });
        }

        Ok(self.base.join(uri))
    }
}

impl SourceResolver for FileSourceResolver {
    fn resolve(&self, uri: &str) -> Result<Box<dyn Source>, ResolveError> {
        let path = self.locate(uri)?;
        let metadata = std::fs::metadata(&path).map_err(|err| ResolveError::io(uri, err))?;
        if !metadata.is_file() {
            return Err(ResolveError::NotFound {
                uri: uri.to_string(),
            });
        }

        Ok(Box::new(FileSource {
            uri: uri.to_string(),
            path,
        }))
    }
}

struct FileSource {
    uri: String,
    path: PathBuf,
}

impl Source for FileSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn last_modified(&self) -> Result<LastModified, ResolveError> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .map_err(|err| ResolveError::io(&self.uri, err))?;

        let millis = modified
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        Ok(LastModified::try_from(millis).unwrap_or(LastModified::MAX))
    }

    fn read(&mut self) -> Result<Bytes, ResolveError> {
        std::fs::read(&self.path)
            .map(Bytes::from)
            .map_err(|err| ResolveError::io(&self.uri, err))
    }
}
