//! Mapping of logical `(filename, base directory)` pairs to absolute paths.
//!
//! The engine never decides where named resources live. Descriptors that
//! reference files are resolved through a [`ResourceResolver`] supplied by
//! the host. [`DirectoryResolver`] is a configurable implementation for
//! hosts that simply keep a table of named directories.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ResolveError;

/// Outcome of resolving a logical file reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    /// The location is part of the read-only application bundle.
    pub read_only: bool,
}

pub trait ResourceResolver {
    fn resolve(&self, filename: &str, base: Option<&str>) -> Result<ResolvedPath, ResolveError>;
}

impl<F> ResourceResolver for F
where
    F: Fn(&str, Option<&str>) -> Result<ResolvedPath, ResolveError>,
{
    fn resolve(&self, filename: &str, base: Option<&str>) -> Result<ResolvedPath, ResolveError> {
        self(filename, base)
    }
}

/// Resolver used when the host configured none; every lookup fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

impl ResourceResolver for NoResolver {
    fn resolve(&self, _filename: &str, _base: Option<&str>) -> Result<ResolvedPath, ResolveError> {
        Err(ResolveError::NoResolver)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseDirectory {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// Table of named base directories, e.g. `documents` or `resources`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DirectoryResolver {
    pub bases: BTreeMap<String, BaseDirectory>,
    /// Base used when a reference names none.
    pub default_base: Option<String>,
}

impl DirectoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(mut self, name: &str, path: impl Into<PathBuf>, read_only: bool) -> Self {
        self.bases.insert(
            name.to_string(),
            BaseDirectory {
                path: path.into(),
                read_only,
            },
        );
        if self.default_base.is_none() {
            self.default_base = Some(name.to_string());
        }
        self
    }
}

impl ResourceResolver for DirectoryResolver {
    fn resolve(&self, filename: &str, base: Option<&str>) -> Result<ResolvedPath, ResolveError> {
        if filename.is_empty() {
            return Err(ResolveError::EmptyFilename);
        }
        let name = base
            .or(self.default_base.as_deref())
            .ok_or_else(|| ResolveError::UnknownBase(String::new()))?;
        let dir = self
            .bases
            .get(name)
            .ok_or_else(|| ResolveError::UnknownBase(name.to_string()))?;
        Ok(ResolvedPath {
            path: dir.path.join(filename),
            read_only: dir.read_only,
        })
    }
}
