//! Specification handles presented to drivers.
//!
//! An input is a path plus a kind: a spec file, a directory holding
//! one, an inline spec embedded in a source file, or an installed
//! package.  Two inputs are the same input iff their hashes are equal;
//! the hash comes from the input database so repeated `add_input` calls
//! across runs dedupe without re-reading the spec.

use crate::package::PackageId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputType {
    /// A specification file given directly.
    SpecFile,
    /// A directory containing a specification file.
    DirectorySpecFile,
    /// A specification embedded in an ordinary source file.
    InlineSpec,
    /// An already-materialized package; skips driver detection.
    InstalledPackage,
}

#[derive(Debug)]
pub struct Input {
    path: PathBuf,
    ty: InputType,
    /// The driver selected for this input, by its package id.
    driver: Option<PackageId>,
    /// Set for installed-package inputs.
    package: Option<PackageId>,
    /// Additional files the specification spans (includes etc.); they
    /// share the input's hash in the database.
    extra_files: Vec<PathBuf>,
    /// 0 = not yet computed.
    hash: u64,
    loaded: AtomicBool,
    batch_loadable: bool,
    parallel_loadable: bool,
}

impl Input {
    pub fn new(path: impl Into<PathBuf>, ty: InputType) -> Self {
        Input {
            path: path.into(),
            ty,
            driver: None,
            package: None,
            extra_files: Vec::new(),
            hash: 0,
            loaded: AtomicBool::new(false),
            batch_loadable: false,
            parallel_loadable: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ty(&self) -> InputType {
        self.ty
    }

    /// Whether the hash is derived from the path alone rather than the
    /// spec contents.
    pub fn is_path_hashed(&self) -> bool {
        matches!(
            self.ty,
            InputType::DirectorySpecFile | InputType::InstalledPackage
        )
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn set_hash(&mut self, hash: u64) {
        debug_assert_ne!(hash, 0);
        self.hash = hash;
    }

    pub fn driver(&self) -> Option<&PackageId> {
        self.driver.as_ref()
    }

    pub fn set_driver(&mut self, driver: PackageId) {
        self.driver = Some(driver);
    }

    pub fn package(&self) -> Option<&PackageId> {
        self.package.as_ref()
    }

    pub fn set_package(&mut self, package: PackageId) {
        self.package = Some(package);
    }

    /// Every file the specification spans, the input's own path first.
    pub fn constituent_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.path.clone()];
        files.extend(self.extra_files.iter().cloned());
        files
    }

    pub fn add_spec_file(&mut self, path: impl Into<PathBuf>) {
        self.extra_files.push(path.into());
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    pub fn is_batch_loadable(&self) -> bool {
        self.batch_loadable
    }

    pub fn set_batch_loadable(&mut self, v: bool) {
        self.batch_loadable = v;
    }

    pub fn is_parallel_loadable(&self) -> bool {
        self.parallel_loadable
    }

    pub fn set_parallel_loadable(&mut self, v: bool) {
        self.parallel_loadable = v;
    }
}

impl PartialEq for Input {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Input {}

impl std::hash::Hash for Input {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}
