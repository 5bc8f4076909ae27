//! Package identity: dotted paths, versions, and version ranges.

use crate::error::{Error, Result};
use semver::{Version, VersionReq};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A dotted package path like `org.bx.demo.zlib`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackagePath(String);

impl PackagePath {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() {
            return Err(Error::Package("empty package path".into()));
        }
        for segment in s.split('.') {
            if segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(Error::Package(format!("invalid package path: {}", s)));
            }
        }
        Ok(PackagePath(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// The leading segment, used to dispatch to a driver.
    pub fn namespace(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Relative filesystem layout of this package in a store.
    pub fn as_dir(&self) -> PathBuf {
        self.segments().collect()
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully resolved package: path plus exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    pub path: PackagePath,
    pub version: Version,
}

impl PackageId {
    pub fn new(path: PackagePath, version: Version) -> Self {
        PackageId { path, version }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.path, self.version)
    }
}

impl FromStr for PackageId {
    type Err = Error;

    /// Parses `org.demo.zlib-1.2.11`.
    fn from_str(s: &str) -> Result<Self> {
        let (path, version) = split_version(s)
            .ok_or_else(|| Error::Package(format!("package id without version: {}", s)))?;
        let version = Version::parse(version)
            .map_err(|err| Error::Package(format!("bad version in {}: {}", s, err)))?;
        Ok(PackageId {
            path: PackagePath::new(path)?,
            version,
        })
    }
}

/// A package reference before resolution: path plus version range.
#[derive(Debug, Clone)]
pub struct UnresolvedPackage {
    pub path: PackagePath,
    pub range: VersionReq,
}

impl fmt::Display for UnresolvedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.path, self.range)
    }
}

impl FromStr for UnresolvedPackage {
    type Err = Error;

    /// Parses `org.demo.zlib`, `org.demo.zlib-1`, or `org.demo.zlib-1.2.11`.
    fn from_str(s: &str) -> Result<Self> {
        match split_version(s) {
            Some((path, version)) => Ok(UnresolvedPackage {
                path: PackagePath::new(path)?,
                range: VersionReq::parse(version)
                    .map_err(|err| Error::Package(format!("bad version range in {}: {}", s, err)))?,
            }),
            None => Ok(UnresolvedPackage {
                path: PackagePath::new(s)?,
                range: VersionReq::STAR,
            }),
        }
    }
}

/// A resolved package materialized on disk.
#[derive(Debug, Clone)]
pub struct LocalPackage {
    pub id: PackageId,
    pub source_dir: PathBuf,
}

/// Splits `path-version` at the dash that starts the version, i.e. the
/// last dash followed by a digit.
fn split_version(s: &str) -> Option<(&str, &str)> {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate().rev() {
        if b == b'-' && bytes.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
            return Some((&s[..i], &s[i + 1..]));
        }
    }
    None
}
