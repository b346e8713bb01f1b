//! Pinned package references and the plain-text requirements format.

use crate::errors::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// A package pinned to an exact version (`name==version`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageSpec {
    name: String,
    version: String,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let version = version.into();
        check_token(&name, "name")?;
        if version.is_empty() {
            return Err(HostError::UnpinnedPackage(name));
        }
        check_token(&version, "version")?;
        Ok(Self { name, version })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

fn check_token(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(HostError::InvalidPackage(format!("empty package {}", what)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(HostError::InvalidPackage(format!(
            "package {} {:?} contains whitespace",
            what, value
        )));
    }
    Ok(())
}

impl FromStr for PackageSpec {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once("==") {
            Some((name, version)) => PackageSpec::new(name, version),
            None => {
                // Anything else (bare name, >=, ~=) is not reproducible
                let name = s
                    .split(|c: char| matches!(c, '<' | '>' | '~' | '!' | '=' | ';' | ' '))
                    .next()
                    .unwrap_or(s);
                if name.is_empty() {
                    return Err(HostError::InvalidPackage(s.to_string()));
                }
                Err(HostError::UnpinnedPackage(name.to_string()))
            }
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=={}", self.name, self.version)
    }
}

/// Project name in normalized form: lowercase, with each run of `-`, `_`
/// and `.` collapsed to a single `-`. `PyYAML`, `pyyaml` and `scikit_learn`
/// vs `scikit-learn` name the same project.
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            separator = true;
            continue;
        }
        if separator && !out.is_empty() {
            out.push('-');
        }
        separator = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// Set of pinned packages, unique by canonical name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
    packages: BTreeMap<String, PackageSpec>,
}

impl PackageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `name==version` references. Repeating a package with the same
    /// version is harmless; repeating it with another version is rejected.
    pub fn parse<I, S>(references: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = PackageSet::new();
        for reference in references {
            set.insert(reference.as_ref().parse()?)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, spec: PackageSpec) -> Result<()> {
        let key = canonical_name(spec.name());
        match self.packages.get(&key) {
            Some(existing) if existing.version() != spec.version() => {
                Err(HostError::DuplicatePackage(spec.name().to_string()))
            }
            Some(_) => Ok(()),
            None => {
                self.packages.insert(key, spec);
                Ok(())
            }
        }
    }

    /// Membership by canonical name and exact version
    pub fn contains(&self, spec: &PackageSpec) -> bool {
        self.get(spec.name())
            .is_some_and(|found| found.version() == spec.version())
    }

    pub fn get(&self, name: &str) -> Option<&PackageSpec> {
        self.packages.get(&canonical_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageSpec> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// First package of `self` that `other` lacks, in canonical name order
    pub fn first_missing_from<'a>(&'a self, other: &PackageSet) -> Option<&'a PackageSpec> {
        self.iter().find(|spec| !other.contains(spec))
    }

    pub fn is_subset_of(&self, other: &PackageSet) -> bool {
        self.first_missing_from(other).is_none()
    }

    /// Render as a requirements file, one `name==version` per line
    pub fn to_requirements(&self) -> String {
        let mut out = String::new();
        for spec in self.iter() {
            out.push_str(&spec.to_string());
            out.push('\n');
        }
        out
    }

    /// Read the output of a freeze command. Lines that are not exact pins
    /// (editable installs, direct URLs, comments) are skipped.
    pub fn from_requirements(content: &str) -> Self {
        let mut set = PackageSet::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
                continue;
            }
            match line.parse::<PackageSpec>() {
                Ok(spec) => {
                    if let Err(e) = set.insert(spec) {
                        debug!("[ENV] Ignoring requirements line {:?}: {}", line, e);
                    }
                }
                Err(e) => debug!("[ENV] Ignoring requirements line {:?}: {}", line, e),
            }
        }
        set
    }
}

impl FromIterator<PackageSpec> for PackageSet {
    /// Later entries win when a name repeats.
    fn from_iter<T: IntoIterator<Item = PackageSpec>>(iter: T) -> Self {
        let packages = iter
            .into_iter()
            .map(|spec| (canonical_name(spec.name()), spec))
            .collect();
        Self { packages }
    }
}

impl<'a> IntoIterator for &'a PackageSet {
    type Item = &'a PackageSpec;
    type IntoIter = std::collections::btree_map::Values<'a, String, PackageSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.packages.values()
    }
}

/// True iff each set contains the other, matching canonical names and exact versions
pub fn packages_match(a: &PackageSet, b: &PackageSet) -> bool {
    a.is_subset_of(b) && b.is_subset_of(a)
}
