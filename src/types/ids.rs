//! Newtype wrappers for domain identifiers.
//!
//! These keep logical stack names, run ids, bundle ids and template references
//! from being mixed up with each other or with physical backend stack names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The logical name of a stack within an application (e.g. `network`).
///
/// Distinct from the physical name the backend knows the stack by, which is
/// carried on [`StackSpec::stack_name`](super::StackSpec::stack_name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackName(pub String);

impl StackName {
    pub fn new(s: impl Into<String>) -> Self {
        StackName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StackName {
    fn from(s: &str) -> Self {
        StackName(s.to_string())
    }
}

impl From<String> for StackName {
    fn from(s: String) -> Self {
        StackName(s)
    }
}

/// Identifier of one orchestrated run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generates a fresh run id.
    ///
    /// Ids start with a UTC timestamp so that lexical order matches creation
    /// order, followed by a short random suffix.
    pub fn generate() -> Self {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!("{}-{}", ts, &suffix[..8]))
    }

    pub fn new(s: impl Into<String>) -> Self {
        RunId(s.into())
    }

    /// True if the id can name a file in the ledger: ASCII letters, digits,
    /// `.`, `_` and `-`, not starting with a dot.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Identifier of an immutable build bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(pub String);

impl BundleId {
    pub fn new(s: impl Into<String>) -> Self {
        BundleId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BundleId {
    fn from(s: &str) -> Self {
        BundleId(s.to_string())
    }
}

/// An opaque reference to a rendered template: a file path or an `https://` URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateRef(pub String);

impl TemplateRef {
    pub fn new(s: impl Into<String>) -> Self {
        TemplateRef(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the template is addressed by URL rather than by path.
    pub fn is_url(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
