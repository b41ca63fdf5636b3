//! Stack specifications.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::{StackName, TemplateRef};

/// The declared definition of one stack.
///
/// A spec is immutable for the duration of a run. Parameters and tags use
/// `BTreeMap` so that serialization and fingerprinting are order-independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSpec {
    /// Logical name, unique within the application.
    pub name: StackName,

    /// Physical name the backend knows the stack by.
    pub stack_name: String,

    /// Logical names of the stacks that must be deployed before this one.
    #[serde(default)]
    pub depends_on: Vec<StackName>,

    pub template: TemplateRef,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Left in place by teardown unless deleting retained stacks is
    /// explicitly requested.
    #[serde(default)]
    pub retain: bool,
}

impl StackSpec {
    /// Creates a spec whose physical name equals its logical name.
    pub fn new(name: impl Into<StackName>, template: impl Into<String>) -> Self {
        let name = name.into();
        StackSpec {
            stack_name: name.0.clone(),
            name,
            depends_on: Vec::new(),
            template: TemplateRef::new(template),
            parameters: BTreeMap::new(),
            tags: BTreeMap::new(),
            retain: false,
        }
    }

    pub fn with_stack_name(mut self, stack_name: impl Into<String>) -> Self {
        self.stack_name = stack_name.into();
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<StackName>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    /// SHA-256 over everything that defines what gets deployed.
    ///
    /// Two specs with the same fingerprint would produce the same stack, so a
    /// backend reporting a successful stack carrying this fingerprint needs no
    /// further mutating call. Dependencies and the teardown policy are
    /// excluded: they do not change the deployed result.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"stack\0");
        hasher.update(self.stack_name.as_bytes());
        hasher.update(b"\0template\0");
        hasher.update(self.template.as_str().as_bytes());
        for (section, map) in [("parameters", &self.parameters), ("tags", &self.tags)] {
            hasher.update(b"\0");
            hasher.update(section.as_bytes());
            for (key, value) in map {
                hasher.update(b"\0");
                hasher.update(key.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
        }
        hex(&hasher.finalize())
    }
}

/// Lowercase hex encoding of a digest.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec() -> StackSpec {
        StackSpec::new("app", "templates/app.yaml")
            .with_stack_name("shop-app")
            .with_parameter("InstanceType", "t3.small")
            .with_tag("team", "payments")
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = spec().fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_ignores_dependencies() {
        let a = spec();
        let b = spec().depends_on("network");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_parameters() {
        let a = spec();
        let b = spec().with_parameter("InstanceType", "t3.large");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_template_and_name() {
        let base = spec();
        let mut other_template = spec();
        other_template.template = TemplateRef::new("templates/app-v2.yaml");
        let other_name = spec().with_stack_name("staging-app");

        assert_ne!(base.fingerprint(), other_template.fingerprint());
        assert_ne!(base.fingerprint(), other_name.fingerprint());
    }

    #[test]
    fn parameters_and_tags_do_not_collide() {
        let as_param = StackSpec::new("app", "t.yaml").with_parameter("k", "v");
        let as_tag = StackSpec::new("app", "t.yaml").with_tag("k", "v");
        assert_ne!(as_param.fingerprint(), as_tag.fingerprint());
    }

    #[test]
    fn yaml_defaults_optional_fields() {
        let yaml = "name: app\nstack_name: shop-app\ntemplate: app.yaml\n";
        let parsed: StackSpec = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(parsed.depends_on.is_empty());
        assert!(parsed.parameters.is_empty());
    }

    proptest! {
        #[test]
        fn fingerprint_is_insertion_order_independent(
            params in prop::collection::btree_map("[A-Za-z]{1,8}", "[a-z0-9]{0,8}", 0..6)
        ) {
            let mut forward = StackSpec::new("s", "t.yaml");
            for (k, v) in params.iter() {
                forward = forward.with_parameter(k.clone(), v.clone());
            }
            let mut backward = StackSpec::new("s", "t.yaml");
            for (k, v) in params.iter().rev() {
                backward = backward.with_parameter(k.clone(), v.clone());
            }
            prop_assert_eq!(forward.fingerprint(), backward.fingerprint());
        }
    }
}
