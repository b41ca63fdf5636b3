//! Application configuration.
//!
//! An application file declares the stacks to deploy:
//!
//! ```yaml
//! application:
//!   name: shop
//!   namespace: staging
//!   tags:
//!     team: payments
//! stacks:
//!   - name: network
//!     template: templates/network.yaml
//!   - name: app
//!     template: templates/app.yaml
//!     depends_on: [network]
//!     parameters:
//!       Version: ${bundle}
//!   - name: data
//!     template: templates/data.yaml
//!     on_delete: retain
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bundle::BundleLocation;
use crate::types::{StackName, StackSpec, TemplateRef};

/// Default application file name.
pub const DEFAULT_CONFIG_FILE: &str = "stackline.yaml";

/// Default directory for the run ledger.
pub const DEFAULT_LEDGER_DIR: &str = ".stackline";

/// Environment variable overriding the namespace.
pub const NAMESPACE_ENV: &str = "STACKLINE_NAMESPACE";

const BUNDLE_PLACEHOLDER: &str = "${bundle}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("stack {stack} parameter {parameter} uses ${{bundle}} but no bundle was given")]
    BundleRequired { stack: String, parameter: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,

    #[serde(default)]
    pub namespace: Option<String>,

    /// Tags applied to every stack.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// What teardown does with a stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    #[default]
    Delete,

    /// Keep the stack unless deleting retained stacks is requested.
    #[serde(alias = "pass")]
    Retain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntry {
    pub name: String,
    pub template: String,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Named after the application instead of the namespace, so one
    /// instance is shared by every namespace in the account.
    #[serde(default)]
    pub account_unique: bool,

    #[serde(default)]
    pub on_delete: OnDelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub application: Application,
    pub stacks: Vec<StackEntry>,

    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: PathBuf,

    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,
}

fn default_ledger_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LEDGER_DIR)
}

impl AppConfig {
    /// Reads and validates an application file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.application.name.trim().is_empty() {
            return Err(ConfigError::Invalid("application.name is empty".into()));
        }
        if self.stacks.is_empty() {
            return Err(ConfigError::Invalid("no stacks declared".into()));
        }
        for stack in &self.stacks {
            if !is_valid_name(&stack.name) {
                return Err(ConfigError::Invalid(format!(
                    "stack name {:?} must be non-empty and use only letters, digits and '-'",
                    stack.name
                )));
            }
            if stack.template.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stack {} has no template",
                    stack.name
                )));
            }
        }
        if let Some(namespace) = &self.application.namespace
            && !is_valid_name(namespace)
        {
            return Err(ConfigError::Invalid(format!(
                "namespace {:?} must use only letters, digits and '-'",
                namespace
            )));
        }
        Ok(())
    }

    /// The namespace stacks are deployed into.
    ///
    /// `override_ns` (normally from `STACKLINE_NAMESPACE`) wins over
    /// `application.namespace`, which wins over the application name.
    pub fn namespace(&self, override_ns: Option<&str>) -> String {
        override_ns
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .or_else(|| self.application.namespace.clone())
            .unwrap_or_else(|| self.application.name.clone())
    }

    /// Physical backend name of a stack.
    pub fn physical_name(&self, stack: &StackEntry, namespace: &str) -> String {
        if stack.account_unique {
            format!("{}-{}", self.application.name, stack.name)
        } else {
            format!("{}-{}", namespace, stack.name)
        }
    }

    /// Builds stack specs in declaration order.
    ///
    /// With a bundle, relative templates resolve inside it and `${bundle}`
    /// in parameter values becomes the bundle id.
    pub fn to_specs(
        &self,
        namespace: &str,
        bundle: Option<&BundleLocation>,
    ) -> Result<Vec<StackSpec>> {
        self.stacks
            .iter()
            .map(|entry| {
                let template = match bundle {
                    Some(location) => location.resolve(&entry.template),
                    None => TemplateRef::new(entry.template.as_str()),
                };

                let mut parameters = BTreeMap::new();
                for (key, value) in &entry.parameters {
                    let value = if value.contains(BUNDLE_PLACEHOLDER) {
                        let location = bundle.ok_or_else(|| ConfigError::BundleRequired {
                            stack: entry.name.clone(),
                            parameter: key.clone(),
                        })?;
                        value.replace(BUNDLE_PLACEHOLDER, location.id.as_str())
                    } else {
                        value.clone()
                    };
                    parameters.insert(key.clone(), value);
                }

                Ok(StackSpec {
                    name: StackName::new(entry.name.as_str()),
                    stack_name: self.physical_name(entry, namespace),
                    depends_on: entry
                        .depends_on
                        .iter()
                        .map(|d| StackName::new(d.as_str()))
                        .collect(),
                    template,
                    parameters,
                    tags: self.application.tags.clone(),
                    retain: entry.on_delete == OnDelete::Retain,
                })
            })
            .collect()
    }

    /// Builds specs without parameters, for planning and deleting stacks
    /// where no bundle is needed.
    pub fn topology_specs(&self, namespace: &str) -> Result<Vec<StackSpec>> {
        let mut config = self.clone();
        for stack in &mut config.stacks {
            stack.parameters.clear();
        }
        config.to_specs(namespace, None)
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BundleId;

    const SAMPLE: &str = r#"
application:
  name: shop
  tags:
    team: payments
stacks:
  - name: network
    template: templates/network.yaml
    account_unique: true
  - name: app
    template: templates/app.yaml
    depends_on: [network]
    parameters:
      Version: release-${bundle}
      Size: small
"#;

    fn location() -> BundleLocation {
        BundleLocation {
            id: BundleId::new("b42"),
            root: PathBuf::from("/bundles/b42"),
        }
    }

    #[test]
    fn parses_sample_with_defaults() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.application.name, "shop");
        assert_eq!(config.stacks.len(), 2);
        assert_eq!(config.ledger_dir, PathBuf::from(".stackline"));
        assert!(config.bundle_dir.is_none());
        assert_eq!(config.stacks[1].depends_on, vec!["network"]);
    }

    #[test]
    fn namespace_precedence() {
        let mut config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.namespace(None), "shop");

        config.application.namespace = Some("staging".into());
        assert_eq!(config.namespace(None), "staging");
        assert_eq!(config.namespace(Some("pr-12")), "pr-12");
        assert_eq!(config.namespace(Some("")), "staging");
    }

    #[test]
    fn physical_names() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        let specs = config.to_specs("staging", Some(&location())).unwrap();

        assert_eq!(specs[0].stack_name, "shop-network");
        assert_eq!(specs[1].stack_name, "staging-app");
    }

    #[test]
    fn bundle_substitution_and_template_resolution() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        let specs = config.to_specs("staging", Some(&location())).unwrap();
        let app = &specs[1];

        assert_eq!(app.parameters["Version"], "release-b42");
        assert_eq!(app.parameters["Size"], "small");
        assert_eq!(app.template.as_str(), "/bundles/b42/templates/app.yaml");
        assert_eq!(app.tags["team"], "payments");
        assert_eq!(app.depends_on, vec![StackName::from("network")]);
    }

    #[test]
    fn bundle_placeholder_without_bundle_is_an_error() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        match config.to_specs("staging", None) {
            Err(ConfigError::BundleRequired { stack, parameter }) => {
                assert_eq!(stack, "app");
                assert_eq!(parameter, "Version");
            }
            other => panic!("expected BundleRequired, got {:?}", other),
        }
    }

    #[test]
    fn topology_specs_need_no_bundle() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        let specs = config.topology_specs("staging").unwrap();
        assert_eq!(specs[1].stack_name, "staging-app");
        assert!(specs[1].parameters.is_empty());
    }

    #[test]
    fn on_delete_marks_stacks_retained() {
        let yaml = r#"
application: {name: shop}
stacks:
  - {name: data, template: d.yaml, on_delete: retain}
  - {name: cache, template: c.yaml, on_delete: pass}
  - {name: app, template: a.yaml}
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.stacks[0].on_delete, OnDelete::Retain);
        assert_eq!(config.stacks[1].on_delete, OnDelete::Retain);
        assert_eq!(config.stacks[2].on_delete, OnDelete::Delete);

        let specs = config.topology_specs("shop").unwrap();
        let retained: Vec<bool> = specs.iter().map(|s| s.retain).collect();
        assert_eq!(retained, [true, true, false]);
    }

    #[test]
    fn unknown_on_delete_is_rejected() {
        let yaml = r#"
application: {name: shop}
stacks:
  - {name: data, template: d.yaml, on_delete: archive}
"#;
        assert!(matches!(AppConfig::from_yaml(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn templates_are_used_verbatim_without_bundle() {
        let yaml = "application: {name: shop}\nstacks:\n  - name: app\n    template: app.yaml\n";
        let config = AppConfig::from_yaml(yaml).unwrap();
        let specs = config.to_specs("shop", None).unwrap();
        assert_eq!(specs[0].template.as_str(), "app.yaml");
    }

    #[test]
    fn validation_errors() {
        let cases = [
            "application: {name: ''}\nstacks: [{name: a, template: a.yaml}]\n",
            "application: {name: shop}\nstacks: []\n",
            "application: {name: shop}\nstacks: [{name: 'has space', template: a.yaml}]\n",
            "application: {name: shop}\nstacks: [{name: a, template: ''}]\n",
            "application: {name: shop, namespace: 'bad/ns'}\nstacks: [{name: a, template: a.yaml}]\n",
        ];
        for yaml in cases {
            assert!(
                matches!(AppConfig::from_yaml(yaml), Err(ConfigError::Invalid(_))),
                "{}",
                yaml
            );
        }
    }

    #[test]
    fn malformed_yaml_is_reported() {
        assert!(matches!(
            AppConfig::from_yaml("application: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        assert!(matches!(
            AppConfig::load(&path),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().stacks.len(), 2);
    }
}
