//! A single load config rule

use super::strategy::LoadStrategy;
use indexfs_common::{Error, Lifecycle, Result};
use regex::Regex;

/// Pattern of the catch-all default rule
pub const DEFAULT_PATTERN: &str = ".*";

/// Name of the catch-all default rule
pub const DEFAULT_CONFIG_NAME: &str = "__default__";

/// Ordered file patterns bound to a load strategy
#[derive(Debug, Clone)]
pub struct LoadConfig {
    name: String,
    file_patterns: Vec<String>,
    regexes: Vec<Regex>,
    strategy: LoadStrategy,
    lifecycle: Option<Lifecycle>,
    /// Files may be read from the remote root
    remote: bool,
    /// Files are deployed to the local root
    deploy: bool,
}

impl LoadConfig {
    /// Build a rule, compiling its patterns
    pub fn new(
        name: impl Into<String>,
        file_patterns: Vec<String>,
        strategy: LoadStrategy,
    ) -> Result<Self> {
        let name = name.into();
        let regexes = file_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    Error::bad_parameter(format!("load config {name}: bad pattern {p}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name,
            file_patterns,
            regexes,
            strategy,
            lifecycle: None,
            remote: false,
            deploy: true,
        })
    }

    /// Catch-all rule used when nothing else matches
    pub fn default_config(strategy: LoadStrategy) -> Self {
        Self {
            name: DEFAULT_CONFIG_NAME.to_string(),
            file_patterns: vec![DEFAULT_PATTERN.to_string()],
            regexes: Vec::new(),
            strategy,
            lifecycle: None,
            remote: false,
            deploy: true,
        }
    }

    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    #[must_use]
    pub const fn with_deploy(mut self, remote: bool, deploy: bool) -> Self {
        self.remote = remote;
        self.deploy = deploy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn file_patterns(&self) -> &[String] {
        &self.file_patterns
    }

    pub const fn strategy(&self) -> &LoadStrategy {
        &self.strategy
    }

    pub(super) fn set_strategy(&mut self, strategy: LoadStrategy) {
        self.strategy = strategy;
    }

    pub const fn lifecycle(&self) -> Option<&Lifecycle> {
        self.lifecycle.as_ref()
    }

    pub const fn is_remote(&self) -> bool {
        self.remote
    }

    pub const fn is_deploy(&self) -> bool {
        self.deploy
    }

    /// Whether this rule applies to `path` stored under `lifecycle`
    ///
    /// A rule tagged with a lifecycle only applies to files whose directory
    /// carries the same lifecycle.
    pub fn matches(&self, path: &str, lifecycle: Option<&Lifecycle>) -> bool {
        if let Some(required) = &self.lifecycle {
            if lifecycle != Some(required) {
                return false;
            }
        }
        self.name == DEFAULT_CONFIG_NAME || self.regexes.iter().any(|re| re.is_match(path))
    }

    /// Validate the rule
    pub fn check(&self) -> Result<()> {
        if !self.remote && !self.deploy {
            return Err(Error::bad_parameter(format!(
                "load config {}: files neither deployed nor readable remotely",
                self.name
            )));
        }
        if self.file_patterns.is_empty() {
            return Err(Error::bad_parameter(format!(
                "load config {}: no file patterns",
                self.name
            )));
        }
        self.strategy.check()
    }
}
