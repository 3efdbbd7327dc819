//! Ordered load config rules
//!
//! JSON shape:
//! ```text
//! {
//!   "load_config": [
//!     {
//!       "name": "attribute",
//!       "file_patterns": ["_ATTRIBUTE_"],
//!       "load_strategy": "cache",
//!       "load_strategy_param": { "cache_size": 512, "cache_decompress_file": true },
//!       "lifecycle": "hot"
//!     }
//!   ],
//!   "enable_load_speed_limit": true
//! }
//! ```

use super::rule::{DEFAULT_CONFIG_NAME, LoadConfig};
use super::strategy::{
    BufferedLoadStrategy, CacheLoadStrategy, DEFAULT_LOCK_SLICE, LoadStrategy, MmapLoadStrategy,
};
use indexfs_common::{Error, Lifecycle, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoadConfigListJson {
    #[serde(default)]
    load_config: Vec<LoadConfigJson>,
    #[serde(default = "default_true")]
    enable_load_speed_limit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoadConfigJson {
    #[serde(default)]
    name: Option<String>,
    file_patterns: Vec<String>,
    #[serde(default = "default_strategy_name")]
    load_strategy: String,
    #[serde(default)]
    load_strategy_param: StrategyParamJson,
    #[serde(default)]
    lifecycle: Option<String>,
    #[serde(default)]
    remote: bool,
    #[serde(default = "default_true")]
    deploy: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrategyParamJson {
    lock: Option<bool>,
    slice: Option<u64>,
    interval: Option<u64>,
    advise_random: Option<bool>,
    /// MiB
    cache_size: Option<u64>,
    memory_size_in_mb: Option<u64>,
    block_size: Option<usize>,
    cache_decompress_file: Option<bool>,
    global_cache: Option<bool>,
    direct_io: Option<bool>,
    io_batch_size: Option<usize>,
    buffer_size: Option<usize>,
}

const fn default_true() -> bool {
    true
}

fn default_strategy_name() -> String {
    LoadStrategy::MMAP.to_string()
}

impl StrategyParamJson {
    fn into_strategy(self, name: &str) -> Result<LoadStrategy> {
        match name {
            LoadStrategy::MMAP => {
                let mut s = MmapLoadStrategy::default();
                s.lock = self.lock.unwrap_or(false);
                s.advise_random = self.advise_random.unwrap_or(false);
                s.slice = self.slice.unwrap_or(DEFAULT_LOCK_SLICE);
                s.interval = self.interval.unwrap_or(0);
                Ok(LoadStrategy::Mmap(s))
            }
            LoadStrategy::CACHE => {
                let mut s = CacheLoadStrategy::default();
                if let Some(mb) = self.cache_size.or(self.memory_size_in_mb) {
                    s.memory_size_bytes = mb.checked_mul(MIB).ok_or_else(|| {
                        Error::bad_parameter(format!("cache size of {mb} MiB overflows"))
                    })?;
                }
                if let Some(block_size) = self.block_size {
                    s.block_size = block_size;
                }
                s.cache_decompress_file = self.cache_decompress_file.unwrap_or(false);
                s.global_cache = self.global_cache.unwrap_or(false);
                s.direct_io = self.direct_io.unwrap_or(false);
                if let Some(batch) = self.io_batch_size {
                    s.io_batch_size = batch;
                }
                Ok(LoadStrategy::Cache(s))
            }
            LoadStrategy::BUFFERED => {
                let mut s = BufferedLoadStrategy::default();
                if let Some(size) = self.buffer_size {
                    s.buffer_size = size;
                }
                s.direct_io = self.direct_io.unwrap_or(false);
                Ok(LoadStrategy::Buffered(s))
            }
            other => Err(Error::bad_parameter(format!(
                "unknown load strategy {other}"
            ))),
        }
    }
}

/// Ordered list of load config rules plus the always-present default
///
/// Clones share the load speed limit flag: flipping it through any clone is
/// observed by every later throttling decision.
#[derive(Debug, Clone)]
pub struct LoadConfigList {
    configs: Vec<LoadConfig>,
    default_config: LoadConfig,
    load_speed_limit: Arc<AtomicBool>,
}

impl Default for LoadConfigList {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadConfigList {
    /// Empty list whose default rule maps files
    #[must_use]
    pub fn new() -> Self {
        Self {
            configs: Vec::new(),
            default_config: LoadConfig::default_config(LoadStrategy::default()),
            load_speed_limit: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Parse and validate a load config JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: LoadConfigListJson = serde_json::from_str(json)
            .map_err(|e| Error::bad_parameter(format!("malformed load config: {e}")))?;

        let mut list = Self::new();
        list.switch_load_speed_limit(parsed.enable_load_speed_limit);
        for (idx, raw) in parsed.load_config.into_iter().enumerate() {
            let strategy = raw.load_strategy_param.into_strategy(&raw.load_strategy)?;
            let name = raw.name.unwrap_or_else(|| format!("load_config_{idx}"));
            let mut config = LoadConfig::new(name, raw.file_patterns, strategy)?
                .with_deploy(raw.remote, raw.deploy);
            if let Some(lifecycle) = raw.lifecycle {
                config = config.with_lifecycle(Lifecycle::new(lifecycle));
            }
            list.push_back(config);
        }
        list.check()?;
        Ok(list)
    }

    /// Append a rule with the lowest priority so far
    pub fn push_back(&mut self, config: LoadConfig) {
        self.configs.push(config);
    }

    /// Insert a rule with the highest priority
    pub fn push_front(&mut self, config: LoadConfig) {
        self.configs.insert(0, config);
    }

    /// Set the strategy of the default rule
    pub fn set_load_mode(&mut self, strategy: LoadStrategy) {
        self.default_config.set_strategy(strategy);
    }

    /// Rules in priority order, default excluded
    pub fn load_configs(&self) -> &[LoadConfig] {
        &self.configs
    }

    pub const fn default_config(&self) -> &LoadConfig {
        &self.default_config
    }

    /// Number of explicit rules
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Validate names and every rule
    pub fn check(&self) -> Result<()> {
        let mut names = HashSet::new();
        for config in &self.configs {
            if config.name() == DEFAULT_CONFIG_NAME || !names.insert(config.name()) {
                return Err(Error::bad_parameter(format!(
                    "duplicate load config name {}",
                    config.name()
                )));
            }
            config.check()?;
        }
        self.default_config.check()
    }

    /// Sum of the block cache budgets of every cache rule
    pub fn total_cache_memory_size(&self) -> u64 {
        self.configs
            .iter()
            .chain(std::iter::once(&self.default_config))
            .map(|c| c.strategy().cache_memory_size())
            .fold(0, u64::saturating_add)
    }

    /// First rule matching `path`, falling back to the default
    pub fn match_config(&self, path: &str, lifecycle: Option<&Lifecycle>) -> &LoadConfig {
        self.configs
            .iter()
            .find(|c| c.matches(path, lifecycle))
            .unwrap_or(&self.default_config)
    }

    /// Rename the rule at `idx`
    pub fn rename(&mut self, idx: usize, name: impl Into<String>) -> Result<()> {
        let config = self
            .configs
            .get_mut(idx)
            .ok_or_else(|| Error::bad_parameter(format!("no load config at index {idx}")))?;
        config.set_name(name.into());
        Ok(())
    }

    /// Enable or disable load throttling for every strategy of this list
    pub fn switch_load_speed_limit(&self, on: bool) {
        self.load_speed_limit.store(on, Ordering::Release);
    }

    /// Current value of the load speed limit flag
    pub fn load_speed_limit_enabled(&self) -> bool {
        self.load_speed_limit.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cache_memory() {
        let list = LoadConfigList::from_json(
            r#"{"load_config":[{"file_patterns":["_ATTRIBUTE_"],"load_strategy":"cache","load_strategy_param":{"cache_size":512}}]}"#,
        )
        .unwrap();
        assert_eq!(list.total_cache_memory_size(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_huge_cache_size() {
        let err = LoadConfigList::from_json(
            r#"{"load_config":[{"file_patterns":["x"],"load_strategy":"cache","load_strategy_param":{"cache_size":18000000000000}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));

        let list = LoadConfigList::from_json(
            r#"{"load_config":[
                {"name":"a","file_patterns":["x"],"load_strategy":"cache","load_strategy_param":{"cache_size":16000000000000}},
                {"name":"b","file_patterns":["y"],"load_strategy":"cache","load_strategy_param":{"memory_size_in_mb":16000000000000}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(list.total_cache_memory_size(), u64::MAX);
    }

    #[test]
    fn test_first_match_wins() {
        let list = LoadConfigList::from_json(
            r#"{"load_config":[
                {"name":"a","file_patterns":["attr"],"load_strategy":"cache"},
                {"name":"b","file_patterns":["attr", "index"],"load_strategy":"buffer"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(list.match_config("seg/attr/x", None).name(), "a");
        assert_eq!(list.match_config("seg/index/x", None).name(), "b");
        assert_eq!(list.match_config("seg/summary", None).name(), DEFAULT_CONFIG_NAME);
    }

    #[test]
    fn test_push_front_raises_priority() {
        let mut list = LoadConfigList::from_json(
            r#"{"load_config":[{"name":"a","file_patterns":["attr"],"load_strategy":"cache"}]}"#,
        )
        .unwrap();
        list.push_front(
            LoadConfig::new(
                "front",
                vec!["attr".to_string()],
                LoadStrategy::Mmap(MmapLoadStrategy::locked()),
            )
            .unwrap(),
        );
        assert_eq!(list.match_config("attr", None).name(), "front");
        assert_eq!(list.load_configs()[1].name(), "a");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = LoadConfigList::from_json(
            r#"{"load_config":[
                {"name":"a","file_patterns":["x"]},
                {"name":"a","file_patterns":["y"]}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
    }

    #[test]
    fn test_malformed_and_inconsistent() {
        assert!(LoadConfigList::from_json("{not json").is_err());
        assert!(
            LoadConfigList::from_json(
                r#"{"load_config":[{"file_patterns":["x"],"load_strategy":"tape"}]}"#
            )
            .is_err()
        );
        assert!(
            LoadConfigList::from_json(
                r#"{"load_config":[{"file_patterns":["x"],"remote":false,"deploy":false}]}"#
            )
            .is_err()
        );
        assert!(
            LoadConfigList::from_json(
                r#"{"load_config":[{"file_patterns":["x"],"load_strategy_param":{"slice":999999999999}}]}"#
            )
            .is_err()
        );
    }

    #[test]
    fn test_set_load_mode_and_speed_limit() {
        let mut list = LoadConfigList::new();
        list.set_load_mode(LoadStrategy::Cache(CacheLoadStrategy::default()));
        assert_eq!(list.match_config("any", None).strategy().name(), "cache");
        assert_eq!(list.total_cache_memory_size(), 64 * 1024 * 1024);

        let shared = list.clone();
        assert!(shared.load_speed_limit_enabled());
        list.switch_load_speed_limit(false);
        assert!(!shared.load_speed_limit_enabled());
    }

    #[test]
    fn test_memory_size_alias_and_lifecycle() {
        let list = LoadConfigList::from_json(
            r#"{"load_config":[{"file_patterns":[".*"],"load_strategy":"cache",
                "load_strategy_param":{"memory_size_in_mb":2,"global_cache":true},
                "lifecycle":"cold"}]}"#,
        )
        .unwrap();
        let config = &list.load_configs()[0];
        assert_eq!(config.strategy().cache_memory_size(), 2 * MIB);
        assert!(list.match_config("x", Some(&Lifecycle::cold())).lifecycle().is_some());
        assert_eq!(list.match_config("x", None).name(), DEFAULT_CONFIG_NAME);
    }
}
