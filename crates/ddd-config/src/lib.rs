//! Layered YAML configuration (ambient stack; spec.md §6 "Configuration").
//!
//! Loading follows `mqk-config::load_layered_yaml`: read each file in order,
//! deep-merge into one JSON document (later files win), canonicalize by
//! sorting object keys, and hash the canonical form so callers can detect
//! when a running process is serving a stale configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Read and deep-merge `paths` in order, then canonicalize and hash.
pub fn load_layered_yaml(paths: &[impl AsRef<Path>]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let p = p.as_ref();
        let s = fs::read_to_string(p).with_context(|| format!("read config: {}", p.display()))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {}", p.display()))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Recognized options and effects (spec.md §6 "Configuration"), with the
/// documented defaults as `serde(default)` so a missing layer is harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub outbox: OutboxSettings,
    pub runner: RunnerSettings,
    pub workflow: WorkflowSettings,
    pub lock: LockSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outbox: OutboxSettings::default(),
            runner: RunnerSettings::default(),
            workflow: WorkflowSettings::default(),
            lock: LockSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        serde_json::from_value(loaded.config_json.clone()).context("deserialize settings failed")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub batch_size: u32,
    pub max_attempts: u32,
    pub base_retry_delay_seconds: u64,
    pub retry_multiplier: f64,
    pub max_retry_delay_seconds: u64,
    pub processor_interval_seconds: u64,
    pub lock_timeout_seconds: u64,
    pub default_group: String,
    pub max_in_process_bytes: u64,
    pub route_large_payloads_external: bool,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 5,
            base_retry_delay_seconds: 60,
            retry_multiplier: 2.0,
            max_retry_delay_seconds: 3600,
            processor_interval_seconds: 30,
            lock_timeout_seconds: 300,
            default_group: "default".to_string(),
            max_in_process_bytes: 50_000,
            route_large_payloads_external: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub max_execution_seconds: u64,
    pub memory_limit_percent: f64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_execution_seconds: 25,
            memory_limit_percent: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub max_retries: u32,
    pub reschedule_interval: u64,
    pub fork_delay_seconds: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            reschedule_interval: 5,
            fork_delay_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub duration_seconds: u64,
    pub retries: u32,
    pub retry_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            duration_seconds: 30,
            retries: 10,
            retry_interval_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TempPath(std::path::PathBuf);

    impl TempPath {
        fn new(contents: &str) -> Self {
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "ddd-config-test-{}-{n}.yaml",
                std::process::id()
            ));
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(contents.as_bytes()).unwrap();
            Self(path)
        }
    }

    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    impl AsRef<std::path::Path> for TempPath {
        fn as_ref(&self) -> &std::path::Path {
            &self.0
        }
    }

    fn write_temp(contents: &str) -> TempPath {
        TempPath::new(contents)
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        let base = write_temp("outbox:\n  batch_size: 50\n  max_attempts: 5\n");
        let override_file = write_temp("outbox:\n  batch_size: 200\n");
        let loaded = load_layered_yaml(&[&base, &override_file]).unwrap();
        assert_eq!(loaded.config_json["outbox"]["batch_size"], 200);
        assert_eq!(loaded.config_json["outbox"]["max_attempts"], 5);
    }

    #[test]
    fn canonical_hash_is_stable_regardless_of_key_order() {
        let a = write_temp("a: 1\nb: 2\n");
        let b = write_temp("b: 2\na: 1\n");
        let loaded_a = load_layered_yaml(&[&a]).unwrap();
        let loaded_b = load_layered_yaml(&[&b]).unwrap();
        assert_eq!(loaded_a.config_hash, loaded_b.config_hash);
    }

    #[test]
    fn settings_defaults_match_spec() {
        let loaded = load_layered_yaml(&[&write_temp("outbox:\n  batch_size: 50\n")]).unwrap();
        let settings = Settings::from_loaded(&loaded).unwrap();
        assert_eq!(settings.outbox.batch_size, 50);
        assert_eq!(settings.outbox.max_attempts, 5);
        assert_eq!(settings.runner.max_execution_seconds, 25);
        assert_eq!(settings.workflow.max_retries, 3);
        assert_eq!(settings.lock.retry_interval_ms, 1000);
    }
}
