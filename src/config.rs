//! Repository configuration, read from `dynmake.toml` at the repo root.
//! Every field has a default, so a missing file is a valid configuration.

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const CONFIG_FILE: &str = "dynmake.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub engine: EngineConfig,
    /// backend name -> resource name -> limits.
    pub backends: BTreeMap<String, BTreeMap<String, ResourceConfig>>,
    pub caches: BTreeMap<String, CacheConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_dep_depth: usize,
    pub max_submits: u32,
    pub max_retries_on_lost: u32,
    /// Seconds a remote host may take to answer.
    pub network_delay: f64,
    /// Seconds between liveness checks of running jobs.
    pub heartbeat: f64,
    pub heartbeat_margin: u32,
    pub kill_sigs: Vec<i32>,
    /// Seconds between two signals of `kill_sigs`.
    pub kill_grace: f64,
    pub admin_dir: String,
    /// The LD_PRELOAD/LD_AUDIT library; searched next to the executable if
    /// not set.
    pub autodep_lib: Option<String>,
    pub rules: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_dep_depth: 100,
            max_submits: 10,
            max_retries_on_lost: 1,
            network_delay: 1.0,
            heartbeat: 10.0,
            heartbeat_margin: 3,
            kill_sigs: vec![libc::SIGTERM, libc::SIGKILL],
            kill_grace: 1.0,
            admin_dir: ".dynmake".to_string(),
            autodep_lib: None,
            rules: "rules.json".to_string(),
        }
    }
}

impl EngineConfig {
    /// How long a running job may go without confirmed liveness.
    pub fn lost_after(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.network_delay * self.heartbeat_margin as f64)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub capacity: u64,
    #[serde(default)]
    pub precision: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub dir: String,
    /// Maximum total size in bytes.
    #[serde(default = "default_cache_size")]
    pub size: u64,
    /// Namespace shared by repos that may exchange results.  Clones of a
    /// repo share it wherever they live.
    #[serde(default = "default_cache_repo")]
    pub repo: String,
}

fn default_cache_size() -> u64 {
    1 << 30
}

fn default_cache_repo() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine: EngineConfig::default(),
            backends: BTreeMap::new(),
            caches: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Read the config from `root`, falling back to defaults when absent.
    pub fn load(root: &Path) -> anyhow::Result<Config> {
        let path = root.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("{}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        config.fill_defaults();
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(text)?;
        if config.engine.kill_sigs.is_empty() {
            anyhow::bail!("engine.kill_sigs must not be empty");
        }
        if config.engine.heartbeat <= 0.0 {
            anyhow::bail!("engine.heartbeat must be positive");
        }
        Ok(config)
    }

    /// With no backend configured, provide a local one sized to the machine.
    pub fn fill_defaults(&mut self) {
        if self.backends.is_empty() {
            let cpus = std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1) as u64;
            let mut local = BTreeMap::new();
            local.insert(
                "cpu".to_string(),
                ResourceConfig {
                    capacity: cpus,
                    precision: 0,
                },
            );
            self.backends.insert("local".to_string(), local);
        }
    }

    /// `-j N` overrides the cpu capacity of the local backend.
    pub fn set_parallelism(&mut self, n: u64) {
        let local = self.backends.entry("local".to_string()).or_default();
        local
            .entry("cpu".to_string())
            .and_modify(|r| r.capacity = n)
            .or_insert(ResourceConfig {
                capacity: n,
                precision: 0,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let mut c = Config::parse("").unwrap();
        assert_eq!(c.engine.max_dep_depth, 100);
        assert_eq!(c.engine.kill_sigs, vec![15, 9]);
        assert!(c.backends.is_empty());
        c.fill_defaults();
        assert!(c.backends["local"]["cpu"].capacity >= 1);
    }

    #[test]
    fn backends_and_caches() {
        let c = Config::parse(
            r#"
[engine]
max_retries_on_lost = 3
heartbeat = 0.5

[backends.local.cpu]
capacity = 4

[backends.local.mem]
capacity = 1000
precision = 100

[caches.shared]
dir = "/tmp/cache"
size = 1000000
"#,
        )
        .unwrap();
        assert_eq!(c.engine.max_retries_on_lost, 3);
        assert_eq!(c.backends["local"]["mem"].precision, 100);
        assert_eq!(c.backends["local"]["cpu"].precision, 0);
        assert_eq!(c.caches["shared"].size, 1000000);
        assert_eq!(c.caches["shared"].repo, "default");
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(Config::parse("[engine]\nmax_depth = 3\n").is_err());
        assert!(Config::parse("[engine]\nkill_sigs = []\n").is_err());
    }

    #[test]
    fn parallelism_override() {
        let mut c = Config::default();
        c.fill_defaults();
        c.set_parallelism(2);
        assert_eq!(c.backends["local"]["cpu"].capacity, 2);
    }
}
