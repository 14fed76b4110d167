//! Server configuration
//!
//! The config file is TOML. `[main]` maps onto [`MainConfig`]; every other
//! top-level table is a plugin block whose keys are handed, unparsed, to
//! that plugin's directive table (see [`crate::plugin`]).
//!
//! ```toml
//! [main]
//! work_thread_num = 4
//! maxfd = 4096
//! cpu_affinity = ["0001", "0010"]
//! log_level = "info"
//! memtag = "0xEFEFABCD"
//!
//! [http]
//! http_port = 8080
//! http_listen = "0.0.0.0,128"
//! backends = ["127.0.0.1:8081"]
//! ```

use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_MAXFD, MAX_WORKERS};
use crate::env::{env_get_bool, env_get_opt, env_override};
use crate::error::{Error, Result};
use crate::log::{LogConfig, LogFormat, LogLevel};
use crate::numeric::{bitset2u64, hex2i};

/// Memory debugging switches shared by every lookaside list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemConfig {
    /// Tag stamped on pooled objects
    pub tag: u32,
    /// Reset objects handed out from a free list
    pub zero: bool,
    /// Verify the tag when objects come back
    pub tag_check: bool,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            tag: u32::MAX,
            zero: true,
            tag_check: true,
        }
    }
}

/// The `[main]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MainConfig {
    /// Number of worker threads
    pub work_thread_num: usize,

    /// Descriptor registry size
    pub maxfd: usize,

    /// CPU masks as bit strings, worker i uses entry i % len
    pub cpu_affinity: Vec<String>,

    /// Directory for plume.log (stderr when unset)
    pub log_path: Option<PathBuf>,

    pub log_level: LogLevel,

    pub log_format: LogFormat,

    #[serde(deserialize_with = "de_memtag")]
    pub memtag: u32,

    pub tagcheck: bool,

    pub zeromem: bool,
}

impl Default for MainConfig {
    fn default() -> Self {
        let mem = MemConfig::default();
        Self {
            work_thread_num: 1,
            maxfd: DEFAULT_MAXFD,
            cpu_affinity: Vec::new(),
            log_path: None,
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            memtag: mem.tag,
            tagcheck: mem.tag_check,
            zeromem: mem.zero,
        }
    }
}

fn de_memtag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Hex(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n as u32),
        Raw::Hex(s) => hex2i(&s).ok_or_else(|| serde::de::Error::custom(format!("bad memtag `{s}`"))),
    }
}

/// One plugin block: the table name and its raw directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub directives: Vec<(String, Vec<String>)>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directives: Vec::new(),
        }
    }

    /// Append a directive (builder style, used by tests and the CLI).
    pub fn directive<I, S>(mut self, key: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.directives
            .push((key.to_string(), args.into_iter().map(Into::into).collect()));
        self
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub main: MainConfig,
    pub blocks: Vec<Block>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config document.
    pub fn parse(text: &str) -> Result<Self> {
        let mut table: toml::Table =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;

        let main = match table.remove("main") {
            Some(v) => v
                .try_into::<MainConfig>()
                .map_err(|e| Error::Config(format!("[main]: {e}")))?,
            None => MainConfig::default(),
        };

        let mut blocks = Vec::with_capacity(table.len());
        for (name, value) in table {
            let toml::Value::Table(body) = value else {
                return Err(Error::Config(format!("`{name}` must be a table")));
            };
            let mut block = Block::new(name);
            for (key, value) in body {
                let args = directive_args(&block.name, &key, value)?;
                block.directives.push((key, args));
            }
            blocks.push(block);
        }

        Ok(Self { main, blocks })
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Apply `PLUME_*` environment overrides on top of the file values.
    pub fn from_env(mut self) -> Self {
        let m = &mut self.main;
        env_override("PLUME_THREADS", &mut m.work_thread_num);
        env_override("PLUME_MAXFD", &mut m.maxfd);
        env_override("PLUME_LOG_LEVEL", &mut m.log_level);
        env_override("PLUME_LOG_FORMAT", &mut m.log_format);
        if let Some(p) = env_get_opt::<PathBuf>("PLUME_LOG_PATH") {
            m.log_path = Some(p);
        }
        m.tagcheck = env_get_bool("PLUME_TAGCHECK", m.tagcheck);
        m.zeromem = env_get_bool("PLUME_ZEROMEM", m.zeromem);
        self
    }

    pub fn work_threads(mut self, n: usize) -> Self {
        self.main.work_thread_num = n;
        self
    }

    pub fn maxfd(mut self, n: usize) -> Self {
        self.main.maxfd = n;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.main.log_level = level;
        self
    }

    pub fn block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        let m = &self.main;
        if m.work_thread_num == 0 {
            return Err("work_thread_num must be at least 1");
        }
        if m.work_thread_num > MAX_WORKERS {
            return Err("work_thread_num exceeds maximum");
        }
        if m.maxfd < 16 {
            return Err("maxfd must be at least 16");
        }
        if m.cpu_affinity.iter().any(|s| bitset2u64(s).is_none()) {
            return Err("cpu_affinity entries must be 1..=64 character bit strings");
        }
        Ok(())
    }

    /// CPU masks in worker order; empty when affinity is not configured.
    pub fn cpu_masks(&self) -> Vec<u64> {
        self.main
            .cpu_affinity
            .iter()
            .filter_map(|s| bitset2u64(s))
            .collect()
    }

    pub fn mem(&self) -> MemConfig {
        MemConfig {
            tag: self.main.memtag,
            zero: self.main.zeromem,
            tag_check: self.main.tagcheck,
        }
    }

    pub fn log(&self) -> LogConfig {
        LogConfig {
            path: self.main.log_path.clone(),
            level: self.main.log_level,
            format: self.main.log_format,
        }
    }
}

/// Flatten a TOML value into directive arguments.
fn directive_args(block: &str, key: &str, value: toml::Value) -> Result<Vec<String>> {
    let scalar = |v: toml::Value| -> Result<String> {
        match v {
            toml::Value::String(s) => Ok(s),
            toml::Value::Integer(i) => Ok(i.to_string()),
            toml::Value::Boolean(b) => Ok(if b { "on" } else { "off" }.to_string()),
            toml::Value::Float(f) => Ok(f.to_string()),
            _ => Err(Error::Config(format!(
                "[{block}] {key}: nested values are not allowed"
            ))),
        }
    };
    match value {
        toml::Value::Array(items) => items.into_iter().map(scalar).collect(),
        v => Ok(vec![scalar(v)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[main]
work_thread_num = 4
maxfd = 4096
cpu_affinity = ["0001", "0010"]
log_level = 4
memtag = "0xEFEFABCD"
zeromem = false

[http]
http_port = 8080
http_listen = "127.0.0.1,128"
backends = ["127.0.0.1:8081", "127.0.0.1:8082"]

[echo]
echo_str = "PONG"
echo_port = 9000
"#;

    #[test]
    fn test_defaults() {
        let cfg = Config::new();
        assert_eq!(cfg.main.work_thread_num, 1);
        assert_eq!(cfg.main.maxfd, 1024);
        assert_eq!(cfg.mem(), MemConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.main.work_thread_num, 4);
        assert_eq!(cfg.main.maxfd, 4096);
        assert_eq!(cfg.main.log_level, LogLevel::Debug);
        assert_eq!(cfg.cpu_masks(), vec![1, 2]);
        assert_eq!(cfg.mem().tag, 0xEFEF_ABCD);
        assert!(!cfg.mem().zero);
        assert!(cfg.mem().tag_check);

        let http = cfg.blocks.iter().find(|b| b.name == "http").unwrap();
        let backends = http
            .directives
            .iter()
            .find(|(k, _)| k == "backends")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(backends, vec!["127.0.0.1:8081", "127.0.0.1:8082"]);

        let echo = cfg.blocks.iter().find(|b| b.name == "echo").unwrap();
        assert!(echo
            .directives
            .contains(&("echo_port".to_string(), vec!["9000".to_string()])));
    }

    #[test]
    fn test_unknown_main_key_rejected() {
        let err = Config::parse("[main]\nworkers = 3\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_block_must_be_table() {
        assert!(Config::parse("http = 3\n").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Config::new().work_threads(0).validate().is_err());
        assert!(Config::new().maxfd(4).validate().is_err());
        let mut cfg = Config::new();
        cfg.main.cpu_affinity.push("1".repeat(65));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PLUME_MAXFD", "2048");
        let cfg = Config::new().from_env();
        std::env::remove_var("PLUME_MAXFD");
        assert_eq!(cfg.main.maxfd, 2048);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plume.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.blocks.len(), 2);
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
