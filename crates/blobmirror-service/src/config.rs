//! Service configuration, read from the process environment at startup.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::level_filters::LevelFilter;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other).
    Auto,
    /// With colors.
    Pretty,
    /// Simplified log output.
    Simplified,
    /// Dump out JSON lines.
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "auto" => Self::Auto,
            "pretty" => Self::Pretty,
            "simplified" => Self::Simplified,
            "json" => Self::Json,
            other => bail!("unknown log format `{other}`"),
        })
    }
}

/// Controls the logging system.
#[derive(Clone, Debug)]
pub struct Logging {
    /// The default log level, overridable via `RUST_LOG`.
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Runtime configuration of the mirror.
///
/// All values come from the environment; see [`Config::from_env`] for the
/// variable names.
#[derive(Clone, Debug)]
pub struct Config {
    /// Connection string for the backing object store.
    pub primary: String,
    /// Local directory for cached object files. Created if missing.
    pub cache_path: PathBuf,
    /// Cap on negatively cached keys. Clamped to at least 10.
    pub max_not_found: usize,
    /// Cap on bytes held by fully downloaded items. Clamped to at least
    /// 5 MiB.
    pub max_size: u64,
    /// How long an item stays valid before it is re-resolved. Clamped to at
    /// least one hour.
    pub cache_time: Duration,
    /// Where `GET /` redirects, if anywhere.
    pub redirect: Option<String>,
    /// Secret required by `POST /reload`.
    pub api_key: Option<String>,
    /// Keys matching this pattern never expire by time. They still count
    /// against the size cap.
    pub keep_forever: Option<Regex>,
    /// Responses for matching keys are marked uncacheable downstream.
    pub no_cache: Option<Regex>,
    /// Object key whose content serves as the body of 404 responses.
    pub not_found_html: Option<String>,
    /// Object key served for directory-like request paths.
    pub index_html: Option<String>,
    /// Request paths matching this pattern are served the index object.
    pub index_html_regex: Option<Regex>,
    /// Host and port to bind the HTTP server to.
    pub bind: String,
    /// Configuration for internal logging.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary: String::new(),
            cache_path: PathBuf::from("cache"),
            max_not_found: 10 * 1024,
            max_size: 10 * 1024 * 1024,
            cache_time: Duration::from_secs(24 * 3600),
            redirect: None,
            api_key: None,
            keep_forever: None,
            no_cache: None,
            not_found_html: None,
            index_html: None,
            index_html_regex: None,
            bind: "0.0.0.0:8080".to_owned(),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Reads the configuration from the environment.
    ///
    /// `PRIMARY` and `CACHEPATH` are required. `MAX_NOT_FOUND` (default
    /// `10k`) and `MAX_SIZE` (default `10m`) take binary size suffixes,
    /// `CACHE_TIME` (default `1d`) takes duration suffixes. `REDIRECT`,
    /// `APIKEY`, `KEEP_FOREVER_REGEX`, `NO_CACHE_REGEX`, `NOTFOUND_HTML`,
    /// `INDEX_HTML`, `INDEX_HTML_REGEX`, `BIND`, `LOG_LEVEL` and
    /// `LOG_FORMAT` are optional.
    pub fn from_env() -> Result<Self> {
        let mut config = Config {
            primary: env::var("PRIMARY").context("PRIMARY is required")?,
            cache_path: env::var("CACHEPATH")
                .context("CACHEPATH is required")?
                .into(),
            ..Default::default()
        };

        if let Some(value) = env_var("MAX_NOT_FOUND") {
            config.max_not_found = parse_size(&value)
                .with_context(|| format!("invalid MAX_NOT_FOUND `{value}`"))?
                as usize;
        }
        if let Some(value) = env_var("MAX_SIZE") {
            config.max_size =
                parse_size(&value).with_context(|| format!("invalid MAX_SIZE `{value}`"))?;
        }
        if let Some(value) = env_var("CACHE_TIME") {
            config.cache_time = humantime::parse_duration(&value)
                .with_context(|| format!("invalid CACHE_TIME `{value}`"))?;
        }

        config.redirect = env_var("REDIRECT");
        config.api_key = env_var("APIKEY");
        config.keep_forever = env_regex("KEEP_FOREVER_REGEX")?;
        config.no_cache = env_regex("NO_CACHE_REGEX")?;
        config.not_found_html = env_var("NOTFOUND_HTML");
        config.index_html = env_var("INDEX_HTML");
        config.index_html_regex = env_regex("INDEX_HTML_REGEX")?;

        if let Some(value) = env_var("BIND") {
            config.bind = value;
        }
        if let Some(value) = env_var("LOG_LEVEL") {
            config.logging.level = value
                .parse()
                .ok()
                .with_context(|| format!("invalid LOG_LEVEL `{value}`"))?;
        }
        if let Some(value) = env_var("LOG_FORMAT") {
            config.logging.format = value.parse()?;
        }

        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_regex(name: &str) -> Result<Option<Regex>> {
    env_var(name)
        .map(|value| Regex::new(&value).with_context(|| format!("invalid {name} `{value}`")))
        .transpose()
}

/// Parses a byte size with binary suffixes.
///
/// `b`, `k`, `m`, `g`, `t` and `p` denote powers of 1024; a bare number is
/// taken as-is.
pub fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim().to_ascii_lowercase();
    let (digits, shift) = match input.strip_suffix(|c: char| c.is_ascii_alphabetic()) {
        Some(digits) => {
            let shift = match input.as_bytes()[input.len() - 1] {
                b'b' => 0,
                b'k' => 10,
                b'm' => 20,
                b'g' => 30,
                b't' => 40,
                b'p' => 50,
                other => bail!("unknown size suffix `{}`", other as char),
            };
            (digits, shift)
        }
        None => (input.as_str(), 0),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size `{input}`"))?;
    value
        .checked_mul(1 << shift)
        .with_context(|| format!("size `{input}` overflows"))
}
