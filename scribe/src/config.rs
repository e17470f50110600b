//! Configuration: built-in defaults, overridden by the YAML config file,
//! overridden by `SCRIBE_*` environment variables, overridden by CLI
//! flags (applied in `cli`).
//!
//! The OCR API key is deliberately NOT part of this config; it is read
//! only from its standard environment variable by the OCR backend and is
//! never persisted.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default periodic sync interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Default control API bind address.
pub const DEFAULT_HEALTH_ADDR: &str = "127.0.0.1:8787";

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OcrConfig {
    pub enabled: bool,
    /// OpenAI-compatible API base.
    pub base_url: String,
    pub model: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com".to_owned(),
            model: "gpt-4o-mini".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub output_dir: PathBuf,
    pub state_path: PathBuf,
    pub token_path: PathBuf,
    /// Only notebooks carrying at least one of these tags are synced;
    /// empty means everything.
    pub labels: Vec<String>,
    pub ocr: OcrConfig,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub health_addr: Option<SocketAddr>,
    pub auth_base: String,
    pub storage_base: String,
    /// Host fixup applied to every outgoing request; see
    /// `scribe_api::UrlRewriter`.
    pub rewrite_host_from: String,
    pub rewrite_host_to: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let state_dir = home.join(".scribe");
        let storage_base =
            scribe_api::remote::DEFAULT_STORAGE_BASE.to_owned();
        let rewrite_host_to = storage_base
            .trim_start_matches("https://")
            .to_owned();
        Self {
            output_dir: home.join("Notebooks"),
            state_path: state_dir.join("sync-state.json"),
            token_path: state_dir.join("token.json"),
            labels: Vec::new(),
            ocr: OcrConfig::default(),
            interval: DEFAULT_INTERVAL,
            health_addr: Some(
                DEFAULT_HEALTH_ADDR.parse().expect("valid default addr"),
            ),
            auth_base:
                "https://webapp-prod.cloud.remarkable.engineering".to_owned(),
            storage_base,
            rewrite_host_from: scribe_api::remote::LEGACY_STORAGE_HOST
                .to_owned(),
            rewrite_host_to,
        }
    }
}

impl Config {
    /// Defaults <- config file <- environment.
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).with_context(|| {
                        format!("reading config {}", path.display())
                    })?;
                serde_yaml::from_str(&text).with_context(|| {
                    format!("parsing config {}", path.display())
                })?
            }
            None => {
                let default_path = dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".scribe")
                    .join("config.yaml");
                match std::fs::read_to_string(&default_path) {
                    Ok(text) => serde_yaml::from_str(&text)
                        .with_context(|| {
                            format!(
                                "parsing config {}",
                                default_path.display()
                            )
                        })?,
                    Err(_) => Self::default(),
                }
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    /// `SCRIBE_*` variables mirror the config keys.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("SCRIBE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SCRIBE_STATE_PATH") {
            self.state_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SCRIBE_TOKEN_PATH") {
            self.token_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SCRIBE_LABELS") {
            self.labels = parse_labels(&v);
        }
        if let Ok(v) = std::env::var("SCRIBE_INTERVAL") {
            self.interval = humantime::parse_duration(&v)
                .context("parsing SCRIBE_INTERVAL")?;
        }
        if let Ok(v) = std::env::var("SCRIBE_HEALTH_ADDR") {
            self.health_addr =
                Some(v.parse().context("parsing SCRIBE_HEALTH_ADDR")?);
        }
        if let Ok(v) = std::env::var("SCRIBE_OCR_ENABLED") {
            self.ocr.enabled = matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        if let Ok(v) = std::env::var("SCRIBE_OCR_BASE_URL") {
            self.ocr.base_url = v;
        }
        if let Ok(v) = std::env::var("SCRIBE_OCR_MODEL") {
            self.ocr.model = v;
        }
        if let Ok(v) = std::env::var("SCRIBE_AUTH_BASE") {
            self.auth_base = v;
        }
        if let Ok(v) = std::env::var("SCRIBE_STORAGE_BASE") {
            self.storage_base = v;
        }
        Ok(())
    }
}

pub fn parse_labels(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn labels_csv() {
        assert_eq!(parse_labels("work, q2 ,"), vec!["work", "q2"]);
        assert!(parse_labels("").is_empty());
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.interval, DEFAULT_INTERVAL);
        assert!(config.ocr.enabled);
        assert!(config.auth_base.starts_with("https://"));
        assert!(config
            .token_path
            .to_string_lossy()
            .ends_with(".scribe/token.json"));
    }

    /// File and env layering in one test: env vars are process-global, so
    /// everything touching them runs serially here.
    #[test]
    fn file_then_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            concat!(
                "output-dir: /tmp/from-file\n",
                "interval: 30m\n",
                "labels: [work]\n",
                "ocr:\n",
                "  enabled: false\n",
                "  model: from-file\n",
            ),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/from-file"));
        assert_eq!(config.interval, Duration::from_secs(30 * 60));
        assert_eq!(config.labels, vec!["work"]);
        assert!(!config.ocr.enabled);
        assert_eq!(config.ocr.model, "from-file");
        // Untouched keys keep their defaults.
        assert!(config.auth_base.starts_with("https://"));

        // Environment overrides the file.
        std::env::set_var("SCRIBE_OUTPUT_DIR", "/tmp/from-env");
        std::env::set_var("SCRIBE_INTERVAL", "90s");
        std::env::set_var("SCRIBE_LABELS", "a,b");
        std::env::set_var("SCRIBE_OCR_ENABLED", "true");
        let config = Config::load(Some(&path)).unwrap();
        std::env::remove_var("SCRIBE_OUTPUT_DIR");
        std::env::remove_var("SCRIBE_INTERVAL");
        std::env::remove_var("SCRIBE_LABELS");
        std::env::remove_var("SCRIBE_OCR_ENABLED");

        assert_eq!(config.output_dir, PathBuf::from("/tmp/from-env"));
        assert_eq!(config.interval, Duration::from_secs(90));
        assert_eq!(config.labels, vec!["a", "b"]);
        assert!(config.ocr.enabled);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        assert!(Config::load(Some(std::path::Path::new(
            "/nonexistent/scribe.yaml"
        )))
        .is_err());
    }
}
