//! 🔧 App configuration: one TOML file, a handful of `VBX_` env vars, one struct.
//!
//! 🎬 *[a config file walks into a bar. the bartender says "you're missing a rest_url".
//! the config file says "it's in the environment". it was. figment found it.]*
//!
//! Environment variables are the base layer, the TOML file (when given) goes on top and
//! wins on conflicts. Nested keys use a double underscore:
//! `VBX_BATCH__MAX_RETRIES=3` is `[batch] max_retries = 3`.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::ConnectionConfig;
use crate::config::{BatchConfig, ReadinessConfig};

/// 📦 Everything the `vbx` binary needs to know.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    pub source: SourceConfig,
    /// ⏳ After the last flush, wait for vector indexing when `enabled`.
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

/// 📂 Where the NDJSON records come from.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum SourceConfig {
    File(FileSourceConfig),
    Stdin,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FileSourceConfig {
    pub file_name: String,
    /// 🫁 `None` sniffs the `.gz` extension.
    #[serde(default)]
    pub gzip: Option<bool>,
    /// 📬 Parsed lines buffered between the reader thread and the engine.
    #[serde(default = "default_line_buffer")]
    pub line_buffer: usize,
}

fn default_line_buffer() -> usize {
    1024
}

impl FileSourceConfig {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            gzip: None,
            line_buffer: default_line_buffer(),
        }
    }

    pub fn is_gzip(&self) -> bool {
        self.gzip.unwrap_or_else(|| self.file_name.ends_with(".gz"))
    }
}

/// 🚀 Load the config from `VBX_*` env vars, plus the TOML file if there is one.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 loading configuration from {}",
        config_file_name
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "the environment only".to_string())
    );

    let config = Figment::new().merge(Env::prefixed("VBX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 could not parse configuration from '{}' and VBX_* environment variables",
            path.display()
        ),
        None => "💀 could not parse configuration from VBX_* environment variables, \
                 and no file was given"
            .to_string(),
    };
    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchMode, ConsistencyLevel};
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn the_one_where_a_full_file_fills_every_section() {
        let file = write_config(
            r#"
            [connection]
            grpc_url = "http://localhost:50051"
            rest_url = "http://localhost:8080"
            api_key = "hunter2"

            [batch]
            consistency_level = "ALL"
            max_retries = 3

            [batch.mode]
            kind = "fixed_size"
            batch_size = 200
            concurrency = 4

            [batch.retryable_errors]
            voyage = ["(?i)slow down"]

            [source.File]
            file_name = "articles.ndjson.gz"

            [readiness]
            enabled = true
            poll_interval_ms = 750
            "#,
        );
        let config = load_config(Some(file.path())).expect("config parses");

        assert_eq!(config.connection.api_key.as_deref(), Some("hunter2"));
        assert_eq!(
            config.batch.mode,
            BatchMode::FixedSize {
                batch_size: 200,
                concurrency: 4
            }
        );
        assert_eq!(config.batch.consistency_level, ConsistencyLevel::All);
        assert_eq!(config.batch.max_retries, 3);
        assert_eq!(config.batch.retryable_errors["voyage"], vec!["(?i)slow down"]);
        match &config.source {
            SourceConfig::File(file) => {
                assert!(file.is_gzip(), "sniffed from the extension");
                assert_eq!(file.line_buffer, 1024);
            }
            other => panic!("expected a file source, got {other:?}"),
        }
        assert!(config.readiness.enabled);
        assert_eq!(config.readiness.poll_interval_ms, 750);
    }

    #[test]
    fn the_one_where_stdin_and_defaults_are_enough() {
        let file = write_config(
            r#"
            source = "Stdin"

            [connection]
            grpc_url = "http://localhost:50051"
            rest_url = "http://localhost:8080"
            "#,
        );
        let config = load_config(Some(file.path())).expect("config parses");
        assert_eq!(config.source, SourceConfig::Stdin);
        assert_eq!(config.batch, BatchConfig::default());
        assert!(!config.readiness.enabled);
    }

    #[test]
    fn the_one_where_a_missing_connection_is_called_out() {
        let file = write_config(
            r#"
            source = "Stdin"
            "#,
        );
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("could not parse configuration"));
    }

    #[test]
    fn the_one_where_gzip_can_be_forced_either_way() {
        let mut plain = FileSourceConfig::new("dump.gz");
        plain.gzip = Some(false);
        assert!(!plain.is_gzip());
        assert!(!FileSourceConfig::new("dump.ndjson").is_gzip());
    }
}
