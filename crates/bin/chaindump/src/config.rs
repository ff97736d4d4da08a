//! Process configuration: a TOML file with `CHAINDUMP_CONFIG_*` environment overrides.
//!
//! Environment variables use double underscores to separate nested keys, so
//! `CHAINDUMP_CONFIG_EXTRACT__FLUSH_THRESHOLD` maps to `extract.flush_threshold`. They always
//! win over values in the file.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use common::StreamKind;
use dump::{EndBlock, InvalidConfigError};
use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use url::Url;

const ENV_PREFIX: &str = "CHAINDUMP_CONFIG_";

/// Configuration as deserialized from the file, before paths are resolved.
#[derive(Debug, Clone, serde::Deserialize)]
struct ConfigFile {
    rpc_url: String,
    /// Local staging root for written files (default: `data`)
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    /// `s3://bucket/prefix`, `gs://bucket/prefix` or a directory. Unset disables archival.
    archive_url: Option<String>,
    /// Where per-stream checkpoint records live (default: `checkpoints`)
    #[serde(default = "default_checkpoint_dir")]
    checkpoint_dir: PathBuf,
    /// Target height. Unset means the latest block.
    end_block: Option<EndBlock>,
    #[serde(default = "default_streams")]
    streams: Vec<StreamKind>,
    #[serde(default = "default_final_blocks_only")]
    final_blocks_only: bool,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    log_dir: Option<PathBuf>,
    #[serde(default)]
    extract: dump::Config,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_streams() -> Vec<StreamKind> {
    StreamKind::ALL.to_vec()
}

fn default_final_blocks_only() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Resolved process configuration. Every path is absolute or relative to the working directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: Url,
    pub data_dir: PathBuf,
    pub archive_url: Option<String>,
    pub checkpoint_dir: PathBuf,
    pub end_block: EndBlock,
    pub streams: Vec<StreamKind>,
    /// Resolve relative targets against the finalized block rather than the chain head.
    pub final_blocks_only: bool,
    pub request_timeout: Duration,
    pub log_dir: Option<PathBuf>,
    pub extract: dump::Config,
    /// Directory of the config file. Relative filesystem archive locations resolve against it.
    pub base_dir: PathBuf,
}

/// Loads the configuration at `config_path`, applying environment overrides.
///
/// Relative paths in the file resolve against the file's directory.
pub fn load(config_path: impl Into<PathBuf>) -> Result<Config, LoadError> {
    let config_path = config_path.into();
    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let file: ConfigFile = Figment::new()
        .merge(Toml::file(&config_path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|err| LoadError::Figment(config_path.clone(), Box::new(err)))?;

    let rpc_url = Url::parse(&file.rpc_url).map_err(|source| LoadError::RpcUrl {
        url: file.rpc_url.clone(),
        source,
    })?;
    if file.streams.is_empty() {
        return Err(LoadError::NoStreams);
    }
    if file.request_timeout_secs == 0 {
        return Err(LoadError::ZeroTimeout);
    }
    file.extract.validate()?;

    Ok(Config {
        rpc_url,
        data_dir: base_dir.join(file.data_dir),
        archive_url: file.archive_url,
        checkpoint_dir: base_dir.join(file.checkpoint_dir),
        end_block: file.end_block.unwrap_or_default(),
        streams: file.streams,
        final_blocks_only: file.final_blocks_only,
        request_timeout: Duration::from_secs(file.request_timeout_secs),
        log_dir: file.log_dir.map(|dir| base_dir.join(dir)),
        extract: file.extract,
        base_dir,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read config file {}", .0.display())]
    Figment(PathBuf, #[source] Box<figment::Error>),

    #[error("invalid rpc_url '{url}'")]
    RpcUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("streams must name at least one stream")]
    NoStreams,

    #[error("request_timeout_secs must be greater than zero")]
    ZeroTimeout,

    #[error("invalid [extract] table")]
    Extract(#[from] InvalidConfigError),
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn minimal_file_gets_defaults_relative_to_its_directory() {
        Jail::expect_with(|jail| {
            //* Given
            jail.create_file("chaindump.toml", r#"rpc_url = "http://localhost:8545""#)?;
            let config_path = jail.directory().join("chaindump.toml");

            //* When
            let config = load(&config_path).expect("config should load");

            //* Then
            assert_eq!(config.data_dir, jail.directory().join("data"));
            assert_eq!(config.checkpoint_dir, jail.directory().join("checkpoints"));
            assert_eq!(config.streams, StreamKind::ALL);
            assert_eq!(config.end_block, EndBlock::Latest);
            assert!(config.final_blocks_only);
            assert_eq!(config.request_timeout, Duration::from_secs(60));
            assert!(config.archive_url.is_none());
            assert_eq!(config.extract.flush_threshold, 5_000);
            Ok(())
        });
    }

    #[test]
    fn file_values_and_nested_tables_are_read() {
        Jail::expect_with(|jail| {
            //* Given
            jail.create_file(
                "chaindump.toml",
                r#"
                rpc_url = "https://node.example.com"
                data_dir = "/var/lib/chaindump"
                archive_url = "s3://bucket/mainnet"
                end_block = -128
                streams = ["logs", "traces"]
                final_blocks_only = false

                [extract]
                flush_threshold = 1000
                window_size = 50

                [extract.retry]
                max_attempts = 3
                "#,
            )?;

            //* When
            let config = load(jail.directory().join("chaindump.toml")).expect("config should load");

            //* Then
            assert_eq!(config.data_dir, PathBuf::from("/var/lib/chaindump"));
            assert_eq!(config.archive_url.as_deref(), Some("s3://bucket/mainnet"));
            assert_eq!(config.end_block, EndBlock::LatestMinus(128));
            assert_eq!(config.streams, [StreamKind::Logs, StreamKind::Traces]);
            assert!(!config.final_blocks_only);
            assert_eq!(config.extract.flush_threshold, 1_000);
            assert_eq!(config.extract.window_size, 50);
            assert_eq!(config.extract.min_window_size, 10);
            assert_eq!(config.extract.retry.max_attempts, 3);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_nested_keys() {
        Jail::expect_with(|jail| {
            //* Given
            jail.create_file(
                "chaindump.toml",
                r#"
                rpc_url = "http://localhost:8545"
                end_block = 100

                [extract]
                flush_threshold = 1000
                "#,
            )?;
            jail.set_env("CHAINDUMP_CONFIG_EXTRACT__FLUSH_THRESHOLD", "250");
            jail.set_env("CHAINDUMP_CONFIG_END_BLOCK", "latest");

            //* When
            let config = load(jail.directory().join("chaindump.toml")).expect("config should load");

            //* Then
            assert_eq!(config.extract.flush_threshold, 250);
            assert_eq!(config.end_block, EndBlock::Latest);
            Ok(())
        });
    }

    #[test]
    fn invalid_extract_table_is_rejected() {
        Jail::expect_with(|jail| {
            //* Given
            jail.create_file(
                "chaindump.toml",
                r#"
                rpc_url = "http://localhost:8545"

                [extract]
                window_size = 5
                min_window_size = 10
                "#,
            )?;

            //* When
            let result = load(jail.directory().join("chaindump.toml"));

            //* Then
            assert!(matches!(result, Err(LoadError::Extract(_))));
            Ok(())
        });
    }

    #[test]
    fn missing_rpc_url_is_reported_with_the_file() {
        Jail::expect_with(|jail| {
            jail.create_file("chaindump.toml", "streams = []")?;
            let config_path = jail.directory().join("chaindump.toml");

            let err = load(&config_path).unwrap_err();

            assert!(matches!(&err, LoadError::Figment(path, _) if *path == config_path));
            Ok(())
        });
    }

    #[test]
    fn empty_stream_list_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "chaindump.toml",
                r#"
                rpc_url = "http://localhost:8545"
                streams = []
                "#,
            )?;

            let result = load(jail.directory().join("chaindump.toml"));

            assert!(matches!(result, Err(LoadError::NoStreams)));
            Ok(())
        });
    }
}
