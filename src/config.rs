use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub local_prefix: String,
    pub verify_client_checksum: bool,
    pub send_checksum: bool,
    pub chunk_ttl: Duration,
    pub sweep_interval: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "ClawIO storage daemon")]
pub struct Args {
    /// Host to bind to (overrides CLAWIO_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CLAWIO_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding user homes (overrides CLAWIO_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Staging directory, same filesystem as data-dir (overrides CLAWIO_TMP_DIR)
    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,

    /// Selector of the local backend (overrides CLAWIO_LOCAL_PREFIX)
    #[arg(long)]
    pub local_prefix: Option<String>,

    /// Verify checksums sent by clients (overrides CLAWIO_VERIFY_CLIENT_CHECKSUM)
    #[arg(long)]
    pub verify_client_checksum: Option<bool>,

    /// Include checksums in stat results (overrides CLAWIO_SEND_CHECKSUM)
    #[arg(long)]
    pub send_checksum: Option<bool>,

    /// Age after which an unfinished chunked upload is dropped (overrides CLAWIO_CHUNK_TTL_SECS)
    #[arg(long)]
    pub chunk_ttl_secs: Option<u64>,

    /// How often abandoned uploads are swept (overrides CLAWIO_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::merge(Args::parse())
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let chunk_ttl_secs = match args.chunk_ttl_secs {
            Some(v) => v,
            None => env_or("CLAWIO_CHUNK_TTL_SECS", 86_400)?,
        };
        let sweep_interval_secs = match args.sweep_interval_secs {
            Some(v) => v,
            None => env_or("CLAWIO_SWEEP_INTERVAL_SECS", 3_600)?,
        };
        if sweep_interval_secs == 0 {
            anyhow::bail!("sweep interval must be at least one second");
        }

        let cfg = Self {
            host: match args.host {
                Some(v) => v,
                None => env_or("CLAWIO_HOST", "0.0.0.0".to_string())?,
            },
            port: match args.port {
                Some(v) => v,
                None => env_or("CLAWIO_PORT", 1502)?,
            },
            data_dir: match args.data_dir {
                Some(v) => v,
                None => env_or("CLAWIO_DATA_DIR", PathBuf::from("./data/local/homes"))?,
            },
            tmp_dir: match args.tmp_dir {
                Some(v) => v,
                None => env_or("CLAWIO_TMP_DIR", PathBuf::from("./data/local/tmp"))?,
            },
            local_prefix: match args.local_prefix {
                Some(v) => v,
                None => env_or("CLAWIO_LOCAL_PREFIX", "local".to_string())?,
            },
            verify_client_checksum: match args.verify_client_checksum {
                Some(v) => v,
                None => env_or("CLAWIO_VERIFY_CLIENT_CHECKSUM", true)?,
            },
            send_checksum: match args.send_checksum {
                Some(v) => v,
                None => env_or("CLAWIO_SEND_CHECKSUM", false)?,
            },
            chunk_ttl: Duration::from_secs(chunk_ttl_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        };

        if cfg.local_prefix.is_empty() || cfg.local_prefix.contains('/') {
            anyhow::bail!(
                "local prefix `{}` must be a single non-empty path segment",
                cfg.local_prefix
            );
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
