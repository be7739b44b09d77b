use crate::commandline::CliArgs;
use anyhow::{ensure, Result};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use sunspec_scan_lib::{
    connection::{self as conn, ConnectionConfig},
    protocol::DeviceIds,
    scanner::{self, ScanConfig},
};

/// Scan defaults loaded from a YAML file, e.g.
///
/// ```yaml
/// port: 1502
/// device_ids: "1-10,100"
/// fast_timeout: 300ms
/// slow_timeout: 3s
/// retries: 2
/// count: 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanProfile {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub device_ids: DeviceIds,
    #[serde(default = "default_fast_timeout", with = "humantime_serde")]
    pub fast_timeout: Duration,
    #[serde(default = "default_slow_timeout", with = "humantime_serde")]
    pub slow_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_retries")]
    pub retries: u8,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Number of inverters to find, `<= 0` scans every id.
    #[serde(default = "default_count")]
    pub count: i64,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default = "default_max_hex")]
    pub max_hex: i64,
}

fn default_port() -> u16 {
    conn::DEFAULT_PORT
}

fn default_fast_timeout() -> Duration {
    scanner::DEFAULT_FAST_TIMEOUT
}

fn default_slow_timeout() -> Duration {
    scanner::DEFAULT_SLOW_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    conn::DEFAULT_CONNECT_TIMEOUT
}

fn default_retries() -> u8 {
    conn::DEFAULT_RETRIES
}

fn default_retry_delay() -> Duration {
    conn::DEFAULT_RETRY_DELAY
}

fn default_count() -> i64 {
    -1
}

fn default_max_hex() -> i64 {
    -1
}

impl Default for ScanProfile {
    fn default() -> Self {
        Self {
            port: default_port(),
            device_ids: DeviceIds::default(),
            fast_timeout: default_fast_timeout(),
            slow_timeout: default_slow_timeout(),
            connect_timeout: default_connect_timeout(),
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            count: default_count(),
            chunk_size: None,
            max_hex: default_max_hex(),
        }
    }
}

impl ScanProfile {
    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("Loading scan profile from {path:?}");
        let file = File::open(path)?;
        let profile: ScanProfile = serde_yaml::from_reader(&file)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Applies the limits the command line enforces for the same options.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (conn::PORT_MIN..=conn::PORT_MAX).contains(&self.port),
            "port {} must be between {} and {}",
            self.port,
            conn::PORT_MIN,
            conn::PORT_MAX
        );
        ensure!(
            self.retries <= conn::RETRIES_MAX,
            "retries {} must be between 0 and {}",
            self.retries,
            conn::RETRIES_MAX
        );
        for (name, timeout) in [
            ("fast_timeout", self.fast_timeout),
            ("slow_timeout", self.slow_timeout),
            ("connect_timeout", self.connect_timeout),
        ] {
            ensure!(
                timeout <= conn::TIMEOUT_MAX,
                "{name} {timeout:?} must be between 0.0 and 60.0 seconds"
            );
        }
        ensure!(
            self.chunk_size != Some(0),
            "chunk_size must be greater than 0"
        );
        Ok(())
    }
}

/// Everything a scan run needs, after merging the command line over the
/// profile.
#[derive(Debug, Clone)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub scan: ScanConfig,
    pub device_ids: DeviceIds,
    /// Hex dump length, 0 disables the dump.
    pub max_hex: usize,
}

impl Settings {
    pub fn resolve(args: &CliArgs, profile: ScanProfile) -> Self {
        let connection = ConnectionConfig {
            host: args.host.clone(),
            port: args.port.unwrap_or(profile.port),
            connect_timeout: args.connect_timeout.unwrap_or(profile.connect_timeout),
            retries: args.retries.unwrap_or(profile.retries),
            retry_delay: args.retry_delay.unwrap_or(profile.retry_delay),
        };
        let scan = ScanConfig {
            fast_timeout: args.fast_timeout.unwrap_or(profile.fast_timeout),
            slow_timeout: args.slow_timeout.unwrap_or(profile.slow_timeout),
            chunk_size: args.chunk_size.or(profile.chunk_size),
            ..ScanConfig::default()
        }
        .with_target_count(args.count.unwrap_or(profile.count));
        let max_hex = args.max_hex.unwrap_or(profile.max_hex);

        Self {
            connection,
            scan,
            device_ids: args.device_ids.clone().unwrap_or(profile.device_ids),
            max_hex: usize::try_from(max_hex).unwrap_or(0),
        }
    }
}
