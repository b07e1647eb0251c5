//! Configuration management for the lint daemon.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::daemon::RegistrationDefaults;

/// Storage home used when neither `--home` nor the home directory is known.
const FALLBACK_HOME: &str = ".lint-daemon";

/// Command-line arguments for the lint daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "lint-daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Long-running code analysis daemon speaking JSON-RPC")]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1", env = "LINT_DAEMON_HOST")]
    pub host: IpAddr,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = crate::DEFAULT_PORT, env = "LINT_DAEMON_PORT")]
    pub port: u16,

    /// Transport mode: tcp or http
    #[arg(short, long, default_value = "tcp", env = "LINT_DAEMON_TRANSPORT")]
    pub transport: Transport,

    /// Storage home used when a registration does not name one
    #[arg(long, env = "LINT_DAEMON_HOME")]
    pub home: Option<PathBuf>,

    /// Languages enabled when a registration does not name any
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "js",
        env = "LINT_DAEMON_LANGUAGES"
    )]
    pub languages: Vec<String>,

    /// Enable debug logging
    #[arg(short, long, env = "LINT_DAEMON_DEBUG")]
    pub debug: bool,

    /// Log output format
    #[arg(long, default_value = "text", env = "LINT_DAEMON_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// Transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Http,
}

/// Log line format on stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address
    pub host: IpAddr,
    /// Listen port
    pub port: u16,
    /// Transport mode
    pub transport: Transport,
    /// Default storage home
    pub home: PathBuf,
    /// Default enabled languages
    pub languages: Vec<String>,
    /// Debug mode
    pub debug: bool,
    /// Log format
    pub log_format: LogFormat,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Values applied to registrations that leave fields unset.
    pub fn registration_defaults(&self) -> RegistrationDefaults {
        RegistrationDefaults {
            home: self.home.clone(),
            languages: self.languages.clone(),
        }
    }
}

/// `~/.lint-daemon`, or a relative directory when there is no home.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(FALLBACK_HOME))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_HOME))
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            transport: args.transport,
            home: args.home.unwrap_or_else(default_home),
            languages: args.languages,
            debug: args.debug,
            log_format: args.log_format,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: crate::DEFAULT_PORT,
            transport: Transport::Tcp,
            home: default_home(),
            languages: vec!["js".to_string()],
            debug: false,
            log_format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_default() {
        assert_eq!(Transport::default(), Transport::Tcp);
    }

    #[test]
    fn test_transport_serialization() {
        let transports = [(Transport::Tcp, "\"tcp\""), (Transport::Http, "\"http\"")];

        for (transport, expected) in &transports {
            let json = serde_json::to_string(transport).unwrap();
            assert_eq!(json, *expected);
        }
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:8050");
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.languages, vec!["js"]);
        assert!(config.home.ends_with(".lint-daemon"));
        assert!(!config.debug);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from([
            "lint-daemon",
            "--port",
            "0",
            "--transport",
            "http",
            "--home",
            "/var/lib/lint",
            "--languages",
            "js,ts",
            "--log-format",
            "json",
            "--debug",
        ])
        .unwrap();

        let config: Config = args.into();
        assert_eq!(config.port, 0);
        assert_eq!(config.transport, Transport::Http);
        assert_eq!(config.home, PathBuf::from("/var/lib/lint"));
        assert_eq!(config.languages, vec!["js", "ts"]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.debug);
    }

    #[test]
    fn test_rejects_unknown_transport() {
        assert!(Args::try_parse_from(["lint-daemon", "--transport", "stdio"]).is_err());
    }

    #[test]
    fn test_registration_defaults() {
        let config = Config {
            home: PathBuf::from("/data"),
            languages: vec!["py".to_string()],
            ..Config::default()
        };

        let defaults = config.registration_defaults();
        assert_eq!(defaults.home, PathBuf::from("/data"));
        assert_eq!(defaults.languages, vec!["py"]);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            transport: Transport::Http,
            port: 9000,
            ..Config::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"transport\":\"http\""));
        assert!(json.contains("\"port\":9000"));
        assert!(json.contains("\"log_format\":\"text\""));
    }
}
