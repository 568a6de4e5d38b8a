use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Parser, builder::BoolishValueParser};

use super::{BYTES_PER_MB, ProxyConfig};

/// Command-line arguments for the cacheproxy binary.
///
/// Every flag can also be set through the environment variable shown in
/// `--help`.
#[derive(Debug, Parser)]
#[command(name = "cacheproxy", version, about = "Transparent caching reverse proxy")]
pub struct CliArgs {
    /// Origin every request is forwarded to, e.g. `http://origin:8080`.
    #[arg(long = "target-url", env = "PROXY_TARGET_URL", value_name = "URL")]
    pub target_url: String,

    /// Expected number of cached responses.
    #[arg(long = "expected-items", env = "EXPECTED_ITEMS", value_name = "COUNT")]
    pub expected_items: usize,

    /// Keep cache counters and log them with every request.
    #[arg(
        long = "record-metrics",
        env = "RECORD_METRICS",
        value_name = "BOOL",
        action = ArgAction::Set,
        default_value_t = false,
        value_parser = BoolishValueParser::new()
    )]
    pub record_metrics: bool,

    /// Cache budget in megabytes (1 MB = 1,000,000 bytes).
    #[arg(
        long = "max-cache-size-mb",
        env = "MAX_CACHE_SIZE_MB",
        value_name = "MB",
        default_value_t = ProxyConfig::DEFAULT_MAX_CACHE_MB
    )]
    pub max_cache_size_mb: u64,

    /// Address the proxy listens on.
    #[arg(
        long = "listen-addr",
        env = "LISTEN_ADDR",
        value_name = "ADDR",
        default_value = "0.0.0.0:4242"
    )]
    pub listen_addr: SocketAddr,

    /// Upper bound on one upstream exchange, in seconds.
    #[arg(
        long = "upstream-timeout-secs",
        env = "UPSTREAM_TIMEOUT_SECS",
        value_name = "SECONDS",
        default_value_t = 30
    )]
    pub upstream_timeout_secs: u64,
}

impl CliArgs {
    /// Converts the parsed arguments into a [`ProxyConfig`]. Values are
    /// validated later, when the proxy is built.
    pub fn to_config(&self) -> ProxyConfig {
        ProxyConfig {
            target_url: self.target_url.clone(),
            expected_items: self.expected_items,
            record_metrics: self.record_metrics,
            max_cache_bytes: self.max_cache_size_mb.saturating_mul(BYTES_PER_MB),
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_is_well_formed() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn flags_map_onto_config() {
        let args = CliArgs::try_parse_from([
            "cacheproxy",
            "--target-url",
            "http://origin:8080/api",
            "--expected-items",
            "500",
            "--record-metrics",
            "yes",
            "--max-cache-size-mb",
            "3",
            "--upstream-timeout-secs",
            "5",
        ])
        .unwrap();

        let config = args.to_config();
        assert_eq!(config.target_url, "http://origin:8080/api");
        assert_eq!(config.expected_items, 500);
        assert!(config.record_metrics);
        assert_eq!(config.max_cache_bytes, 3_000_000);
        assert_eq!(config.upstream_timeout, Duration::from_secs(5));
    }

    #[test]
    fn target_url_is_required() {
        // Detach the env fallback so an exported PROXY_TARGET_URL cannot satisfy it.
        let command = CliArgs::command().mut_arg("target_url", |arg| arg.env(None::<&'static str>));
        let err = command
            .try_get_matches_from(["cacheproxy", "--expected-items", "1"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert!(err.to_string().contains("--target-url"));
    }
}
