//! Gate configuration, loaded from YAML.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Fatal configuration problem, reported at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub ip_extraction: IpExtractionConfig,

    pub abuseipdb: AbuseIPDBConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Addresses and CIDRs that bypass the gate.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Kill switch; a disabled gate allows everything.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub fail_action: FailAction,

    #[serde(default = "default_true")]
    pub log_blocked: bool,

    #[serde(default)]
    pub log_allowed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_action: FailAction::default(),
            log_blocked: true,
            log_allowed: false,
        }
    }
}

/// Verdict used when no reputation can be obtained.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    /// Fail open.
    #[default]
    Allow,
    /// Fail closed.
    Block,
}

/// Where the client address comes from.
///
/// Forwarding headers are honored only when the socket peer is one of
/// `trusted_proxies`, or when the host supplies no peer at all. Any other
/// peer is judged by its own address.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpExtractionConfig {
    /// Checked in order; the first parseable value wins.
    #[serde(default = "default_ip_headers")]
    pub headers: Vec<String>,

    /// Take the leftmost hop of a comma list instead of the rightmost.
    #[serde(default = "default_true")]
    pub use_first_ip: bool,

    /// Proxy addresses and CIDRs allowed to set the headers above.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl Default for IpExtractionConfig {
    fn default() -> Self {
        Self {
            headers: default_ip_headers(),
            use_first_ip: true,
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_ip_headers() -> Vec<String> {
    ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AbuseIPDBConfig {
    /// Sent as the `Key` header. Use `${VAR}` to keep it out of the file.
    pub api_key: String,

    /// `check` is appended to this.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl AbuseIPDBConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_base_url() -> String {
    "https://api.abuseipdb.com/api/v2/".to_string()
}

fn default_max_age_days() -> u32 {
    90
}

fn default_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Lifetime of allow and deny verdicts alike.
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

fn default_cache_ttl() -> u64 {
    86_400
}

fn default_max_entries() -> usize {
    100_000
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Defaults everywhere except the API key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            settings: Settings::default(),
            ip_extraction: IpExtractionConfig::default(),
            abuseipdb: AbuseIPDBConfig {
                api_key: api_key.into(),
                base_url: default_base_url(),
                max_age_days: default_max_age_days(),
                timeout_ms: default_timeout(),
            },
            cache: CacheConfig::default(),
            allowlist: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Expand `${VAR}` references, parse, then validate.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let abuseipdb = &self.abuseipdb;
        if abuseipdb.api_key.trim().is_empty() {
            return Err(invalid("abuseipdb.api_key is empty"));
        }

        let base_url = abuseipdb.base_url.trim();
        if !base_url.starts_with("https://") && !base_url.starts_with("http://") {
            return Err(invalid(format!(
                "abuseipdb.base_url must be an http(s) URL, got {:?}",
                base_url
            )));
        }

        if abuseipdb.timeout_ms == 0 {
            return Err(invalid("abuseipdb.timeout_ms must be > 0"));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(invalid("cache.ttl_seconds must be > 0"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be > 0"));
        }

        AddressSet::parse("allowlist", &self.allowlist)?;
        AddressSet::parse(
            "ip_extraction.trusted_proxies",
            &self.ip_extraction.trusted_proxies,
        )?;

        Ok(())
    }

    /// YAML printed by `--print-config`.
    pub fn example() -> String {
        r#"settings:
  enabled: true
  fail_action: allow         # verdict when AbuseIPDB cannot be reached: allow | block
  log_blocked: true
  log_allowed: false

ip_extraction:
  headers: ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"]
  use_first_ip: true
  # Only these peers may set the headers above
  trusted_proxies:
    - "127.0.0.1"

abuseipdb:
  api_key: "${ABUSEIPDB_API_KEY}"
  base_url: "https://api.abuseipdb.com/api/v2/"
  max_age_days: 90
  timeout_ms: 5000

cache:
  ttl_seconds: 86400         # scores above 50 are denied, verdicts kept a day
  max_entries: 100000

allowlist:
  - "127.0.0.1"
  - "10.0.0.0/8"
  - "192.168.0.0/16"
  - "172.16.0.0/12"
"#
        .to_string()
    }
}

/// A set of single addresses and networks.
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    hosts: Vec<IpAddr>,
    networks: Vec<IpNet>,
}

impl AddressSet {
    /// Parse entries such as `192.0.2.1` or `10.0.0.0/8`. `field` names the
    /// config key in errors.
    pub fn parse(field: &str, entries: &[String]) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        for entry in entries {
            let entry = entry.trim();
            if let Ok(ip) = entry.parse::<IpAddr>() {
                set.hosts.push(ip);
            } else if let Ok(net) = entry.parse::<IpNet>() {
                set.networks.push(net);
            } else {
                return Err(invalid(format!("{}: invalid entry {:?}", field, entry)));
            }
        }
        Ok(set)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.hosts.contains(ip) || self.networks.iter().any(|net| net.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.hosts.len() + self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Replace `${NAME}` with the environment value, or nothing if unset.
fn expand_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid")
    });

    re.replace_all(content, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::with_api_key("k");
        assert!(config.settings.enabled);
        assert_eq!(config.settings.fail_action, FailAction::Allow);
        assert_eq!(config.cache.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.ip_extraction.headers[0], "x-forwarded-for");
        assert!(config.ip_extraction.trusted_proxies.is_empty());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("GATE_TEST_API_KEY", "secret123");
        assert_eq!(
            expand_env_vars("api_key: \"${GATE_TEST_API_KEY}\""),
            "api_key: \"secret123\""
        );
        std::env::remove_var("GATE_TEST_API_KEY");

        assert_eq!(
            expand_env_vars("api_key: \"${GATE_NONEXISTENT_VAR}\""),
            "api_key: \"\""
        );
    }

    #[test]
    fn test_address_set() {
        let set = AddressSet::parse("allowlist", &strings(&["192.168.1.1", "10.0.0.0/8", "::1"]))
            .unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!set.contains(&"192.168.1.2".parse().unwrap()));
        assert!(set.contains(&"10.255.255.255".parse().unwrap()));
        assert!(!set.contains(&"11.0.0.1".parse().unwrap()));
        assert!(set.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_address_set_rejects_garbage() {
        let err = AddressSet::parse("allowlist", &strings(&["not-an-ip"])).unwrap_err();
        assert!(err.to_string().contains("allowlist"));
    }

    #[test]
    fn test_parse_config_yaml() {
        let yaml = r#"
settings:
  fail_action: block

ip_extraction:
  trusted_proxies: ["10.0.0.0/8"]

abuseipdb:
  api_key: "k"
  timeout_ms: 2000

cache:
  ttl_seconds: 600

allowlist:
  - "127.0.0.1"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.settings.enabled);
        assert_eq!(config.settings.fail_action, FailAction::Block);
        assert_eq!(config.ip_extraction.trusted_proxies, strings(&["10.0.0.0/8"]));
        assert_eq!(config.abuseipdb.timeout_ms, 2000);
        assert_eq!(config.abuseipdb.base_url, "https://api.abuseipdb.com/api/v2/");
        assert_eq!(config.cache.ttl_seconds, 600);
        assert_eq!(config.cache.max_entries, 100_000);
    }

    #[test]
    fn test_example_config_parses() {
        std::env::set_var("ABUSEIPDB_API_KEY", "example-key");
        let config = Config::from_yaml(&Config::example()).unwrap();
        assert_eq!(config.abuseipdb.api_key, "example-key");
        assert_eq!(config.allowlist.len(), 4);
        assert_eq!(config.ip_extraction.trusted_proxies.len(), 1);
    }

    #[test]
    fn test_missing_abuseipdb_section() {
        let err = Config::from_yaml("settings:\n  enabled: true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Config::with_api_key("").validate().is_err());

        let mut config = Config::with_api_key("k");
        config.abuseipdb.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::with_api_key("k");
        config.cache.ttl_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::with_api_key("k");
        config.allowlist = strings(&["not-an-ip"]);
        assert!(config.validate().is_err());

        let mut config = Config::with_api_key("k");
        config.ip_extraction.trusted_proxies = strings(&["proxy.internal"]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
