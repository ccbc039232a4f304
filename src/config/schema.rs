//! Configuration schema definitions for simfleet.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and
//! tagged enums for authentication selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SimfleetConfig         - Core settings (retries, stability, timeouts)
//! ├── DriverConfig           - xcodebuild test driver (xctestrun, target)
//! ├── DeviceProfile          - Simulator device and OS runtime
//! ├── NodeConfig[]           - Local and SSH-reachable macOS nodes
//! │   └── AuthConfig         - none | password | key | agent
//! ├── TestsConfig            - Discovery sources and include/exclude tokens
//! ├── CollaboratorsConfig    - External hook commands
//! ├── BuildConfig            - Optional build-for-testing command
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Errors raised by cross-field configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No nodes were configured.
    #[error("At least one node must be configured")]
    NoNodes,

    /// Two nodes share the same name.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// A node declares a fixed concurrency of zero.
    #[error("Node {0} has a concurrency of 0")]
    ZeroConcurrency(String),

    /// Retry and stability modes were both requested.
    #[error("retry_count and stability_repeats are mutually exclusive")]
    ConflictingModes,

    /// Stability mode needs at least one repeat.
    #[error("stability_repeats must be at least 1")]
    ZeroRepeats,

    /// The idle-output watchdog would fire immediately.
    #[error("idle_timeout_secs must be at least 1")]
    ZeroIdleTimeout,

    /// A remote node has no SSH user.
    #[error("Node {0} is remote but has no user")]
    MissingUser(String),

    /// Any other invalid value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration structure for simfleet.
///
/// # TOML Structure
///
/// ```toml
/// [simfleet]
/// retry_count = 2
/// idle_timeout_secs = 300
///
/// [driver]
/// xctestrun = "build/Build/Products/App_iphonesimulator17.2-arm64.xctestrun"
/// target = "AppUITests"
/// bundle_id = "com.example.App"
/// products_dir = "build/Build/Products"
///
/// [device]
/// name = "iPhone 15"
/// runtime = "17.2"
///
/// [[nodes]]
/// name = "local"
/// address = "local"
/// concurrency = 2
///
/// [[nodes]]
/// name = "mini-1"
/// address = "10.0.0.12"
/// user = "ci"
/// concurrency = "auto"
/// auth = { type = "key", path = "~/.ssh/id_ed25519" }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core simfleet settings.
    #[serde(default)]
    pub simfleet: SimfleetConfig,

    /// How each single test is driven on a runner.
    pub driver: DriverConfig,

    /// Simulator device profile every runner is provisioned with.
    pub device: DeviceProfile,

    /// The node pool.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Discovery sources and filters.
    #[serde(default)]
    pub tests: TestsConfig,

    /// External collaborator commands.
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,

    /// Optional build step run locally before provisioning.
    #[serde(default)]
    pub build: Option<BuildConfig>,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Checks rules that span several fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode(node.name.clone()));
            }
            if node.concurrency == Concurrency::Fixed(0) {
                return Err(ConfigError::ZeroConcurrency(node.name.clone()));
            }
            if !node.is_local() && node.user.is_none() {
                return Err(ConfigError::MissingUser(node.name.clone()));
            }
        }

        self.simfleet.run_mode()?;
        if self.simfleet.idle_timeout_secs == 0 {
            return Err(ConfigError::ZeroIdleTimeout);
        }

        if self.driver.target.trim().is_empty() {
            return Err(ConfigError::Invalid("driver.target is empty".to_string()));
        }

        Ok(())
    }
}

/// The two mutually exclusive execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RunMode {
    /// Failed tests are retried up to `retries` times.
    Retry { retries: usize },
    /// Every test runs `repeats` times regardless of outcome.
    Stability { repeats: usize },
}

/// Core simfleet execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `retry_count` | 2 (when `stability_repeats` is unset) |
/// | `stability_repeats` | unset |
/// | `infra_retries` | 2 |
/// | `idle_timeout_secs` | 300 |
/// | `execution_time_allowance_secs` | unset |
/// | `stream_output` | false |
/// | `erase_on_teardown` | false |
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimfleetConfig {
    /// Number of times to retry failed tests.
    ///
    /// Mutually exclusive with `stability_repeats`.
    pub retry_count: Option<usize>,

    /// Run every test this many times to surface flakiness.
    pub stability_repeats: Option<usize>,

    /// Retries for infrastructure failures (transport errors, runner faults).
    ///
    /// These do not count against `retry_count` or `stability_repeats`.
    #[serde(default = "default_infra_retries")]
    pub infra_retries: usize,

    /// Seconds without any test output before the app under test is killed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum execution time allowance handed to xcodebuild, per test.
    pub execution_time_allowance_secs: Option<u64>,

    /// Print test output in real time, prefixed with the runner name.
    #[serde(default)]
    pub stream_output: bool,

    /// Erase runners at session end instead of only shutting them down.
    #[serde(default)]
    pub erase_on_teardown: bool,
}

const DEFAULT_RETRY_COUNT: usize = 2;

fn default_infra_retries() -> usize {
    2
}

fn default_idle_timeout() -> u64 {
    300
}

impl SimfleetConfig {
    /// Resolves the execution mode, rejecting conflicting settings.
    pub fn run_mode(&self) -> Result<RunMode, ConfigError> {
        match (self.retry_count, self.stability_repeats) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingModes),
            (_, Some(0)) => Err(ConfigError::ZeroRepeats),
            (_, Some(repeats)) => Ok(RunMode::Stability { repeats }),
            (retries, None) => Ok(RunMode::Retry {
                retries: retries.unwrap_or(DEFAULT_RETRY_COUNT),
            }),
        }
    }

    /// Idle-output watchdog threshold.
    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Settings for the `xcodebuild test-without-building` invocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    /// Local path to the `.xctestrun` file produced by build-for-testing.
    pub xctestrun: PathBuf,

    /// UI test target name used in `-only-testing:<target>/<suite>/<test>`.
    pub target: String,

    /// Bundle identifier of the app under test, terminated by the watchdog.
    pub bundle_id: Option<String>,

    /// Local directory holding the xctestrun and built products.
    ///
    /// Uploaded once per remote node to `remote_dir`.
    pub products_dir: Option<PathBuf>,

    /// Directory on remote nodes receiving the products.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Extra arguments appended to every xcodebuild invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Environment variables set for every xcodebuild invocation.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_remote_dir() -> String {
    "/tmp/simfleet".to_string()
}

impl DriverConfig {
    /// Path of the xctestrun file as seen from a node.
    pub fn xctestrun_on(&self, remote: bool) -> String {
        if !remote {
            return self.xctestrun.to_string_lossy().to_string();
        }
        let relative = self
            .products_dir
            .as_ref()
            .and_then(|dir| self.xctestrun.strip_prefix(dir).ok())
            .map(PathBuf::from)
            .or_else(|| self.xctestrun.file_name().map(PathBuf::from))
            .unwrap_or_else(|| self.xctestrun.clone());
        format!(
            "{}/{}",
            self.remote_dir.trim_end_matches('/'),
            relative.to_string_lossy()
        )
    }
}

/// Simulator device profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceProfile {
    /// Device type name, e.g. `iPhone 15`.
    pub name: String,

    /// OS runtime version, e.g. `17.2`.
    pub runtime: String,

    /// Runtime platform, as in `com.apple.CoreSimulator.SimRuntime.<platform>-17-2`.
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Test language passed as `-testLanguage`.
    pub language: Option<String>,

    /// Test region passed as `-testRegion`.
    pub locale: Option<String>,
}

fn default_platform() -> String {
    "iOS".to_string()
}

/// A node in the pool.
///
/// # Example
///
/// ```toml
/// [[nodes]]
/// name = "mini-2"
/// address = "mini-2.lan"
/// user = "ci"
/// port = 22
/// concurrency = 3
/// scratch_disk_gb = 16
/// auth = { type = "password", password_env = "MINI2_PASSWORD" }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Unique node name used in logs and reports.
    pub name: String,

    /// `local` (or a loopback address) or an SSH host.
    pub address: String,

    /// SSH user for remote nodes.
    pub user: Option<String>,

    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Authentication descriptor.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Concurrency policy: a count, or `"auto"` to probe the node.
    #[serde(default)]
    pub concurrency: Concurrency,

    /// Scratch disk size hint, bounding autodetected capacity.
    pub scratch_disk_gb: Option<u64>,

    /// Environment variables for every command on this node.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shell used for local commands.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Skip SSH host key verification.
    #[serde(default)]
    pub disable_host_key_check: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Addresses that designate the local machine.
const LOCAL_ADDRESSES: &[&str] = &["local", "localhost", "127.0.0.1", "::1"];

impl NodeConfig {
    /// Returns `true` if the node designates the local machine.
    pub fn is_local(&self) -> bool {
        LOCAL_ADDRESSES
            .iter()
            .any(|a| a.eq_ignore_ascii_case(self.address.trim()))
    }
}

/// SSH authentication descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Whatever `ssh` picks up on its own (default keys, config file).
    #[default]
    None,
    /// Password read from the named environment variable, sent via `sshpass`.
    Password { password_env: String },
    /// Private key file.
    Key { path: PathBuf },
    /// Keys held by the running ssh-agent.
    Agent,
}

/// Node concurrency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConcurrencyRepr", into = "ConcurrencyRepr")]
pub enum Concurrency {
    /// A fixed number of runners.
    Fixed(usize),
    /// Derived from the node's CPU and memory at connect time.
    Auto,
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Fixed(1)
    }
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum ConcurrencyRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<ConcurrencyRepr> for Concurrency {
    type Error = String;

    fn try_from(value: ConcurrencyRepr) -> Result<Self, Self::Error> {
        match value {
            ConcurrencyRepr::Count(n) => Ok(Concurrency::Fixed(n)),
            ConcurrencyRepr::Keyword(k) if k.eq_ignore_ascii_case("auto") => Ok(Concurrency::Auto),
            ConcurrencyRepr::Keyword(k) => Err(format!(
                "invalid concurrency '{}': expected a number or \"auto\"",
                k
            )),
        }
    }
}

impl From<Concurrency> for ConcurrencyRepr {
    fn from(value: Concurrency) -> Self {
        match value {
            Concurrency::Fixed(n) => ConcurrencyRepr::Count(n),
            Concurrency::Auto => ConcurrencyRepr::Keyword("auto".to_string()),
        }
    }
}

/// Discovery sources and include/exclude tokens.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestsConfig {
    /// Source paths handed to the discovery collaborator.
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Base class of UI test suites, handed to the discovery collaborator.
    #[serde(default = "default_base_class")]
    pub base_class: String,

    /// Include tokens (tags, IDs, suite, method or `suite/method`).
    #[serde(default)]
    pub include: Vec<String>,

    /// Exclude tokens, same attributes as `include`. Exclude wins.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Plain test list used when no discovery collaborator is configured.
    pub list: Option<PathBuf>,
}

fn default_base_class() -> String {
    "XCTestCase".to_string()
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            base_class: default_base_class(),
            include: Vec::new(),
            exclude: Vec::new(),
            list: None,
        }
    }
}

/// External collaborator commands.
///
/// Each command receives a JSON document on stdin and, when an answer is
/// expected, prints JSON on stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollaboratorsConfig {
    pub discovery: Option<String>,
    pub sort: Option<String>,
    pub distribution: Option<String>,
    pub event: Option<String>,
    pub pre_build: Option<String>,
    pub post_build: Option<String>,
    pub teardown: Option<String>,

    /// Working directory for collaborator commands.
    pub working_dir: Option<PathBuf>,

    /// Timeout for a single collaborator invocation.
    #[serde(default = "default_collaborator_timeout")]
    pub timeout_secs: u64,
}

fn default_collaborator_timeout() -> u64 {
    600
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            discovery: None,
            sort: None,
            distribution: None,
            event: None,
            pre_build: None,
            post_build: None,
            teardown: None,
            working_dir: None,
            timeout_secs: default_collaborator_timeout(),
        }
    }
}

/// Build step run on the local machine before provisioning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfig {
    /// The build command, e.g. an `xcodebuild build-for-testing` invocation.
    pub command: String,

    /// Working directory for the build.
    pub working_dir: Option<PathBuf>,
}

/// Report configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory receiving every artifact of the session.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// JUnit file name inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// JSON session report file name inside `output_dir`.
    #[serde(default = "default_json_file")]
    pub json_file: String,

    /// Copy result bundles from remote nodes into `output_dir`.
    #[serde(default)]
    pub download_result_bundles: bool,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("simfleet-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_json_file() -> String {
    "report.json".to_string()
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
            json_file: default_json_file(),
            download_result_bundles: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [driver]
        xctestrun = "build/Products/App.xctestrun"
        target = "AppUITests"
        products_dir = "build/Products"

        [device]
        name = "iPhone 15"
        runtime = "17.2"
    "#;

    fn parse(extra: &str) -> Config {
        toml::from_str(&format!("{}\n{}", BASE, extra)).unwrap()
    }

    #[test]
    fn test_concurrency_number_and_auto() {
        let config = parse(
            r#"
            [[nodes]]
            name = "local"
            address = "local"
            concurrency = 3

            [[nodes]]
            name = "mini"
            address = "mini.lan"
            user = "ci"
            concurrency = "auto"
            "#,
        );
        assert_eq!(config.nodes[0].concurrency, Concurrency::Fixed(3));
        assert_eq!(config.nodes[1].concurrency, Concurrency::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_concurrency_keyword() {
        let result: Result<Config, _> = toml::from_str(&format!(
            "{}\n[[nodes]]\nname = \"a\"\naddress = \"local\"\nconcurrency = \"lots\"",
            BASE
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_auth_variants() {
        let config = parse(
            r#"
            [[nodes]]
            name = "a"
            address = "a.lan"
            user = "ci"
            auth = { type = "password", password_env = "A_PASS" }

            [[nodes]]
            name = "b"
            address = "b.lan"
            user = "ci"
            auth = { type = "agent" }
            "#,
        );
        assert_eq!(
            config.nodes[0].auth,
            AuthConfig::Password {
                password_env: "A_PASS".to_string()
            }
        );
        assert_eq!(config.nodes[1].auth, AuthConfig::Agent);
    }

    #[test]
    fn test_modes_are_exclusive() {
        let config = parse(
            r#"
            [simfleet]
            retry_count = 1
            stability_repeats = 3

            [[nodes]]
            name = "local"
            address = "local"
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConflictingModes)
        ));
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        let config = parse(
            r#"
            [simfleet]
            idle_timeout_secs = 0

            [[nodes]]
            name = "local"
            address = "local"
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroIdleTimeout)
        ));
    }

    #[test]
    fn test_default_mode_is_retry() {
        let config = parse("[[nodes]]\nname = \"local\"\naddress = \"local\"");
        assert_eq!(
            config.simfleet.run_mode().unwrap(),
            RunMode::Retry { retries: 2 }
        );
    }

    #[test]
    fn test_validate_rejects_duplicates_and_missing_user() {
        let config = parse(
            r#"
            [[nodes]]
            name = "a"
            address = "local"

            [[nodes]]
            name = "a"
            address = "localhost"
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateNode(_))
        ));

        let config = parse("[[nodes]]\nname = \"r\"\naddress = \"r.lan\"");
        assert!(matches!(config.validate(), Err(ConfigError::MissingUser(_))));
    }

    #[test]
    fn test_xctestrun_on_remote() {
        let config = parse("[[nodes]]\nname = \"local\"\naddress = \"local\"");
        assert_eq!(
            config.driver.xctestrun_on(false),
            "build/Products/App.xctestrun"
        );
        assert_eq!(
            config.driver.xctestrun_on(true),
            "/tmp/simfleet/App.xctestrun"
        );
    }
}
