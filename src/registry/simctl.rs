//! `xcrun simctl` invocations and the JSON it prints.

use std::collections::HashMap;

use serde::Deserialize;

use crate::channel::{Command, FailurePolicy};

/// Runtime entry of `simctl list runtimes --json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimRuntime {
    pub identifier: String,
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "available")]
    pub is_available: bool,
}

fn available() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RuntimeList {
    runtimes: Vec<SimRuntime>,
}

/// Device entry of `simctl list devices --json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimDevice {
    pub name: String,
    pub udid: String,
    #[serde(default)]
    pub state: String,
    #[serde(default = "available")]
    pub is_available: bool,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: HashMap<String, Vec<SimDevice>>,
}

pub fn parse_runtimes(json: &str) -> Result<Vec<SimRuntime>, serde_json::Error> {
    Ok(serde_json::from_str::<RuntimeList>(json)?.runtimes)
}

/// Devices keyed by runtime identifier.
pub fn parse_devices(json: &str) -> Result<HashMap<String, Vec<SimDevice>>, serde_json::Error> {
    Ok(serde_json::from_str::<DeviceList>(json)?.devices)
}

/// How well a runtime matched the requested version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMatch {
    Exact,
    /// Same `major.minor`, different patch.
    Approximate,
}

/// `major.minor` of a version string.
fn major_minor(version: &str) -> (&str, &str) {
    let mut parts = version.trim().split('.');
    (parts.next().unwrap_or(""), parts.next().unwrap_or("0"))
}

/// Compares an installed runtime version with the requested one.
pub fn match_version(installed: &str, requested: &str) -> Option<RuntimeMatch> {
    let strip = |v: &str| v.trim().trim_end_matches(".0").to_string();
    if installed.trim() == requested.trim() || strip(installed) == strip(requested) {
        Some(RuntimeMatch::Exact)
    } else if major_minor(installed) == major_minor(requested) {
        Some(RuntimeMatch::Approximate)
    } else {
        None
    }
}

/// Picks the runtime for `platform` and `version`, preferring an exact match.
pub fn select_runtime<'a>(
    runtimes: &'a [SimRuntime],
    platform: &str,
    version: &str,
) -> Option<(&'a SimRuntime, RuntimeMatch)> {
    let marker = format!("SimRuntime.{}-", platform);
    let candidates = runtimes
        .iter()
        .filter(|r| r.is_available && r.identifier.contains(&marker));

    let mut best: Option<(&SimRuntime, RuntimeMatch)> = None;
    for runtime in candidates {
        match match_version(&runtime.version, version) {
            Some(RuntimeMatch::Exact) => return Some((runtime, RuntimeMatch::Exact)),
            Some(RuntimeMatch::Approximate) if best.is_none() => {
                best = Some((runtime, RuntimeMatch::Approximate))
            }
            _ => {}
        }
    }
    best
}

/// Version encoded in a runtime identifier, e.g. `...iOS-17-2` → `17.2`.
pub fn identifier_version(identifier: &str) -> Option<String> {
    let tail = identifier.rsplit('.').next()?;
    let (_, version) = tail.split_once('-')?;
    Some(version.replace('-', "."))
}

fn simctl() -> Command {
    Command::new("xcrun").arg("simctl")
}

pub fn list_runtimes() -> Command {
    simctl().args(["list", "runtimes", "--json"])
}

pub fn list_devices() -> Command {
    simctl().args(["list", "devices", "--json"])
}

pub fn create(name: &str, device_type: &str, runtime_identifier: &str) -> Command {
    simctl().args(["create", name, device_type, runtime_identifier])
}

pub fn boot(udid: &str) -> Command {
    simctl()
        .args(["boot", udid])
        .policy(FailurePolicy::tolerate_literals(&["current state: Booted"]))
}

/// Blocks until the device finished booting.
pub fn bootstatus(udid: &str) -> Command {
    simctl().args(["bootstatus", udid, "-b"])
}

pub fn shutdown(udid: &str) -> Command {
    simctl()
        .args(["shutdown", udid])
        .policy(FailurePolicy::tolerate_literals(&["current state: Shutdown"]))
}

pub fn erase(udid: &str) -> Command {
    simctl().args(["erase", udid])
}

pub fn terminate(udid: &str, bundle_id: &str) -> Command {
    // Not running is fine: the app may have already crashed
    simctl()
        .args(["terminate", udid, bundle_id])
        .policy(FailurePolicy::Ignore)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNTIMES: &str = r#"{
      "runtimes" : [
        {
          "identifier" : "com.apple.CoreSimulator.SimRuntime.iOS-17-2",
          "version" : "17.2",
          "name" : "iOS 17.2",
          "isAvailable" : true
        },
        {
          "identifier" : "com.apple.CoreSimulator.SimRuntime.tvOS-17-2",
          "version" : "17.2",
          "name" : "tvOS 17.2",
          "isAvailable" : true
        },
        {
          "identifier" : "com.apple.CoreSimulator.SimRuntime.iOS-16-4",
          "version" : "16.4.1",
          "name" : "iOS 16.4",
          "isAvailable" : true
        }
      ]
    }"#;

    #[test]
    fn test_match_version() {
        assert_eq!(match_version("17.2", "17.2"), Some(RuntimeMatch::Exact));
        assert_eq!(match_version("17.2", "17.2.0"), Some(RuntimeMatch::Exact));
        assert_eq!(
            match_version("16.4.1", "16.4"),
            Some(RuntimeMatch::Approximate)
        );
        assert_eq!(match_version("17.0", "17.2"), None);
    }

    #[test]
    fn test_select_runtime() {
        let runtimes = parse_runtimes(RUNTIMES).unwrap();

        let (runtime, quality) = select_runtime(&runtimes, "iOS", "17.2").unwrap();
        assert_eq!(runtime.identifier, "com.apple.CoreSimulator.SimRuntime.iOS-17-2");
        assert_eq!(quality, RuntimeMatch::Exact);

        let (runtime, quality) = select_runtime(&runtimes, "iOS", "16.4").unwrap();
        assert_eq!(runtime.version, "16.4.1");
        assert_eq!(quality, RuntimeMatch::Approximate);

        assert!(select_runtime(&runtimes, "iOS", "15.0").is_none());
    }

    #[test]
    fn test_parse_devices() {
        let devices = parse_devices(
            r#"{"devices": {"com.apple.CoreSimulator.SimRuntime.iOS-17-2": [
                {"name": "iPhone 15 (simfleet 1)", "udid": "AAA", "state": "Shutdown", "isAvailable": true}
            ]}}"#,
        )
        .unwrap();
        let list = &devices["com.apple.CoreSimulator.SimRuntime.iOS-17-2"];
        assert_eq!(list[0].udid, "AAA");
        assert_eq!(
            identifier_version("com.apple.CoreSimulator.SimRuntime.iOS-17-2").as_deref(),
            Some("17.2")
        );
    }
}
