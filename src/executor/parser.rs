//! Line parser for `xcodebuild` test output.
//!
//! [`XcodebuildParser`] is a table of regex rules tried in order; the first
//! matching rule turns the line into an [`OutputEvent`]. Lines no rule
//! matches are ignored.

use regex::{Captures, Regex};

/// Something the tool reported about the running test.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Started {
        suite: String,
        name: String,
    },
    Passed {
        suite: String,
        name: String,
        duration: Option<f64>,
    },
    Failed {
        suite: String,
        name: String,
        duration: Option<f64>,
    },
    /// The test process crashed or was restarted.
    Crashed(String),
    /// The node ran out of disk space.
    StorageExhausted(String),
    /// The execution time allowance was exceeded.
    AllowanceExceeded(String),
    /// An assertion or error message for the current test.
    FailureMessage(String),
}

/// Turns single output lines into events.
pub trait OutputParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<OutputEvent>;
}

struct Rule {
    pattern: Regex,
    build: fn(&Captures<'_>, &str) -> OutputEvent,
}

/// Parser for `xcodebuild test-without-building` output.
pub struct XcodebuildParser {
    rules: Vec<Rule>,
}

fn seconds(caps: &Captures<'_>) -> Option<f64> {
    caps.name("secs").and_then(|m| m.as_str().parse().ok())
}

fn names(caps: &Captures<'_>) -> (String, String) {
    (caps["suite"].to_string(), caps["name"].to_string())
}

fn case_event(caps: &Captures<'_>, _line: &str) -> OutputEvent {
    let (suite, name) = names(caps);
    match &caps["verb"] {
        "started" => OutputEvent::Started { suite, name },
        "passed" => OutputEvent::Passed {
            suite,
            name,
            duration: seconds(caps),
        },
        _ => OutputEvent::Failed {
            suite,
            name,
            duration: seconds(caps),
        },
    }
}

impl XcodebuildParser {
    pub fn new() -> Self {
        // Objective-C style: Test Case '-[Module.Suite testName]' passed (1.234 seconds).
        // Swift style:       Test case 'Suite.testName()' passed on 'Clone 1 of ...' (1.234 seconds)
        let table: [(&str, fn(&Captures<'_>, &str) -> OutputEvent); 9] = [
            (
                r"Test [Cc]ase '-\[(?:\w+\.)?(?P<suite>\w+) (?P<name>\w+)\]' (?P<verb>started|passed|failed)(?: \((?P<secs>\d+(?:\.\d+)?) seconds\))?",
                case_event,
            ),
            (
                r"Test [Cc]ase '(?:\w+\.)?(?P<suite>\w+)\.(?P<name>\w+)\(\)' (?P<verb>started|passed|failed)(?: on '[^']*')?(?: \((?P<secs>\d+(?:\.\d+)?) seconds\))?",
                case_event,
            ),
            (r"No space left on device|NSPOSIXErrorDomain Code=28", |_, line| {
                OutputEvent::StorageExhausted(line.trim().to_string())
            }),
            (r"exceeded (?:the )?(?:maximum )?execution time allowance", |_, line| {
                OutputEvent::AllowanceExceeded(line.trim().to_string())
            }),
            (
                r"Restarting after unexpected exit, crash, or test timeout",
                |_, line| OutputEvent::Crashed(line.trim().to_string()),
            ),
            (r"crashed with signal|Early unexpected exit", |_, line| {
                OutputEvent::Crashed(line.trim().to_string())
            }),
            (r"Test runner exited|Checking for crash reports", |_, line| {
                OutputEvent::Crashed(line.trim().to_string())
            }),
            (r"error: -\[[^\]]+\] : (?P<msg>.+)$", |caps, _| {
                OutputEvent::FailureMessage(caps["msg"].trim().to_string())
            }),
            (r"\.swift:\d+: error: (?P<msg>.+)$", |caps, _| {
                OutputEvent::FailureMessage(caps["msg"].trim().to_string())
            }),
        ];

        let rules = table
            .into_iter()
            .filter_map(|(pattern, build)| match Regex::new(pattern) {
                Ok(pattern) => Some(Rule { pattern, build }),
                Err(e) => {
                    tracing::error!("Invalid output rule {}: {}", pattern, e);
                    None
                }
            })
            .collect();

        Self { rules }
    }
}

impl Default for XcodebuildParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser for XcodebuildParser {
    fn parse(&self, line: &str) -> Option<OutputEvent> {
        self.rules.iter().find_map(|rule| {
            rule.pattern
                .captures(line)
                .map(|caps| (rule.build)(&caps, line))
        })
    }
}
