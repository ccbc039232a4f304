//! Test case inventory: discovery, filtering and ordering.
//!
//! # Discovery Sources
//!
//! | Discoverer | Source |
//! |------------|--------|
//! | [`CollaboratorDiscoverer`] | The `discovery` collaborator, given source paths |
//! | [`ListDiscoverer`] | A text file, one `Suite/method [tag, tag]` per line |
//!
//! # Filtering
//!
//! A test matches a token when any of its tags, external IDs, suite, method
//! or `suite/method` equals the token, ignoring case. With no include tokens
//! every test is included. Tests matching an exclude token are always
//! dropped, even when they also match an include token.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collaborator::{self, CollaboratorError, Collaborators, DiscoveryRequest};
use crate::config::TestsConfig;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur during test discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// No discovery source is configured.
    #[error("No test source configured: set collaborators.discovery or tests.list")]
    NoSource,

    /// A line of a test list could not be parsed.
    #[error("{path}:{line}: {message}")]
    ParseError {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// The discovery collaborator failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// I/O error reading files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single UI test method within a suite.
///
/// Identity is `(suite, name)`: equality and hashing ignore tags and IDs.
///
/// ```
/// use simfleet::inventory::TestCase;
///
/// let test = TestCase::new("LoginTests", "testLogin").with_tag("smoke");
/// assert_eq!(test.identifier(), "LoginTests/testLogin");
/// assert_eq!(test, TestCase::new("LoginTests", "testLogin"));
/// ```
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub suite: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// External identifiers, e.g. test management case IDs.
    #[serde(default, alias = "ids")]
    pub test_case_ids: BTreeSet<String>,
}

impl TestCase {
    pub fn new(suite: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            name: name.into(),
            tags: BTreeSet::new(),
            test_case_ids: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.test_case_ids.insert(id.into());
        self
    }

    /// `suite/name`.
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.suite, self.name)
    }

    /// Returns `true` if any attribute equals the token, ignoring case.
    pub fn matches(&self, token: &str) -> bool {
        let token = token.trim().to_lowercase();
        let eq = |value: &str| value.to_lowercase() == token;
        self.tags.iter().any(|t| eq(t))
            || self.test_case_ids.iter().any(|i| eq(i))
            || eq(&self.suite)
            || eq(&self.name)
            || eq(&self.identifier())
    }
}

impl PartialEq for TestCase {
    fn eq(&self, other: &Self) -> bool {
        self.suite == other.suite && self.name == other.name
    }
}

impl Hash for TestCase {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.suite.hash(state);
        self.name.hash(state);
    }
}

impl std::fmt::Display for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.suite, self.name)
    }
}

/// A source of test cases.
#[async_trait]
pub trait TestDiscoverer: Send + Sync {
    async fn discover(&self) -> DiscoveryResult<Vec<TestCase>>;
}

/// Asks the `discovery` collaborator for the tests in the source paths.
pub struct CollaboratorDiscoverer {
    collaborators: Collaborators,
    request: DiscoveryRequest,
}

impl CollaboratorDiscoverer {
    pub fn new(collaborators: Collaborators, tests: &TestsConfig) -> Self {
        Self {
            collaborators,
            request: DiscoveryRequest {
                paths: tests.paths.clone(),
                base_class: tests.base_class.clone(),
                include: tests.include.clone(),
                exclude: tests.exclude.clone(),
            },
        }
    }
}

#[async_trait]
impl TestDiscoverer for CollaboratorDiscoverer {
    async fn discover(&self) -> DiscoveryResult<Vec<TestCase>> {
        self.collaborators
            .invoke::<collaborator::Discovery>(&self.request)
            .await?
            .ok_or(DiscoveryError::NoSource)
    }
}

/// Reads tests from a plain text list.
///
/// ```text
/// # smoke suite
/// LoginTests/testLogin [smoke, auth]
/// LoginTests/testLogout
/// ```
pub struct ListDiscoverer {
    path: PathBuf,
}

impl ListDiscoverer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TestDiscoverer for ListDiscoverer {
    async fn discover(&self) -> DiscoveryResult<Vec<TestCase>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        parse_test_list(&self.path, &content)
    }
}

/// Parses the test list format read by [`ListDiscoverer`].
pub fn parse_test_list(path: &Path, content: &str) -> DiscoveryResult<Vec<TestCase>> {
    let mut tests = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let error = |message: &str| DiscoveryError::ParseError {
            path: path.to_path_buf(),
            line: index + 1,
            message: message.to_string(),
        };

        let (id, tags) = match line.split_once('[') {
            Some((id, rest)) => {
                let tags = rest
                    .strip_suffix(']')
                    .ok_or_else(|| error("unterminated tag list"))?;
                (id.trim(), tags)
            }
            None => (line, ""),
        };

        let (suite, name) = id
            .split_once('/')
            .filter(|(s, n)| !s.is_empty() && !n.is_empty() && !n.contains('/'))
            .ok_or_else(|| error("expected Suite/method"))?;

        let mut test = TestCase::new(suite.trim(), name.trim());
        for tag in tags.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            test = test.with_tag(tag);
        }
        tests.push(test);
    }
    Ok(tests)
}

/// Picks the discoverer for the configuration.
///
/// The discovery collaborator wins over a test list.
pub fn discoverer_for(
    tests: &TestsConfig,
    collaborators: &Collaborators,
) -> DiscoveryResult<Box<dyn TestDiscoverer>> {
    if collaborators.has(collaborator::CollaboratorKind::Discovery) {
        Ok(Box::new(CollaboratorDiscoverer::new(
            collaborators.clone(),
            tests,
        )))
    } else if let Some(list) = &tests.list {
        Ok(Box::new(ListDiscoverer::new(list)))
    } else {
        Err(DiscoveryError::NoSource)
    }
}

/// Discovers tests, collapses duplicate identities and applies the filters.
pub async fn discover(
    discoverer: &dyn TestDiscoverer,
    include: &[String],
    exclude: &[String],
) -> DiscoveryResult<Vec<TestCase>> {
    let found = discoverer.discover().await?;
    let total = found.len();
    let unique = dedup(found);
    if unique.len() < total {
        warn!(
            "Discovery returned {} duplicate tests; keeping first occurrences",
            total - unique.len()
        );
    }

    let filtered = apply_include_exclude(unique, include, exclude);
    info!("Discovered {} tests ({} after filtering)", total, filtered.len());
    Ok(filtered)
}

/// Drops repeated identities, keeping the first occurrence.
pub fn dedup(tests: Vec<TestCase>) -> Vec<TestCase> {
    let mut seen = HashSet::new();
    tests
        .into_iter()
        .filter(|t| seen.insert((t.suite.clone(), t.name.clone())))
        .collect()
}

/// Applies include then exclude tokens. Exclude always wins.
pub fn apply_include_exclude(
    tests: Vec<TestCase>,
    include: &[String],
    exclude: &[String],
) -> Vec<TestCase> {
    tests
        .into_iter()
        .filter(|t| include.is_empty() || include.iter().any(|tok| t.matches(tok)))
        .filter(|t| !exclude.iter().any(|tok| t.matches(tok)))
        .collect()
}

/// Reorders `original` following `sorted`.
///
/// Tests unknown to the inventory are ignored and tests the order omits are
/// appended in their original order, so the set of tests never changes.
pub fn apply_order(original: Vec<TestCase>, sorted: Vec<TestCase>) -> Vec<TestCase> {
    let mut by_id: HashMap<(String, String), TestCase> = HashMap::new();
    let mut order = Vec::with_capacity(original.len());
    for test in original {
        order.push((test.suite.clone(), test.name.clone()));
        by_id.insert((test.suite.clone(), test.name.clone()), test);
    }

    let mut result = Vec::with_capacity(order.len());
    for test in sorted {
        match by_id.remove(&(test.suite.clone(), test.name.clone())) {
            Some(known) => result.push(known),
            None => debug!("Ignoring test {} from sort order", test),
        }
    }

    let omitted = order.iter().filter_map(|key| by_id.remove(key));
    result.extend(omitted);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn test_identity_ignores_tags() {
        let a = TestCase::new("A", "t1").with_tag("smoke");
        let b = TestCase::new("A", "t1").with_id("C123");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_exclude_wins() {
        let tests = vec![
            TestCase::new("A", "both").with_tag("tagA").with_tag("tagB"),
            TestCase::new("A", "onlyA").with_tag("tagA"),
            TestCase::new("B", "none"),
        ];
        let kept = apply_include_exclude(tests, &[s("taga")], &[s("TAGB")]);
        assert_eq!(kept, vec![TestCase::new("A", "onlyA")]);
    }

    #[test]
    fn test_tokens_match_every_attribute() {
        let tests = vec![
            TestCase::new("Login", "testA").with_id("TC-1"),
            TestCase::new("Login", "testB"),
            TestCase::new("Cart", "testC"),
            TestCase::new("Cart", "testD"),
        ];

        let kept = apply_include_exclude(tests.clone(), &[s("tc-1"), s("cart/testd")], &[]);
        assert_eq!(
            kept,
            vec![TestCase::new("Login", "testA"), TestCase::new("Cart", "testD")]
        );

        let kept = apply_include_exclude(tests.clone(), &[], &[s("login")]);
        assert_eq!(kept.len(), 2);

        let kept = apply_include_exclude(tests, &[], &[]);
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn test_tokens_ignore_unicode_case() {
        let tests = vec![
            TestCase::new("ÜberweisungTests", "testÖffnen").with_tag("Zahlung"),
            TestCase::new("KartenTests", "testAnzeigen"),
        ];

        let kept = apply_include_exclude(tests.clone(), &[s("überweisungtests")], &[]);
        assert_eq!(kept, vec![TestCase::new("ÜberweisungTests", "testÖffnen")]);

        let kept = apply_include_exclude(tests, &[], &[s("ÜBERWEISUNGTESTS/TESTÖFFNEN")]);
        assert_eq!(kept, vec![TestCase::new("KartenTests", "testAnzeigen")]);
    }

    #[test]
    fn test_parse_test_list() {
        let content = "\
# login flows
LoginTests/testLogin [smoke, auth]
LoginTests/testLogout   # trailing comment

CartTests/testCheckout []
";
        let tests = parse_test_list(Path::new("tests.txt"), content).unwrap();
        assert_eq!(tests.len(), 3);
        assert_eq!(tests[0].tags.len(), 2);
        assert!(tests[0].tags.contains("auth"));
        assert_eq!(tests[1].identifier(), "LoginTests/testLogout");
        assert!(tests[2].tags.is_empty());
    }

    #[test]
    fn test_parse_test_list_errors() {
        let err = parse_test_list(Path::new("tests.txt"), "ok/test\nnoslash\n").unwrap_err();
        assert!(matches!(err, DiscoveryError::ParseError { line: 2, .. }));
    }

    #[test]
    fn test_apply_order_never_changes_the_set() {
        let original = vec![
            TestCase::new("A", "1").with_tag("x"),
            TestCase::new("A", "2"),
            TestCase::new("A", "3"),
        ];
        let sorted = vec![
            TestCase::new("A", "3"),
            TestCase::new("Z", "unknown"),
            TestCase::new("A", "1"),
            TestCase::new("A", "3"),
        ];
        let result = apply_order(original, sorted);
        let ids: Vec<_> = result.iter().map(TestCase::identifier).collect();
        assert_eq!(ids, vec!["A/3", "A/1", "A/2"]);
        assert!(result[1].tags.contains("x"));
    }

    #[tokio::test]
    async fn test_discover_dedups_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("tests.txt");
        std::fs::write(&list, "A/t1 [smoke]\nA/t1\nA/t2 [slow]\n").unwrap();

        let discoverer = ListDiscoverer::new(&list);
        let tests = discover(&discoverer, &[], &[s("slow")]).await.unwrap();
        assert_eq!(tests.len(), 1);
        assert!(tests[0].tags.contains("smoke"));
    }

    #[test]
    fn test_discoverer_requires_a_source() {
        let collaborators = Collaborators::new(Default::default());
        let result = discoverer_for(&TestsConfig::default(), &collaborators);
        assert!(matches!(result, Err(DiscoveryError::NoSource)));
    }
}
