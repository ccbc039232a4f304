//! Assignment of test cases to runner slots.
//!
//! The distributor produces one ordered queue per runner slot, either as a
//! contiguous partition of the inventory or from the `distribution`
//! collaborator, and hands them to [`WorkQueues`] for execution.
//!
//! # Default Partition
//!
//! `n` tests over `k` runners give `k` contiguous chunks whose sizes differ
//! by at most one, larger chunks first:
//!
//! ```
//! use simfleet::distributor::distribute;
//! use simfleet::inventory::TestCase;
//!
//! let tests: Vec<_> = (0..10).map(|i| TestCase::new("Suite", format!("test{}", i))).collect();
//! let sizes: Vec<_> = distribute(&tests, 3).iter().map(Vec::len).collect();
//! assert_eq!(sizes, vec![4, 3, 3]);
//! ```

pub mod queues;

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::collaborator::{self, CollaboratorError, Collaborators, DistributionRequest, RunnerSlot};
use crate::config::DeviceProfile;
use crate::inventory::TestCase;
use crate::registry::Runner;

pub use queues::{DrainMode, WorkItem, WorkQueues};

/// Splits tests into `runners` contiguous chunks, larger chunks first.
pub fn distribute(tests: &[TestCase], runners: usize) -> Vec<Vec<TestCase>> {
    if runners == 0 {
        return Vec::new();
    }

    let base = tests.len() / runners;
    let extra = tests.len() % runners;

    let mut chunks = Vec::with_capacity(runners);
    let mut start = 0;
    for index in 0..runners {
        let size = base + usize::from(index < extra);
        chunks.push(tests[start..start + size].to_vec());
        start += size;
    }
    chunks
}

/// Normalizes collaborator-provided buckets onto `runners` queues.
///
/// - buckets beyond the runner count are folded round-robin onto the runners
/// - tests unknown to the inventory are ignored
/// - a test placed twice keeps its first placement
/// - tests the buckets omit go to the shortest queues
pub fn fold_buckets(
    tests: &[TestCase],
    buckets: Vec<Vec<TestCase>>,
    runners: usize,
) -> Vec<Vec<TestCase>> {
    if runners == 0 {
        return Vec::new();
    }

    let known: HashMap<String, &TestCase> = tests.iter().map(|t| (t.identifier(), t)).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut queues: Vec<Vec<TestCase>> = vec![Vec::new(); runners];

    for (index, bucket) in buckets.into_iter().enumerate() {
        let target = index % runners;
        for test in bucket {
            let id = test.identifier();
            let Some(original) = known.get(&id) else {
                warn!("Distribution names unknown test {}; ignoring it", test);
                continue;
            };
            if !placed.insert(id) {
                debug!("Test {} distributed twice; keeping first placement", test);
                continue;
            }
            queues[target].push((*original).clone());
        }
    }

    for test in tests {
        if placed.contains(&test.identifier()) {
            continue;
        }
        warn!("Distribution omitted test {}; appending it", test);
        if let Some(shortest) = queues.iter_mut().min_by_key(|q| q.len()) {
            shortest.push(test.clone());
        }
    }

    queues
}

/// Builds the per-runner queues, asking the collaborator when one is set.
///
/// An empty answer falls back to [`distribute`]; output that is not a list
/// of buckets is an error.
pub async fn plan(
    tests: &[TestCase],
    runners: &[Runner],
    device: &DeviceProfile,
    collaborators: &Collaborators,
) -> Result<Vec<Vec<TestCase>>, CollaboratorError> {
    let request = DistributionRequest {
        tests: tests.to_vec(),
        device: device.clone(),
        runners: runners
            .iter()
            .map(|r| RunnerSlot {
                node: r.node.clone(),
                name: r.name.clone(),
                udid: r.udid.clone(),
            })
            .collect(),
    };

    let queues = match collaborators
        .invoke::<collaborator::Distribution>(&request)
        .await?
    {
        Some(buckets) if buckets.iter().all(Vec::is_empty) => {
            warn!("Distribution collaborator returned no assignments; using the default partition");
            distribute(tests, runners.len())
        }
        Some(buckets) => {
            info!(
                "Distribution collaborator returned {} buckets for {} runners",
                buckets.len(),
                runners.len()
            );
            fold_buckets(tests, buckets, runners.len())
        }
        None => distribute(tests, runners.len()),
    };

    Ok(queues)
}
