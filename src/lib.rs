//! simfleet: distributed UI test runner for Apple simulators.
//!
//! simfleet spreads single UI tests over simulator runners hosted on a pool
//! of macOS nodes, the local machine or SSH hosts, and merges every attempt
//! into one session report.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Channel**: runs commands on nodes (local subprocess or `ssh`)
//! - **Registry**: nodes, their capacity and health, simulator runners
//! - **Inventory**: test discovery, filtering and ordering
//! - **Distributor**: per-runner work queues with stealing and draining
//! - **Executor**: one `xcodebuild` invocation per test, with a watchdog
//! - **Retry**: retry and stability modes, infrastructure retries
//! - **Aggregator**: append-only results and stage timings
//! - **Orchestrator**: the session tying everything together
//! - **Collaborator**: external commands hooked into the session
//! - **Report**: console progress, `report.json`, `junit.xml`
//!
//! # Example
//!
//! ```no_run
//! use simfleet::channel::SystemChannels;
//! use simfleet::report::NullReporter;
//! use simfleet::{Orchestrator, load_config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("simfleet.toml"))?;
//!     let report = Orchestrator::new(config, SystemChannels, NullReporter).run().await?;
//!     println!("{} passed, {} failed", report.snapshot.passed, report.snapshot.failed);
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod channel;
pub mod collaborator;
pub mod config;
pub mod distributor;
pub mod executor;
pub mod inventory;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod retry;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use executor::TestCaseResult;
pub use inventory::TestCase;
pub use orchestrator::Orchestrator;
pub use report::{Reporter, SessionReport};
