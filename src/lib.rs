//! Provisioning, service lifecycle and installer image assembly for the
//! SonjayOS desktop remix.
//!
//! - **Pipeline** - ordered, idempotent stages that converge a host (or a
//!   staging root) onto a SonjayOS install
//! - **Services** - unit rendering and supervision of the AI, UI and security
//!   services through systemd or a process-group owner
//! - **Artifacts** - repackaging an Ubuntu live image into an unattended
//!   SonjayOS installer
//!
//! # Architecture
//!
//! ```text
//! config ──► ProvisionContext (immutable, mode-derived settings)
//!               │
//! pipeline ─────┼──► stages ──► component::Op ──► executor ──► process::Runner
//!               │                                                 │
//! service ──────┴──► Supervisor (systemd | process group)    SystemRunner
//!                                                           | testing::FakeHost
//! artifact ─────────► xorriso via process::Runner
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sonjayos_provision::config::{Mode, ProvisionConfig, ProvisionContext};
//! use sonjayos_provision::pipeline::{self, StageSet};
//! use sonjayos_provision::preflight::HostFacts;
//! use sonjayos_provision::process::SystemRunner;
//!
//! let ctx = ProvisionContext::new(ProvisionConfig::load(None)?, Mode::Production);
//! let facts = HostFacts::detect(&ctx.config.root, &ctx.config.install_dir())?;
//! pipeline::run(StageSet::Full, &ctx, &SystemRunner, &facts)?;
//! ```

pub mod artifact;
pub mod component;
pub mod config;
pub mod documents;
pub mod error;
pub mod executor;
pub mod graph;
pub mod logging;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod service;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use error::PipelineError;
