//! Pulls VM disk images distributed as OCI artifacts from a container
//! registry and reassembles them into sparse disk files on local disk.
//!
//! The crate is organized leaf-first, the way the pull actually flows:
//! registry transport ([`oci`]) feeds the content-addressed [`cache`], which
//! feeds the bounded-concurrency [`download`] coordinator, whose output the
//! [`reassemble`]r folds into a single sparse `disk.img`. [`orchestrator`]
//! drives all four; [`progress`] and [`error`] cut across every layer.
//!
//! CLI parsing, settings storage, and VM-directory layout are intentionally
//! left to the host application — see the traits in [`collaborators`].

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod oci;
pub mod orchestrator;
pub mod progress;
pub mod reassemble;

pub use error::{PullError, Result};
pub use orchestrator::{PullOrchestrator, PullOutcome};
