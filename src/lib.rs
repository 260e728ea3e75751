//! Phase orchestration and evolution pipeline engine.
//!
//! A [`orchestrator::JobEngine`] drives a project's phases through an
//! external coding agent, verifying each phase's output and retrying with
//! feedback until it passes or escalates. Completed projects are promoted
//! through a test environment into production by the
//! [`evolution::EvolutionPipeline`].

pub mod config;
pub mod controller;
pub mod errors;
pub mod evolution;
pub mod orchestrator;
pub mod project;
pub mod runner;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod stream;
pub mod util;
pub mod verify;
