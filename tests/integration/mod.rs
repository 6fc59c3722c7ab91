//! Integration test suite for conductor.
//!
//! These tests run work items through the public `Orchestrator` API and
//! verify that grouping, scheduling, workspaces, the feedback loop and
//! escalation work together correctly.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full runs against a real git repository
//! - `parallel_groups`: Concurrency limit and level barrier
//! - `recovery`: Retries, timeouts, terminal failures and escalation
//! - `feedback`: Validation phase outcomes
//! - `workspaces`: Workspace and branch lifecycle
//! - `cancellation`: Cancel during execution and validation
//!
//! # CI Compatibility
//!
//! Executors and metrics collectors are scripted; the only external tool
//! used is `git`, to set up temporary repositories.

mod fixtures;

mod cancellation;
mod feedback;
mod parallel_groups;
mod recovery;
mod workflow_e2e;
mod workspaces;
