//! Ops tooling: coordinator HTTP client and cluster reports

pub mod client;
pub mod report;

pub use client::CoordinatorClient;
pub use report::ClusterReport;
