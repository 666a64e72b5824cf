/// Storage module for samples and analysis artifacts
///
/// This module provides:
/// - A staging area holding uploaded samples while their run is in flight
/// - The durable results store, browsable per run

pub mod reports;
pub mod staging;

pub use reports::ReportStore;
pub use staging::{safe_file_name, StagedSample, StagingArea};
