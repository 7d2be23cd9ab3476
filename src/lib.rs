//
// lib.rs
// MedImg-Pipeline
//
// Exposes the pipeline stages and re-exports the CLI entry point for both binary and library consumers.
//
// Thales Matheus Mendonça Santos - November 2025

// Stages are listed leaf-first: detection and validation, decoding and statistics, display,
// segmentation, analysis, then the service and delivery layers.
pub mod format;
pub mod error;
pub mod models;
pub mod dicom_access;
pub mod metadata;
pub mod validate;
pub mod decode;
pub mod stats;
pub mod image;
pub mod external_tool;
pub mod segmentation;
pub mod analysis;
pub mod lifecycle;
pub mod storage;
pub mod config;
pub mod pipeline;
pub mod cli;
pub mod web;

pub use cli::{run as run_cli, Cli, Commands};
pub use error::PipelineError;
pub use models::{ImageAsset, SegmentationManifest, StatisticalSummary, ValidationVerdict};
pub use pipeline::{Pipeline, ProcessRequest};
