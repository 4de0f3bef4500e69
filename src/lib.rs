#![forbid(unsafe_code)]

//! # value-echo
//!
//! Cleaning and analysis pipeline for value-hierarchy survey studies.
//!
//! Participants rate pairs of values once in a baseline battery and again in
//! several judgment-context blocks. The central quantity is the *echo*: the
//! slope of a block rating on the baseline rating of the same pair, fitted
//! with participant-clustered standard errors. Around it sit quality
//! filtering, response-style residualisation, leave-one-out robustness,
//! test-retest agreement, block structure, context and cluster moderation,
//! and theory-profile signatures.
//!
//! Stages communicate through files; each one can be run on its own from
//! the `value-echo` binary or chained with `value-echo run`.

pub mod analysis;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ingest;
pub mod panel;
pub mod pipeline;
pub mod report;
pub mod stats;
pub mod synthetic;
pub mod table;

pub use catalog::{Catalog, CatalogSpec, Orientation, PairId, Profile, ValueId};
pub use config::{BlockMap, BlockMapping, BlockSpec, CleaningConfig, StudyConfig};
pub use error::{AnalysisError, Result};
pub use ingest::{clean, clean_file, CleanOutcome, SliderSchema};
pub use panel::{BaselineTable, Panel, PanelRow};
pub use report::{Cell, ReportTable};
pub use table::{NumericFrame, ReadOptions, Table};
