//! Bulk historical imports.

pub mod controller;

pub use controller::{
    run_backfill, BackfillConfig, BackfillMode, BackfillReport, ExportFeed,
};
