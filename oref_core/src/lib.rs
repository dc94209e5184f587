#![cfg_attr(not(feature = "wasm"), forbid(unsafe_code))]

//! Closed-loop insulin dosing engine.
//!
//! This crate provides:
//! - Domain types (profile, treatments, glucose, IOB, meal, recommendation)
//! - Insulin activity curves and the dose ledger
//! - Profile schedule resolution and temp targets
//! - Glucose status, carbs on board and sensitivity detection
//! - Determine-basal with predictions, SMB and safety limits
//! - JSON request/response mapping for legacy and snake_case hosts

pub mod types;
pub mod error;
pub mod rounding;
pub mod insulin;
pub mod profile;
pub mod glucose;
pub mod iob;
pub mod deviations;
pub mod meal;
pub mod autosens;
pub mod dynamic_isf;
pub mod predictions;
pub mod smb;
pub mod safety;
pub mod determine_basal;
pub mod engine;
pub mod config;
pub mod logging;
pub mod history;
pub mod wire;

#[cfg(feature = "wasm")]
pub mod wasm;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use insulin::InsulinCurve;
pub use engine::recommend;
pub use determine_basal::{determine_basal, DetermineBasalInputs};
pub use wire::{parse_request, run_json, Naming, Operation};
pub use history::{load_glucose_csv, load_request};
