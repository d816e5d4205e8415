//! The fleet doctor: an autonomous detect → diagnose → act → log loop.
//!
//! Every cycle the doctor takes a snapshot of fleet state, runs the detector
//! set over it, asks the diagnosis oracle (an LLM, with a static fallback)
//! what to do, and executes bounded remediations. Safety rails: per-node
//! cooldowns, a sliding hourly action budget, and a risk-level allowlist that
//! is enforced against both the diagnosis and the action catalogue.

#![forbid(unsafe_code)]

pub mod actions;
pub mod engine;
pub mod oracle;
pub mod problems;

pub use actions::{ActionRunner, ActionSpec, HttpActionRunner, default_action};
pub use engine::{CycleReport, Doctor, DoctorConfig, DoctorStatus};
pub use oracle::{Diagnosis, DiagnosisContext, DiagnosisOracle, LlmOracle, RecommendedAction};
pub use problems::{Detector, DetectorConfig, FleetView, default_detectors, detect_all};
