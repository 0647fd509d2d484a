//! Workflow safety policy.

pub mod evaluator;

pub use evaluator::{AllowAll, DenyListPolicy, SafetyCheck};
