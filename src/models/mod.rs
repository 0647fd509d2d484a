//! Domain model module declarations.

pub mod checkpoint;
pub mod plan;
pub mod resource;
pub mod session;
pub mod state;
pub mod task;
pub mod workflow;
