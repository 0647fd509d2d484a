//! Session orchestration.
//!
//! Covers session exclusivity, resource monitoring, durable state with
//! checkpoints, task execution, workflow dispatch, and the improvement loop.

pub mod checkpoint_manager;
pub mod executor;
pub mod improvement_loop;
pub mod resource_monitor;
pub mod session_manager;
pub mod state_manager;
pub mod workflow_adapter;

pub use executor::TaskExecutor;
pub use improvement_loop::ContinuousImprovementLoop;
pub use resource_monitor::ResourceMonitor;
pub use session_manager::SessionManager;
pub use state_manager::AgentStateManager;
pub use workflow_adapter::WorkflowAdapter;
