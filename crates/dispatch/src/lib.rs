//! Tool routing and the dispatch pipeline.
//!
//! [`ToolRouter`] turns a [`ToolInvocation`](syspilot_tools::ToolInvocation)
//! into a policy-gated plan and runs it.  [`DispatchCoordinator`] runs those
//! plans on worker tasks so the interface never waits on remote I/O.

pub mod coordinator;
pub mod error;
pub mod router;

pub use coordinator::{Completion, DispatchCoordinator, DispatchHandle, InvocationState};
pub use error::DispatchError;
pub use router::{RoutePlan, Routed, ToolRouter};
