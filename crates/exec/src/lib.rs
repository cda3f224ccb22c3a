//! Remote execution of policy-approved commands.
//!
//! [`RemoteExecutor`] is the only path from an allow [`Verdict`] to the
//! target host.  It talks to the host through a [`SessionManager`], which
//! owns the single shared [`Session`] and wraps any [`RemoteTransport`].
//!
//! [`Verdict`]: syspilot_policy::Verdict

pub mod executor;
pub mod process;
pub mod session;
pub mod transport;

pub use executor::{
    CommandRequest, ExecError, ExecutionResult, ExecutorSettings, Outcome, RemoteExecutor,
};
pub use process::{Launcher, ProcessTransport};
pub use session::SessionManager;
pub use transport::{
    ExecutionId, PollStatus, RawOutput, RemoteTransport, Session, TransportError,
};
