//! Domain model (ids, tasks, nodes, leases, outcomes, errors).
//!
//! Pure data and state machines. Nothing here locks or sleeps.

pub mod attempt;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod lease;
pub mod node;
pub mod outcome;
pub mod state;
pub mod task;

pub use attempt::{AttemptEnd, AttemptRecord};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, PoolError};
pub use ids::{LeaseNonce, LeaseToken, NodeId, TaskId};
pub use lease::{Lease, LeaseGrant};
pub use node::{NodeCapabilities, NodeRecord};
pub use outcome::{Outcome, SubmitAck};
pub use state::{NodeStatus, TaskState};
pub use task::{TaskRecord, TaskSubmission};
