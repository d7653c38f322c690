pub mod invocation;
pub mod plans;
pub mod router;

pub use invocation::{parse_invocation, Invocation};
pub use plans::{ConfirmationPlan, PlanError, PlanId, PlanState, PlanStore};
pub use router::{InvocationState, RouterOutcome, ToolRouter};
