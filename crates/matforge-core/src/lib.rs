pub mod engine;
pub mod error;
pub mod store;
pub mod summary;
pub mod traits;
pub mod window;

pub use engine::{Collaborators, ResearchPlanner};
pub use error::{PlannerError, Result};
pub use store::PlanStore;
pub use traits::{
    CapabilityBuilder, HumanGate, HumanPrompt, PlanGenerator, PlanOutcome, ReadinessReport,
    ReplanHeuristic, StepExecutor, StepReport, SubmittedJob,
};
