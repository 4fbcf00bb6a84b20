pub mod admission;
pub mod estimator;
pub mod lifecycle;
pub mod strategies;

pub use admission::AdmissionService;
pub use estimator::WaitTimeEstimator;
pub use lifecycle::{CreateTaskInput, TaskLifecycleService};
pub use strategies::{ClaimOutcome, DispatchService};
