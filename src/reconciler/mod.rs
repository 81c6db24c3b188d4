pub mod scheduler;
pub mod source;

pub use scheduler::{
    Drift, Reconciler, ReconcilerSettings, RenewalThreshold, TriggerOutcome, compute_drift,
    needs_renewal,
};
pub use source::{DesiredStateSource, InMemorySource, RequestEvent};
