pub mod authority;
pub mod csr;
pub mod dns;
pub mod dns_providers;
pub mod http;
pub mod machine;
pub mod retry;
pub mod solver;

pub use machine::{IssuanceFailure, IssuanceMachine, IssuanceOutcome, IssuanceTimeouts};
pub use retry::RetryPolicy;
pub use solver::ChallengeSolver;
