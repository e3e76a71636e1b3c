//! Block rules and their evaluation.

pub mod evaluator;
pub mod store;

pub use evaluator::{BlockReason, Evaluation, PolicyEvaluator, Verdict};
pub use store::PolicyStore;
