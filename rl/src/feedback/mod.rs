//! Feedback from an iteration back into the loop
//!
//! - [`decomposition`]: the agent splits its task into subtasks
//! - [`verification`]: build / test / lint checks gate completion
//! - [`learning`]: lessons carried across iterations and sessions

pub mod decomposition;
pub mod learning;
pub mod verification;

pub use decomposition::{
    DECOMPOSE_CLOSE, DECOMPOSE_OPEN, DecompositionError, DecompositionOutcome, DecompositionRequest,
    MAX_DECOMPOSITIONS_PER_ITERATION, apply_decomposition, parse_decomposition,
};
pub use learning::{LearningKind, LearningMemory, LearningStore, extract_learnings};
pub use verification::{CheckResult, VerificationReport, Verifier, blocks_completion, run_check};
