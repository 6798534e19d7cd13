//! Boa-backed script runtime: preprocessor evaluation inside workers and
//! solver invocation on the host side.

pub mod evaluator;
pub mod solver;

pub use evaluator::{BoaPreprocessor, EvalError, Evaluator, EvaluatorFactory};
pub use solver::SolverSet;
