//! Infeasible-path analysis over control-flow graphs, for WCET tooling.
//!
//! Given a program's CFG set with loop labels and semantic
//! microinstructions, the analysis runs a symbolic abstract interpreter over
//! every block, drives a fixpoint with loop acceleration, asks an SMT solver
//! whether the predicates accumulated on selected edges are satisfiable, and
//! reports the minimized sets of control-flow edges no concrete execution
//! can take together.

pub mod config;
pub mod dominance;
mod driver;
pub mod error;
pub mod interp;
pub mod oracle;
pub mod path;
pub mod predicate;
pub mod program;
pub mod report;
pub mod smt;
pub mod state;
pub mod term;

pub use config::AnalysisConfig;
pub use driver::{AnalysisResult, analyze};
pub use error::CuldesacError;
