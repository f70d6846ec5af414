//! # Residency
//!
//! The budgeted working set of one engine and the ordering it evicts from.

pub mod residency_set;
pub mod trim_list;

pub use residency_set::{ResidencySet, ResidencyStats};
pub use trim_list::TrimCandidateList;
