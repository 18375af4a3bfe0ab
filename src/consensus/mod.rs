//! Consensus rules: chain parameters, block and transaction validation, and
//! the subsidy schedule.

pub mod monetary;
pub mod params;
pub mod validation;

pub use monetary::MonetaryPolicy;
pub use params::ConsensusParams;
pub use validation::{BlockValidator, ParentContext};
