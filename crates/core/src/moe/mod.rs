pub mod block;
pub mod router;

pub use block::{MlpVariant, MoeOutput, SparseMoeBlock};
pub use router::{RouterOutput, TopKRouter};
