pub mod block;
pub mod stage;

pub use block::DecoderLayer;
pub use stage::{ModelStage, StageInput, StageOutput};
