//! Per-stage pipeline driver.
//!
//! A thin coordinator owning one [`ModelStage`]. It adapts incoming
//! activation packets into stage inputs, runs the forward, and packages the
//! result for the next hop. Sequencing is linear: one in-flight microbatch
//! per stage, no retries on failed sends.

use candle_core::Device;
use thiserror::Error;
use tracing::debug;

use crate::model::{ModelStage, StageInput, StageOutput};
use crate::transport::{ActivationPacket, WIRE_VERSION};

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("stage {stage}: {source}")]
    Forward {
        stage: usize,
        #[source]
        source: candle_core::Error,
    },

    #[error("stage {stage}: activation packet carries no hidden tensor")]
    MissingHidden { stage: usize },

    #[error("stage {stage}: activation packet has negative pos {pos}")]
    NegativePos { stage: usize, pos: i64 },
}

pub struct StageDriver {
    stage: ModelStage,
}

impl StageDriver {
    pub fn new(stage: ModelStage) -> Self {
        Self { stage }
    }

    pub fn stage(&self) -> &ModelStage {
        &self.stage
    }

    pub fn stage_mut(&mut self) -> &mut ModelStage {
        &mut self.stage
    }

    fn stage_id(&self) -> usize {
        self.stage.config().stage_id
    }

    /// Run one forward with locally assembled inputs (stage 0, tests).
    pub fn run_local(&mut self, input: &StageInput) -> Result<StageOutput, ForwardError> {
        let stage_id = self.stage_id();
        self.stage
            .forward(input)
            .map_err(|source| ForwardError::Forward {
                stage: stage_id,
                source,
            })
    }

    /// Run one forward from a received activation packet.
    ///
    /// The hidden tensor (and mask, if any) is moved to `device`; `pos` is
    /// taken from the packet.
    pub fn run_from_activation(
        &mut self,
        packet: &ActivationPacket,
        device: &Device,
    ) -> Result<StageOutput, ForwardError> {
        let stage_id = self.stage_id();
        if packet.pos < 0 {
            return Err(ForwardError::NegativePos {
                stage: stage_id,
                pos: packet.pos,
            });
        }

        let wrap = |source: candle_core::Error| ForwardError::Forward {
            stage: stage_id,
            source,
        };
        let hidden = packet
            .hidden
            .to_device(device)
            .and_then(|h| h.contiguous())
            .map_err(wrap)?;
        let attn_mask = match &packet.attn_mask {
            Some(mask) => Some(mask.to_device(device).map_err(wrap)?),
            None => None,
        };

        debug!(
            stage = stage_id,
            step = packet.step,
            pos = packet.pos,
            "running stage from activation"
        );
        self.run_local(&StageInput {
            hidden_in: Some(hidden),
            attn_mask,
            pos: packet.pos as usize,
            ..Default::default()
        })
    }

    /// Package a stage output for the next stage.
    pub fn to_activation(
        &self,
        out: &StageOutput,
        stage_from: i32,
        stage_to: i32,
        step: i64,
        pos: i64,
    ) -> ActivationPacket {
        ActivationPacket {
            version: WIRE_VERSION,
            stage_from,
            stage_to,
            step,
            pos,
            hidden: out.hidden_out.clone(),
            attn_mask: None,
        }
    }
}
