//! Sparse mixture-of-experts block with dense fallback.
//!
//! Dispatch is correctness-first and unfused: every expert runs over the
//! full token set once, and contributions are accumulated under the top-k
//! selection mask weighted by post-softmax gates. A fused scatter/gather
//! implementation may replace this without changing the contract.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::router::TopKRouter;
use crate::config::ModelConfig;
use crate::layers::SwiGluMlp;

pub struct MoeOutput {
    pub hidden: Tensor,
    /// Raw router logits `[B, T, E]`; `None` for dense layers.
    pub router_logits: Option<Tensor>,
}

pub struct SparseMoeBlock {
    router: TopKRouter,
    experts: Vec<SwiGluMlp>,
}

impl SparseMoeBlock {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_experts = cfg.num_experts;
        let top_k = cfg.num_experts_per_tok;
        let router = TopKRouter::new(cfg.hidden_size, num_experts, top_k, vb.pp("gate"))?;

        // Expert ordering is load-bearing: expert e loads from experts.{e}.*.
        let mut experts = Vec::with_capacity(num_experts);
        let vb_experts = vb.pp("experts");
        for e in 0..num_experts {
            experts.push(SwiGluMlp::new(
                cfg.hidden_size,
                cfg.moe_intermediate_or_default(),
                vb_experts.pp(e),
            )?);
        }

        Ok(Self { router, experts })
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<MoeOutput> {
        let (_b, _t, _d) = xs.dims3()?;
        let routed = self.router.route(xs)?;
        let top_k = self.router.top_k();

        let mut hidden = xs.zeros_like()?;
        for (e, expert) in self.experts.iter().enumerate() {
            let expert_out = expert.forward(xs)?; // [B, T, D]
            for k in 0..top_k {
                let idx_k = routed.indices.narrow(2, k, 1)?.squeeze(2)?; // [B, T]
                let gate_k = routed.gates.narrow(2, k, 1)?; // [B, T, 1]
                let mask = idx_k
                    .eq(e as u32)?
                    .unsqueeze(2)?
                    .to_dtype(xs.dtype())?; // [B, T, 1]
                let contribution = expert_out
                    .broadcast_mul(&gate_k)?
                    .broadcast_mul(&mask)?;
                hidden = (hidden + contribution)?;
            }
        }

        Ok(MoeOutput {
            hidden,
            router_logits: Some(routed.logits),
        })
    }
}

/// Per-layer MLP: a dense SwiGLU or a sparse MoE block.
pub enum MlpVariant {
    Dense(SwiGluMlp),
    Sparse(SparseMoeBlock),
}

impl MlpVariant {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.use_moe {
            Ok(Self::Sparse(SparseMoeBlock::new(cfg, vb)?))
        } else {
            Ok(Self::Dense(SwiGluMlp::new(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb,
            )?))
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<MoeOutput> {
        match self {
            Self::Dense(mlp) => Ok(MoeOutput {
                hidden: mlp.forward(xs)?,
                router_logits: None,
            }),
            Self::Sparse(moe) => moe.forward(xs),
        }
    }
}
