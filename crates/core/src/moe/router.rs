//! Top-k expert router.
//!
//! Routing contract: raw router logits are reduced with top-k (largest,
//! order unspecified), then the gate weights are a softmax over the selected
//! logits only. The full logits are kept for observability.

use candle_core::{Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

pub struct RouterOutput {
    /// Raw router logits `[B, T, E]`.
    pub logits: Tensor,
    /// Post-softmax gate weights over the selected experts `[B, T, K]`.
    pub gates: Tensor,
    /// Selected expert indices `[B, T, K]`, dtype U32.
    pub indices: Tensor,
}

pub struct TopKRouter {
    gate: Linear,
    num_experts: usize,
    top_k: usize,
}

impl TopKRouter {
    pub fn new(hidden_size: usize, num_experts: usize, top_k: usize, vb: VarBuilder) -> Result<Self> {
        if top_k == 0 || top_k > num_experts {
            candle_core::bail!(
                "router: top_k {top_k} must be in 1..={num_experts} (num_experts)"
            );
        }
        let gate = linear_no_bias(hidden_size, num_experts, vb)?;
        Ok(Self {
            gate,
            num_experts,
            top_k,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn route(&self, xs: &Tensor) -> Result<RouterOutput> {
        let logits = self.gate.forward(xs)?; // [B, T, E]
        let (top_vals, indices) = top_k_with_indices(&logits, self.top_k)?;
        let gates = candle_nn::ops::softmax_last_dim(&top_vals)?;
        Ok(RouterOutput {
            logits,
            gates,
            indices,
        })
    }
}

/// Top-k values and their indices along the last dim (descending).
fn top_k_with_indices(tensor: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let dim = tensor.rank() - 1;
    let n = tensor.dim(dim)?;
    let sorted_indices = tensor.arg_sort_last_dim(false)?;
    let top_indices = if k >= n {
        sorted_indices.contiguous()?
    } else {
        sorted_indices.narrow(dim, 0, k)?.contiguous()?
    };
    let top_values = tensor.contiguous()?.gather(&top_indices, D::Minus1)?;
    Ok((top_values, top_indices))
}
