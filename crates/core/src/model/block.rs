use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::ModelConfig;
use crate::kv_cache::KvCache;
use crate::layers::{rms_norm, Attention, RmsNorm, RopeTables};
use crate::moe::MlpVariant;

/// Pre-norm residual transformer block:
/// `x1 = x + attn(norm1(x))`, `x2 = x1 + mlp(norm2(x1))`.
pub struct DecoderLayer {
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    self_attn: Attention,
    mlp: MlpVariant,
}

impl DecoderLayer {
    pub fn new(cfg: &ModelConfig, layer_index: usize, vb: VarBuilder) -> Result<Self> {
        let input_layernorm =
            rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let self_attn = Attention::new(cfg, layer_index, vb.pp("self_attn"))?;
        let mlp = MlpVariant::new(cfg, vb.pp("mlp"))?;
        Ok(Self {
            input_layernorm,
            post_attention_layernorm,
            self_attn,
            mlp,
        })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        cache: Option<&KvCache>,
        pos: usize,
        rope: Option<&RopeTables>,
    ) -> Result<Tensor> {
        let residual = xs;
        let hidden = self.input_layernorm.forward(xs)?;
        let hidden = self
            .self_attn
            .forward(&hidden, attention_mask, cache, pos, rope)?;
        let xs = (residual + hidden)?;

        let residual = &xs;
        let hidden = self.post_attention_layernorm.forward(&xs)?;
        let hidden = self.mlp.forward(&hidden)?.hidden;
        residual + hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn dense_config() -> ModelConfig {
        let json = r#"{
            "vocab_size": 32,
            "hidden_size": 16,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "intermediate_size": 32,
            "dtype": "fp32"
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn block_preserves_shape() {
        let cfg = dense_config();
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let layer = DecoderLayer::new(&cfg, 0, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (2, 3, 16), &device).unwrap();
        let y = layer.forward(&xs, None, None, 0, None).unwrap();
        assert_eq!(y.dims(), &[2, 3, 16]);
    }

    #[test]
    fn zero_weights_make_block_an_identity() {
        // With every projection zeroed both residual branches add zero.
        let cfg = dense_config();
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let layer = DecoderLayer::new(&cfg, 0, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap();
        let y = layer.forward(&xs, None, None, 0, None).unwrap();
        let a: Vec<f32> = xs.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn moe_block_constructs_and_runs() {
        let mut cfg = dense_config();
        cfg.use_moe = true;
        cfg.num_experts = 2;
        cfg.num_experts_per_tok = 1;
        cfg.moe_intermediate_size = 32;

        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let layer = DecoderLayer::new(&cfg, 0, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap();
        let y = layer.forward(&xs, None, None, 0, None).unwrap();
        assert_eq!(y.dims(), &[1, 2, 16]);
    }
}
