//! ViT-style vision tower and the projector into the text hidden space.
//!
//! The encoder turns pixel tensors `[B, C, H, W]` into `[B, 1 + H'W', D_v]`
//! token sequences (patch conv, CLS token, learned positions, pre-norm
//! LayerNorm blocks). The projector maps those into `[B, V, D]` so the model
//! stage can concatenate them in front of the text tokens.

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    conv2d, embedding, layer_norm, linear, Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear,
    VarBuilder,
};

use crate::config::ModelConfig;

// ─── Patch embedding ─────────────────────────────────────────────────────────

struct PatchEmbedding {
    proj: Conv2d,
}

impl PatchEmbedding {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.vision_patch_size == 0 {
            candle_core::bail!("vision: vision_patch_size must be > 0");
        }
        let proj = conv2d(
            cfg.vision_num_channels,
            cfg.vision_hidden_size,
            cfg.vision_patch_size,
            Conv2dConfig {
                stride: cfg.vision_patch_size,
                ..Default::default()
            },
            vb.pp("patch_embedding"),
        )?;
        Ok(Self { proj })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        // [B, C, H, W] -> [B, D_v, H', W'] -> [B, H'*W', D_v]
        let embeddings = self.proj.forward(pixel_values)?;
        embeddings.flatten(2, 3)?.transpose(1, 2)?.contiguous()
    }
}

// ─── Encoder attention / MLP ─────────────────────────────────────────────────

struct VisionAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl VisionAttention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.vision_hidden_size;
        let num_heads = cfg.vision_num_heads;
        if num_heads == 0 || hidden % num_heads != 0 {
            candle_core::bail!(
                "vision: vision_hidden_size {hidden} must be divisible by vision_num_heads {num_heads}"
            );
        }
        let head_dim = hidden / num_heads;
        Ok(Self {
            q_proj: linear(hidden, hidden, vb.pp("q_proj"))?,
            k_proj: linear(hidden, hidden, vb.pp("k_proj"))?,
            v_proj: linear(hidden, hidden, vb.pp("v_proj"))?,
            out_proj: linear(hidden, hidden, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let (b, s, _) = hidden_states.dims3()?;
        let shape = (b, s, self.num_heads, self.head_dim);

        let q = self.q_proj.forward(hidden_states)?.reshape(shape)?.transpose(1, 2)?;
        let k = self.k_proj.forward(hidden_states)?.reshape(shape)?.transpose(1, 2)?;
        let v = self.v_proj.forward(hidden_states)?.reshape(shape)?.transpose(1, 2)?;

        let weights = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let context = weights.matmul(&v.contiguous()?)?;

        let context = context
            .transpose(1, 2)?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&context)
    }
}

struct VisionMlp {
    fc1: Linear,
    fc2: Linear,
}

impl VisionMlp {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let intermediate = if cfg.vision_intermediate_size > 0 {
            cfg.vision_intermediate_size
        } else {
            cfg.vision_hidden_size * 4
        };
        Ok(Self {
            fc1: linear(cfg.vision_hidden_size, intermediate, vb.pp("fc1"))?,
            fc2: linear(intermediate, cfg.vision_hidden_size, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(hidden_states)?.gelu_erf()?;
        self.fc2.forward(&hidden)
    }
}

struct VisionEncoderLayer {
    layer_norm1: LayerNorm,
    layer_norm2: LayerNorm,
    self_attn: VisionAttention,
    mlp: VisionMlp,
}

impl VisionEncoderLayer {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(
                cfg.vision_hidden_size,
                cfg.vision_layer_norm_eps,
                vb.pp("layer_norm1"),
            )?,
            layer_norm2: layer_norm(
                cfg.vision_hidden_size,
                cfg.vision_layer_norm_eps,
                vb.pp("layer_norm2"),
            )?,
            self_attn: VisionAttention::new(cfg, vb.pp("self_attn"))?,
            mlp: VisionMlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let residual = hidden_states;
        let hidden = self.layer_norm1.forward(hidden_states)?;
        let hidden = self.self_attn.forward(&hidden)?;
        let hidden = (residual + hidden)?;

        let residual = &hidden;
        let out = self.layer_norm2.forward(&hidden)?;
        let out = self.mlp.forward(&out)?;
        residual + out
    }
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

pub struct VisionEncoder {
    patch_embedding: PatchEmbedding,
    class_embedding: Tensor,
    position_embedding: Embedding,
    layers: Vec<VisionEncoderLayer>,
    post_layernorm: LayerNorm,
    hidden_size: usize,
    max_positions: usize,
}

impl VisionEncoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.vision_hidden_size == 0 {
            candle_core::bail!("vision: vision_hidden_size must be > 0");
        }
        let patch_embedding = PatchEmbedding::new(cfg, vb.clone())?;
        let class_embedding = vb.get((1, 1, cfg.vision_hidden_size), "class_embedding")?;

        let max_positions = cfg.vision_max_patches + 1;
        let position_embedding = embedding(
            max_positions,
            cfg.vision_hidden_size,
            vb.pp("position_embedding"),
        )?;

        let mut layers = Vec::with_capacity(cfg.vision_num_layers);
        let vb_layers = vb.pp("encoder.layers");
        for i in 0..cfg.vision_num_layers {
            layers.push(VisionEncoderLayer::new(cfg, vb_layers.pp(i))?);
        }

        let post_layernorm = layer_norm(
            cfg.vision_hidden_size,
            cfg.vision_layer_norm_eps,
            vb.pp("post_layernorm"),
        )?;

        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
            layers,
            post_layernorm,
            hidden_size: cfg.vision_hidden_size,
            max_positions,
        })
    }

    /// Encode `[B, C, H, W]` pixels into `[B, 1 + H'W', D_v]` tokens.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let batch = pixel_values.dim(0)?;
        let mut embeddings = self.patch_embedding.forward(pixel_values)?;

        let cls = self
            .class_embedding
            .broadcast_as((batch, 1, self.hidden_size))?;
        embeddings = Tensor::cat(&[&cls, &embeddings], 1)?;

        let seq_len = embeddings.dim(1)?;
        if seq_len > self.max_positions {
            candle_core::bail!(
                "vision: {seq_len} tokens exceed the position table ({} entries)",
                self.max_positions
            );
        }
        let position_ids = Tensor::arange(0u32, seq_len as u32, pixel_values.device())?;
        let positions = self.position_embedding.forward(&position_ids)?;
        embeddings = embeddings.broadcast_add(&positions)?;

        for layer in &self.layers {
            embeddings = layer.forward(&embeddings)?;
        }
        self.post_layernorm.forward(&embeddings)
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

// ─── Projector ───────────────────────────────────────────────────────────────

/// `LayerNorm(D_v) -> Linear(D_v, D_mid) -> GELU -> Linear(D_mid, D)`.
pub struct VisionProjector {
    norm: LayerNorm,
    linear_1: Linear,
    linear_2: Linear,
}

impl VisionProjector {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let mid = cfg.projector_hidden_or_default();
        Ok(Self {
            norm: layer_norm(
                cfg.vision_hidden_size,
                cfg.vision_layer_norm_eps,
                vb.pp("norm"),
            )?,
            linear_1: linear(cfg.vision_hidden_size, mid, vb.pp("linear_1"))?,
            linear_2: linear(mid, cfg.hidden_size, vb.pp("linear_2"))?,
        })
    }

    /// `[B, V, D_v]` vision tokens into `[B, V, D]` text-space tokens.
    pub fn forward(&self, vision_tokens: &Tensor) -> Result<Tensor> {
        let hidden = self.norm.forward(vision_tokens)?;
        let hidden = self.linear_1.forward(&hidden)?.gelu_erf()?;
        self.linear_2.forward(&hidden)
    }
}

/// Every vision + projector parameter slot with its shape, named relative to
/// the stage root (`vision.*` / `projector.*`).
///
/// The weight loader uses this to zero-initialize the tower while vision
/// checkpoint mapping is deferred, so a stage with vision fields is always
/// constructible.
pub fn parameter_shapes(cfg: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let dv = cfg.vision_hidden_size;
    let iv = if cfg.vision_intermediate_size > 0 {
        cfg.vision_intermediate_size
    } else {
        dv * 4
    };
    let p = cfg.vision_patch_size;
    let mid = cfg.projector_hidden_or_default();

    let mut slots = vec![
        (
            "vision.patch_embedding.weight".to_string(),
            vec![dv, cfg.vision_num_channels, p, p],
        ),
        ("vision.patch_embedding.bias".to_string(), vec![dv]),
        ("vision.class_embedding".to_string(), vec![1, 1, dv]),
        (
            "vision.position_embedding.weight".to_string(),
            vec![cfg.vision_max_patches + 1, dv],
        ),
        ("vision.post_layernorm.weight".to_string(), vec![dv]),
        ("vision.post_layernorm.bias".to_string(), vec![dv]),
        ("projector.norm.weight".to_string(), vec![dv]),
        ("projector.norm.bias".to_string(), vec![dv]),
        ("projector.linear_1.weight".to_string(), vec![mid, dv]),
        ("projector.linear_1.bias".to_string(), vec![mid]),
        (
            "projector.linear_2.weight".to_string(),
            vec![cfg.hidden_size, mid],
        ),
        ("projector.linear_2.bias".to_string(), vec![cfg.hidden_size]),
    ];

    for i in 0..cfg.vision_num_layers {
        let base = format!("vision.encoder.layers.{i}");
        for norm in ["layer_norm1", "layer_norm2"] {
            slots.push((format!("{base}.{norm}.weight"), vec![dv]));
            slots.push((format!("{base}.{norm}.bias"), vec![dv]));
        }
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            slots.push((format!("{base}.self_attn.{proj}.weight"), vec![dv, dv]));
            slots.push((format!("{base}.self_attn.{proj}.bias"), vec![dv]));
        }
        slots.push((format!("{base}.mlp.fc1.weight"), vec![iv, dv]));
        slots.push((format!("{base}.mlp.fc1.bias"), vec![iv]));
        slots.push((format!("{base}.mlp.fc2.weight"), vec![dv, iv]));
        slots.push((format!("{base}.mlp.fc2.bias"), vec![dv]));
    }

    slots
}
