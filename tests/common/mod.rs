// Tiny GPT-J checkpoint on disk: config.json, tokenizer.json and safetensors weights.
#![allow(dead_code)]

use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::serialize_to_file;
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub const WORDS: [&str; 10] = [
    "what", "is", "the", "capital", "of", "france", "?", "paris", "hello", "world",
];
pub const VOCAB_SIZE: usize = WORDS.len() + 2;
pub const EOS_ID: u32 = 0;
pub const PARIS_ID: u32 = 9;
pub const N_POSITIONS: usize = 128;

const N_EMBD: usize = 8;
const N_LAYER: usize = 2;
const N_INNER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Layout {
    Single,
    Sharded,
}

pub fn tokenizer_json() -> String {
    let mut vocab = serde_json::Map::new();
    vocab.insert("<|endoftext|>".to_string(), json!(0));
    vocab.insert("<unk>".to_string(), json!(1));
    for (i, word) in WORDS.iter().enumerate() {
        vocab.insert(word.to_string(), json!(i + 2));
    }
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 0, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        }],
        "normalizer": {"type": "Lowercase"},
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    })
    .to_string()
}

pub fn config_json() -> String {
    json!({
        "activation_function": "gelu_new",
        "architectures": ["GPTJForCausalLM"],
        "bos_token_id": EOS_ID,
        "eos_token_id": EOS_ID,
        "layer_norm_epsilon": 1e-5,
        "model_type": "gptj",
        "n_embd": N_EMBD,
        "n_head": 2,
        "n_inner": N_INNER,
        "n_layer": N_LAYER,
        "n_positions": N_POSITIONS,
        "rotary_dim": 2,
        "task_specific_params": {
            "text-generation": {"do_sample": true, "max_length": 50, "temperature": 1.0}
        },
        "vocab_size": VOCAB_SIZE
    })
    .to_string()
}

/// Every GPT-J tensor for the tiny shape. The LM head bias strongly favours "paris",
/// so both greedy and sampled decoding keep answering with it.
pub fn tensors(seed: u64) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut random = |shape: &[usize]| -> Vec<f32> {
        (0..shape.iter().product::<usize>()).map(|_| rng.gen_range(-0.3..0.3)).collect()
    };
    let mut out = Vec::new();
    let mut push = |name: String, shape: Vec<usize>, data: Vec<f32>| out.push((name, shape, data));

    push("transformer.wte.weight".into(), vec![VOCAB_SIZE, N_EMBD], random(&[VOCAB_SIZE, N_EMBD]));
    for i in 0..N_LAYER {
        let p = format!("transformer.h.{i}");
        push(format!("{p}.ln_1.weight"), vec![N_EMBD], vec![1.0; N_EMBD]);
        push(format!("{p}.ln_1.bias"), vec![N_EMBD], vec![0.0; N_EMBD]);
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            push(format!("{p}.attn.{proj}.weight"), vec![N_EMBD, N_EMBD], random(&[N_EMBD, N_EMBD]));
        }
        // unused by the model, present in published checkpoints
        push(format!("{p}.attn.masked_bias"), vec![1], vec![-1e9]);
        push(format!("{p}.mlp.fc_in.weight"), vec![N_INNER, N_EMBD], random(&[N_INNER, N_EMBD]));
        push(format!("{p}.mlp.fc_in.bias"), vec![N_INNER], random(&[N_INNER]));
        push(format!("{p}.mlp.fc_out.weight"), vec![N_EMBD, N_INNER], random(&[N_EMBD, N_INNER]));
        push(format!("{p}.mlp.fc_out.bias"), vec![N_EMBD], random(&[N_EMBD]));
    }
    push("transformer.ln_f.weight".into(), vec![N_EMBD], vec![1.0; N_EMBD]);
    push("transformer.ln_f.bias".into(), vec![N_EMBD], vec![0.0; N_EMBD]);
    push("lm_head.weight".into(), vec![VOCAB_SIZE, N_EMBD], random(&[VOCAB_SIZE, N_EMBD]));
    let mut bias = vec![0.0; VOCAB_SIZE];
    bias[PARIS_ID as usize] = 50.0;
    push("lm_head.bias".into(), vec![VOCAB_SIZE], bias);
    out
}

fn encode(values: &[f32], dtype: Dtype) -> Vec<u8> {
    match dtype {
        Dtype::F16 => values.iter().flat_map(|v| f16::from_f32(*v).to_le_bytes()).collect(),
        _ => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

fn write_safetensors(path: &Path, tensors: &[(String, Vec<usize>, Vec<f32>)], dtype: Dtype) {
    let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, shape, data)| (name.clone(), shape.clone(), encode(data, dtype)))
        .collect();
    let views: Vec<(String, TensorView<'_>)> = bytes
        .iter()
        .map(|(name, shape, data)| {
            let view = TensorView::new(dtype, shape.clone(), data).expect("valid tensor view");
            (name.clone(), view)
        })
        .collect();
    serialize_to_file(views, &None, path).expect("write safetensors");
}

/// Writes a complete checkpoint into `dir`.
pub fn write_checkpoint(dir: &Path, layout: Layout, dtype: Dtype) {
    fs::write(dir.join("config.json"), config_json()).expect("write config");
    fs::write(dir.join("tokenizer.json"), tokenizer_json()).expect("write tokenizer");

    let all = tensors(17);
    match layout {
        Layout::Single => write_safetensors(&dir.join("model.safetensors"), &all, dtype),
        Layout::Sharded => {
            let (first, second) = all.split_at(all.len() / 2);
            let names = ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"];
            write_safetensors(&dir.join(names[0]), first, dtype);
            write_safetensors(&dir.join(names[1]), second, dtype);

            let mut weight_map = HashMap::new();
            for (name, _, _) in first {
                weight_map.insert(name.clone(), names[0]);
            }
            for (name, _, _) in second {
                weight_map.insert(name.clone(), names[1]);
            }
            let index = json!({"metadata": {"total_size": 0}, "weight_map": weight_map});
            fs::write(dir.join("model.safetensors.index.json"), index.to_string()).expect("write index");
        }
    }
}

pub fn checkpoint(layout: Layout, dtype: Dtype) -> TempDir {
    let dir = tempfile::tempdir().expect("temp dir");
    write_checkpoint(dir.path(), layout, dtype);
    dir
}
