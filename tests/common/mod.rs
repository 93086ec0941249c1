//! On-disk fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use tempfile::TempDir;

pub const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"[UNK]": 0, "</s>": 1, "hello": 2, "world": 3, "again": 4},
    "unk_token": "[UNK]"
  }
}"#;

/// A workspace holding a tiny base model under `models/tiny`.
pub struct Workspace {
    pub temp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        write_model(&temp.path().join("models").join("tiny"));
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root().join("models")
    }

    pub fn write_dataset(&self, name: &str, lines: &[String]) -> PathBuf {
        let path = self.root().join(name);
        fs::write(&path, lines.join("\n")).expect("Failed to write dataset");
        path
    }

    /// Write a YAML config for `dataset_type` and return its path.
    pub fn write_config(&self, dataset_type: &str, dataset: &Path, headers: &str) -> PathBuf {
        let yaml = format!(
            r#"
base_model: tiny
lora:
  r: 2
  lora_alpha: 4
  target_modules: [q_proj, v_proj]
  lora_dropout: 0.0
  bias: none
  task_type: CAUSAL_LM
trainer:
  batch_size: 2
  gradient_accumulation_steps: 2
  warmup_steps: 1
  num_train_epochs: 2
  learning_rate: 0.0002
  logging_steps: 1
  save_steps: 2
data:
  type: {dataset_type}
  dataset: "{}"
{headers}
model_output_dir: "{}"
model_name: tiny-tuned
trainer_output_dir: "{}"
"#,
            dataset.display(),
            self.root().join("out").display(),
            self.root().join("checkpoints").display(),
        );
        let path = self.root().join("run.yaml");
        fs::write(&path, yaml).expect("Failed to write config");
        path
    }
}

pub const ALPACA_HEADERS: &str = "  instruct_header: Instruction\n  input_header: Input\n  output_header: Response";

pub const CHAT_HEADERS: &str = "  user_header: \"### Human:\\n\"\n  response_header: \"### Assistant:\\n\"";

pub fn alpaca_lines(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!(r#"{{"instruction":"hello {i}","input":"world","output":"again"}}"#))
        .collect()
}

pub fn base_weights() -> HashMap<String, Tensor> {
    let dev = Device::Cpu;
    let mut w = HashMap::new();
    for name in ["q_proj", "k_proj", "v_proj"] {
        w.insert(
            format!("model.layers.0.self_attn.{name}.weight"),
            Tensor::ones((4, 4), DType::F32, &dev).unwrap(),
        );
    }
    w.insert(
        "model.layers.0.input_layernorm.weight".to_string(),
        Tensor::ones(4, DType::F32, &dev).unwrap(),
    );
    w
}

fn write_model(dir: &Path) {
    fs::create_dir_all(dir).expect("Failed to create model dir");
    candle_core::safetensors::save(&base_weights(), dir.join("model.safetensors")).unwrap();
    fs::write(
        dir.join("config.json"),
        r#"{"model_type": "llama", "hidden_size": 4, "use_cache": true}"#,
    )
    .unwrap();
    fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    fs::write(
        dir.join("tokenizer_config.json"),
        r#"{"eos_token": "</s>", "model_max_length": 16}"#,
    )
    .unwrap();
}
