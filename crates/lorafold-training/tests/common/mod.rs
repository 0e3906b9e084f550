#![allow(dead_code)]

use candle_core::Device;
use lorafold_core::{BaseModel, ModelConfig};
use lorafold_training::{
    DatasetBuilder, Outcome, PromptTemplate, RunContext, Stage, TokenizeOptions, TokenizedDataset, TokenizerAdapter,
    TrainingEngine, TrainingFailure,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokenizers::Tokenizer;

pub const CSV: &str = "prompt,response\n\
hello,world\n\
how are you ?,\"fine , thanks .\"\n\
what is two plus two ?,four\n";

pub fn tokenizer() -> Tokenizer {
    let words = [
        "[PAD]", "[UNK]", "User:", "Assistant:", "hello", "world", "how", "are", "you", "fine", "thanks", "what",
        "is", "two", "plus", "four", "?", ",", ".", "!",
    ];
    let vocab = words
        .iter()
        .enumerate()
        .map(|(i, w)| format!("{w:?}:{i}"))
        .collect::<Vec<_>>()
        .join(",");
    let json = format!(
        r#"{{"version":"1.0","truncation":null,"padding":null,"added_tokens":[],"normalizer":null,"pre_tokenizer":{{"type":"WhitespaceSplit"}},"post_processor":null,"decoder":null,"model":{{"type":"WordLevel","vocab":{{{vocab}}},"unk_token":"[UNK]"}}}}"#
    );
    json.parse().unwrap()
}

pub fn dataset(max_length: usize) -> TokenizedDataset {
    let examples = DatasetBuilder::new(PromptTemplate::Plain)
        .from_reader(CSV.as_bytes())
        .unwrap();
    let options = TokenizeOptions {
        max_length,
        ..Default::default()
    };
    TokenizerAdapter::new(tokenizer(), options)
        .unwrap()
        .tokenize_all(&examples)
        .unwrap()
}

pub fn base_model(max_positions: usize) -> BaseModel {
    let config = ModelConfig {
        vocab_size: 20,
        hidden_size: 16,
        num_layers: 2,
        num_heads: 2,
        intermediate_size: 32,
        max_position_embeddings: max_positions,
        layer_norm_eps: 1e-5,
        linear_bias: false,
    };
    BaseModel::random(config, 7, &Device::Cpu).unwrap()
}

pub fn context(dir: &Path) -> RunContext {
    RunContext::new("pipeline", Device::Cpu, dir.join("checkpoints"), dir.join("adapter")).unwrap()
}

/// Primary engine that fails the way a broken device kernel would
pub struct BrokenEngine {
    pub calls: Arc<AtomicUsize>,
}

impl TrainingEngine for BrokenEngine {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn run(&mut self, ctx: &RunContext, _data: &TokenizedDataset) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Outcome::Failure(TrainingFailure {
            stage: Stage::Training,
            run_id: ctx.run_id().to_string(),
            engine: self.name().to_string(),
            last_step: 0,
            last_epoch: 0,
            error: lorafold_core::FinetuneError::device("illegal memory access"),
        })
    }
}
