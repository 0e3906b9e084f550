//! Tokenization into fixed-length records

use lorafold_core::{FinetuneError, Result};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::dataset::TrainingExample;

/// Label value excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationPolicy {
    /// Cut encodings longer than `max_length`
    #[default]
    Truncate,
    /// Reject them with a tokenization error
    Reject,
}

/// What pad positions hold in `labels`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPadding {
    /// Labels are an exact copy of `input_ids`, pad ids included
    Copy,
    /// Pad positions get `IGNORE_INDEX`
    #[default]
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizeOptions {
    pub max_length: usize,
    pub pad_id: u32,
    pub truncation: TruncationPolicy,
    pub label_padding: LabelPadding,
    pub add_special_tokens: bool,
}

impl Default for TokenizeOptions {
    fn default() -> Self {
        Self {
            max_length: 128,
            pad_id: 0,
            truncation: TruncationPolicy::Truncate,
            label_padding: LabelPadding::Ignore,
            add_special_tokens: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedRecord {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
}

impl TokenizedRecord {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Records of one run, all exactly `max_length` long
#[derive(Debug, Clone)]
pub struct TokenizedDataset {
    records: Vec<TokenizedRecord>,
    max_length: usize,
}

impl TokenizedDataset {
    pub fn new(records: Vec<TokenizedRecord>, max_length: usize) -> Result<Self> {
        for (index, record) in records.iter().enumerate() {
            if record.input_ids.len() != max_length
                || record.attention_mask.len() != max_length
                || record.labels.len() != max_length
            {
                return Err(FinetuneError::tokenization(format!(
                    "record {index} is not {max_length} long"
                )));
            }
        }
        Ok(Self {
            records,
            max_length,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn get(&self, index: usize) -> Option<&TokenizedRecord> {
        self.records.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenizedRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[TokenizedRecord] {
        &self.records
    }
}

/// End-of-sequence spellings tried, in order, when a tokenizer has no pad token
const EOS_TOKENS: [&str; 3] = ["</s>", "<|endoftext|>", "<|im_end|>"];

pub struct TokenizerAdapter {
    tokenizer: Tokenizer,
    options: TokenizeOptions,
}

impl TokenizerAdapter {
    pub fn new(tokenizer: Tokenizer, options: TokenizeOptions) -> Result<Self> {
        if options.max_length == 0 {
            return Err(FinetuneError::config("max_length must be > 0"));
        }
        Ok(Self { tokenizer, options })
    }

    /// Id of `pad_token` in the tokenizer vocabulary
    pub fn resolve_pad_id(tokenizer: &Tokenizer, pad_token: &str) -> Result<u32> {
        tokenizer.token_to_id(pad_token).ok_or_else(|| {
            FinetuneError::tokenization(format!("pad token '{pad_token}' is not in the vocabulary"))
        })
    }

    /// Pad id when none is named: the tokenizer's own padding setting, else
    /// its end-of-sequence token, else 0
    pub fn default_pad_id(tokenizer: &Tokenizer) -> u32 {
        if let Some(padding) = tokenizer.get_padding() {
            return padding.pad_id;
        }
        if let Some((token, id)) = EOS_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token).map(|id| (*token, id)))
        {
            tracing::info!(token, id, "no padding configured, padding with the end-of-sequence token");
            return id;
        }
        tracing::warn!("tokenizer has no padding or end-of-sequence token, padding with id 0");
        0
    }

    pub fn options(&self) -> &TokenizeOptions {
        &self.options
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn tokenize(&self, example: &TrainingExample) -> Result<TokenizedRecord> {
        let max_length = self.options.max_length;
        let encoding = self
            .tokenizer
            .encode(example.text.as_str(), self.options.add_special_tokens)
            .map_err(|e| FinetuneError::tokenization(format!("failed to encode text: {e}")))?;

        let mut input_ids = encoding.get_ids().to_vec();
        if input_ids.is_empty() {
            return Err(FinetuneError::tokenization("text encodes to zero tokens"));
        }
        if input_ids.len() > max_length {
            match self.options.truncation {
                TruncationPolicy::Truncate => input_ids.truncate(max_length),
                TruncationPolicy::Reject => {
                    return Err(FinetuneError::tokenization(format!(
                        "encoding has {} tokens, max_length is {max_length}",
                        input_ids.len()
                    )))
                }
            }
        }

        let real = input_ids.len();
        input_ids.resize(max_length, self.options.pad_id);

        let attention_mask: Vec<u32> = (0..max_length).map(|i| u32::from(i < real)).collect();
        let labels = input_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| match self.options.label_padding {
                LabelPadding::Ignore if i >= real => IGNORE_INDEX,
                _ => id as i64,
            })
            .collect();

        Ok(TokenizedRecord {
            input_ids,
            attention_mask,
            labels,
        })
    }

    /// Tokenize every example, stopping at the first failure
    pub fn tokenize_all(&self, examples: &[TrainingExample]) -> Result<TokenizedDataset> {
        let records = examples
            .iter()
            .enumerate()
            .map(|(index, example)| {
                self.tokenize(example).map_err(|e| match e {
                    FinetuneError::Tokenization(msg) => {
                        FinetuneError::tokenization(format!("example {index}: {msg}"))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let tokens: usize = records
            .iter()
            .map(|r| r.attention_mask.iter().filter(|&&m| m == 1).count())
            .sum();
        tracing::info!(
            records = records.len(),
            max_length = self.options.max_length,
            tokens,
            "tokenized dataset"
        );
        TokenizedDataset::new(records, self.options.max_length)
    }
}

#[cfg(test)]
pub(crate) mod test_tokenizer {
    use tokenizers::Tokenizer;

    /// Whitespace word-level tokenizer over a small fixed vocabulary
    pub fn word_level() -> Tokenizer {
        from_words(&[
            "[PAD]", "[UNK]", "User:", "Assistant:", "hello", "world", "how", "are", "you",
            "fine", "thanks", "what", "is", "two", "plus", "four", "<|user|>", "<|assistant|>",
            "<|end|>", "?", ",", ".", "!", "|", "<", ">",
        ])
    }

    /// Word-level tokenizer whose ids are the positions in `words`
    pub fn from_words(words: &[&str]) -> Tokenizer {
        let vocab = words
            .iter()
            .enumerate()
            .map(|(i, w)| format!("{:?}:{i}", w))
            .collect::<Vec<_>>()
            .join(",");
        let json = format!(
            r#"{{"version":"1.0","truncation":null,"padding":null,"added_tokens":[],"normalizer":null,"pre_tokenizer":{{"type":"WhitespaceSplit"}},"post_processor":null,"decoder":null,"model":{{"type":"WordLevel","vocab":{{{vocab}}},"unk_token":"[UNK]"}}}}"#
        );
        json.parse().expect("test tokenizer json is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetBuilder, PromptTemplate};

    fn examples(csv: &str) -> Vec<TrainingExample> {
        DatasetBuilder::new(PromptTemplate::Plain)
            .from_reader(csv.as_bytes())
            .unwrap()
    }

    fn adapter(max_length: usize, label_padding: LabelPadding) -> TokenizerAdapter {
        let options = TokenizeOptions {
            max_length,
            pad_id: 0,
            label_padding,
            ..Default::default()
        };
        TokenizerAdapter::new(test_tokenizer::word_level(), options).unwrap()
    }

    #[test]
    fn test_fixed_length_records() -> Result<()> {
        let data = examples("prompt,response\nhello,world\nhow are you,fine thanks\nwhat is two plus two,four\n");
        let dataset = adapter(128, LabelPadding::Ignore).tokenize_all(&data)?;

        assert_eq!(dataset.len(), 3);
        for record in dataset.iter() {
            assert_eq!(record.input_ids.len(), 128);
            assert_eq!(record.attention_mask.len(), 128);
            assert_eq!(record.labels.len(), 128);
        }
        Ok(())
    }

    #[test]
    fn test_padding_and_mask() -> Result<()> {
        let data = examples("prompt,response\nhello,world\n");
        let record = adapter(8, LabelPadding::Ignore).tokenize(&data[0])?;

        // "User: hello\nAssistant: world" -> 4 words
        assert_eq!(record.input_ids, vec![2, 4, 3, 5, 0, 0, 0, 0]);
        assert_eq!(record.attention_mask, vec![1, 1, 1, 1, 0, 0, 0, 0]);
        assert_eq!(record.labels[..4], [2, 4, 3, 5]);
        assert!(record.labels[4..].iter().all(|&l| l == IGNORE_INDEX));
        Ok(())
    }

    #[test]
    fn test_label_padding_copy() -> Result<()> {
        let data = examples("prompt,response\nhello,world\n");
        let record = adapter(6, LabelPadding::Copy).tokenize(&data[0])?;

        let expected: Vec<i64> = record.input_ids.iter().map(|&id| id as i64).collect();
        assert_eq!(record.labels, expected);
        Ok(())
    }

    #[test]
    fn test_truncate_and_reject() -> Result<()> {
        let data = examples("prompt,response\nhow are you,fine thanks\n");
        let record = adapter(3, LabelPadding::Ignore).tokenize(&data[0])?;
        assert_eq!(record.input_ids, vec![2, 6, 7]);
        assert_eq!(record.attention_mask, vec![1, 1, 1]);

        let strict = TokenizerAdapter::new(
            test_tokenizer::word_level(),
            TokenizeOptions {
                max_length: 3,
                truncation: TruncationPolicy::Reject,
                ..Default::default()
            },
        )?;
        assert!(matches!(strict.tokenize(&data[0]), Err(FinetuneError::Tokenization(_))));
        Ok(())
    }

    #[test]
    fn test_empty_encoding_rejected() -> Result<()> {
        let example = TrainingExample {
            prompt: String::new(),
            response: String::new(),
            text: "   ".to_string(),
        };
        assert!(matches!(
            adapter(4, LabelPadding::Ignore).tokenize(&example),
            Err(FinetuneError::Tokenization(_))
        ));
        Ok(())
    }

    #[test]
    fn test_resolve_pad_id() {
        let tokenizer = test_tokenizer::word_level();
        assert_eq!(TokenizerAdapter::resolve_pad_id(&tokenizer, "[PAD]").ok(), Some(0));
        assert!(TokenizerAdapter::resolve_pad_id(&tokenizer, "<pad>").is_err());
    }

    #[test]
    fn test_default_pad_id_falls_back_to_eos() {
        let tokenizer = test_tokenizer::from_words(&["[UNK]", "hello", "<|endoftext|>", "</s>"]);
        assert_eq!(TokenizerAdapter::default_pad_id(&tokenizer), 3);

        let tokenizer = test_tokenizer::from_words(&["[UNK]", "hello", "<|im_end|>"]);
        assert_eq!(TokenizerAdapter::default_pad_id(&tokenizer), 2);

        assert_eq!(TokenizerAdapter::default_pad_id(&test_tokenizer::word_level()), 0);
    }

    #[test]
    fn test_default_pad_id_prefers_configured_padding() {
        let mut tokenizer = test_tokenizer::from_words(&["[UNK]", "</s>", "[PAD]"]);
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            pad_id: 2,
            ..Default::default()
        }));
        assert_eq!(TokenizerAdapter::default_pad_id(&tokenizer), 2);
    }
}
