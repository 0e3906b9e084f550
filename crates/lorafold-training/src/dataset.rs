//! Dataset loading: prompt/response table -> rendered training texts

use lorafold_core::{FinetuneError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

/// How a prompt/response pair is rendered into one training text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplate {
    /// `{prompt}\n\n{response}`
    #[default]
    Bare,
    /// `User: {prompt}\nAssistant: {response}`
    Plain,
    /// `<|user|>{prompt}<|end|>\n<|assistant|>{response}<|end|>`
    RoleDelimited,
}

impl PromptTemplate {
    pub fn render(&self, prompt: &str, response: &str) -> String {
        match self {
            PromptTemplate::Bare => format!("{prompt}\n\n{response}"),
            PromptTemplate::Plain => format!("User: {prompt}\nAssistant: {response}"),
            PromptTemplate::RoleDelimited => {
                format!("<|user|>{prompt}<|end|>\n<|assistant|>{response}<|end|>")
            }
        }
    }
}

impl std::str::FromStr for PromptTemplate {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bare" => Ok(PromptTemplate::Bare),
            "plain" => Ok(PromptTemplate::Plain),
            "role_delimited" | "role-delimited" => Ok(PromptTemplate::RoleDelimited),
            _ => Err(FinetuneError::config(format!(
                "unknown prompt template: {s}. Use: bare, plain, role_delimited"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub prompt: String,
    pub response: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct Row {
    prompt: Option<String>,
    response: Option<String>,
}

pub struct DatasetBuilder {
    template: PromptTemplate,
}

impl DatasetBuilder {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }

    pub fn from_path(&self, path: impl AsRef<Path>) -> Result<Vec<TrainingExample>> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| FinetuneError::data(format!("cannot open {}: {e}", path.display())))?;
        let examples = self.from_reader(file)?;
        tracing::info!(path = %path.display(), examples = examples.len(), "loaded dataset");
        Ok(examples)
    }

    /// Parse a quoted CSV with a header row holding `prompt` and `response`.
    /// Other columns are ignored.
    pub fn from_reader<R: Read>(&self, reader: R) -> Result<Vec<TrainingExample>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let headers = reader
            .headers()
            .map_err(|e| FinetuneError::data(format!("unreadable header row: {e}")))?
            .clone();
        for column in ["prompt", "response"] {
            if !headers.iter().any(|h| h == column) {
                return Err(FinetuneError::data(format!("missing required column '{column}'")));
            }
        }

        let mut examples = Vec::new();
        for (index, record) in reader.deserialize::<Row>().enumerate() {
            let row_number = index + 1;
            let row = record.map_err(|e| FinetuneError::data(format!("row {row_number}: {e}")))?;

            let prompt = required(row.prompt, "prompt", row_number)?;
            let response = required(row.response, "response", row_number)?;
            let text = self.template.render(&prompt, &response);
            examples.push(TrainingExample {
                prompt,
                response,
                text,
            });
        }

        Ok(examples)
    }
}

fn required(value: Option<String>, column: &str, row_number: usize) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(FinetuneError::data(format!(
            "row {row_number}: missing value for '{column}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(csv: &str) -> Result<Vec<TrainingExample>> {
        DatasetBuilder::new(PromptTemplate::Plain).from_reader(csv.as_bytes())
    }

    #[test]
    fn test_rows_in_order() -> Result<()> {
        let csv = "prompt,response\n\"Hi, there\",Hello\nWhat is 2+2?,4\nBye,\"See you\n soon\"\n";
        let examples = build(csv)?;

        assert_eq!(examples.len(), 3);
        assert_eq!(examples[0].prompt, "Hi, there");
        assert_eq!(examples[0].text, "User: Hi, there\nAssistant: Hello");
        assert_eq!(examples[1].response, "4");
        assert_eq!(examples[2].response, "See you\n soon");
        Ok(())
    }

    #[test]
    fn test_default_template_separates_with_blank_line() -> Result<()> {
        let examples = DatasetBuilder::new(PromptTemplate::default())
            .from_reader("prompt,response\nHi,Hello\n".as_bytes())?;
        assert_eq!(examples[0].text, "Hi\n\nHello");
        assert_eq!("bare".parse::<PromptTemplate>()?, PromptTemplate::Bare);
        Ok(())
    }

    #[test]
    fn test_padded_header_names() -> Result<()> {
        let examples = build(" prompt , response \na,b\n")?;
        assert_eq!(examples[0].prompt, "a");
        assert_eq!(examples[0].response, "b");
        Ok(())
    }

    #[test]
    fn test_role_delimited_template() {
        let text = PromptTemplate::RoleDelimited.render("q", "a");
        assert_eq!(text, "<|user|>q<|end|>\n<|assistant|>a<|end|>");
    }

    #[test]
    fn test_extra_columns_ignored() -> Result<()> {
        let examples = build("id,prompt,response\n1,a,b\n")?;
        assert_eq!(examples.len(), 1);
        assert_eq!(examples[0].prompt, "a");
        Ok(())
    }

    #[test]
    fn test_missing_column() {
        let err = build("prompt,answer\na,b\n").unwrap_err();
        assert!(matches!(err, FinetuneError::Data(_)));
        assert!(err.to_string().contains("response"));
    }

    #[test]
    fn test_blank_field_names_row() {
        let err = build("prompt,response\na,b\nc,  \n").unwrap_err();
        assert!(matches!(err, FinetuneError::Data(_)));
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn test_ragged_row() {
        let err = build("prompt,response\na,b\nc\n").unwrap_err();
        assert!(matches!(err, FinetuneError::Data(_)));
    }

    #[test]
    fn test_header_only_is_empty() -> Result<()> {
        assert!(build("prompt,response\n")?.is_empty());
        Ok(())
    }
}
