//! Instruction prompt templating.

use std::path::Path;

use minijinja::{context, Environment};

use crate::error::{InferError, InferResult};

/// Literal separating the rendered prompt from the model's answer.
pub const RESPONSE_MARKER: &str = "### Response:";

pub const DEFAULT_TEMPLATE: &str = "Below is an instruction that describes a task. \
Write a response that appropriately completes the request.\n\n\
### Instruction:\n\n{{ instruction }}\n\n### Response:\n\n";

/// Compiled prompt template. The only variable is `instruction`.
#[derive(Debug)]
pub struct PromptTemplate {
    env: Environment<'static>,
    source: String,
}

impl PromptTemplate {
    pub fn new(source: String) -> InferResult<Self> {
        if !source.contains(RESPONSE_MARKER) {
            return Err(InferError::config(format!(
                "prompt template must contain the response marker {RESPONSE_MARKER:?}"
            )));
        }
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        // Syntax check.
        env.template_from_str(&source)?;
        Ok(Self { env, source })
    }

    pub fn from_file(path: &Path) -> InferResult<Self> {
        Self::new(std::fs::read_to_string(path)?)
    }

    pub fn render(&self, instruction: &str) -> InferResult<String> {
        Ok(self.env.render_str(&self.source, context! { instruction })?)
    }

    /// Instruction and optional input are joined with a newline first.
    pub fn generate_prompt(&self, instruction: &str, input: Option<&str>) -> InferResult<PromptRecord> {
        let input = input.filter(|i| !i.is_empty());
        let joined = match input {
            Some(input) => format!("{instruction}\n{input}"),
            None => instruction.to_string(),
        };
        Ok(PromptRecord {
            instruction: instruction.to_string(),
            input: input.map(str::to_string),
            rendered: self.render(&joined)?,
        })
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        Self {
            env,
            source: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRecord {
    pub instruction: String,
    pub input: Option<String>,
    pub rendered: String,
}

/// Render with [`DEFAULT_TEMPLATE`].
pub fn generate_prompt(instruction: &str, input: Option<&str>) -> InferResult<String> {
    Ok(PromptTemplate::default()
        .generate_prompt(instruction, input)?
        .rendered)
}
