//! Interactive and batch sessions on top of a [`GenerationPipeline`].

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RunConfig;
use crate::error::{InferError, InferResult};
use crate::generation::{BackendKind, DirectPipeline, GenerationConfig, GenerationPipeline};
use crate::loader::ModelLoader;
use crate::patches::PatchSet;
use crate::prompt::{PromptTemplate, RESPONSE_MARKER};
use crate::serving::ServingPipeline;
use crate::utils::select_devices;

/// Instructions used when no data file is given.
pub const SAMPLE_DATA: &[&str] = &["为什么要减少污染，保护环境？"];

/// Examples echoed before a batch run.
const PREVIEW_LEN: usize = 10;

pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(rename = "Input")]
    pub input: String,
    #[serde(rename = "Output")]
    pub output: String,
}

/// One instruction per line, each trimmed. Blank lines are kept.
pub fn load_examples(data_file: Option<&Path>) -> InferResult<Vec<String>> {
    match data_file {
        Some(path) => Ok(std::fs::read_to_string(path)?
            .lines()
            .map(|l| l.trim().to_string())
            .collect()),
        None => Ok(SAMPLE_DATA.iter().map(|s| s.to_string()).collect()),
    }
}

/// Directory that receives the predictions and the generation config.
pub fn output_dir(predictions_file: &Path) -> PathBuf {
    match predictions_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Write `records` to `predictions_file` and `effective_config` next to it.
pub fn write_predictions(
    predictions_file: &Path,
    records: &[ResultRecord],
    effective_config: &serde_json::Value,
) -> InferResult<()> {
    let dir = output_dir(predictions_file);
    std::fs::create_dir_all(&dir)?;

    let mut writer = BufWriter::new(File::create(predictions_file)?);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.flush()?;

    let mut writer = BufWriter::new(File::create(dir.join(GENERATION_CONFIG_FILE))?);
    serde_json::to_writer_pretty(&mut writer, effective_config)?;
    writer.flush()?;

    info!(
        predictions = %predictions_file.display(),
        records = records.len(),
        "predictions written"
    );
    Ok(())
}

pub struct SessionDriver<'a, R, W> {
    pipeline: &'a mut dyn GenerationPipeline,
    template: Option<PromptTemplate>,
    generation: GenerationConfig,
    reader: R,
    writer: W,
}

impl<'a, R: BufRead, W: Write> SessionDriver<'a, R, W> {
    pub fn new(
        pipeline: &'a mut dyn GenerationPipeline,
        template: Option<PromptTemplate>,
        generation: GenerationConfig,
        reader: R,
        writer: W,
    ) -> Self {
        Self {
            pipeline,
            template,
            generation,
            reader,
            writer,
        }
    }

    fn render(&self, raw: &str) -> InferResult<String> {
        match self.template {
            Some(ref template) => Ok(template.generate_prompt(raw, None)?.rendered),
            None => Ok(raw.to_string()),
        }
    }

    /// Single-turn loop; ends on a blank line or end of input.
    pub fn run_interactive(&mut self) -> InferResult<()> {
        let rule = "=".repeat(85);
        writeln!(self.writer, "Start inference with instruction mode.")?;
        writeln!(self.writer, "{rule}")?;
        writeln!(
            self.writer,
            "+ 该模式下仅支持单轮问答，无多轮对话能力。\n\
             + 如要进行多轮对话，请使用llama.cpp或llamachat工具。"
        )?;
        writeln!(self.writer, "{}", "-".repeat(85))?;
        writeln!(
            self.writer,
            "+ This mode only supports single-turn QA.\n\
             + If you want to experience multi-turn dialogue, please use llama.cpp or llamachat."
        )?;
        writeln!(self.writer, "{rule}")?;

        let mut line = String::new();
        loop {
            write!(self.writer, "Input:")?;
            self.writer.flush()?;

            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                break;
            }
            let raw = line.trim_end_matches(['\n', '\r']);
            if raw.trim().is_empty() {
                break;
            }

            let text = self.render(raw)?;
            let outputs = self.pipeline.generate(&[text], &self.generation)?;
            let response = outputs.into_iter().next().unwrap_or_default();
            writeln!(self.writer, "Response:  {response}\n")?;
        }
        Ok(())
    }

    /// Generate for every example, print each result and persist them in
    /// input order.
    pub fn run_batch(&mut self, examples: &[String], predictions_file: &Path) -> InferResult<Vec<ResultRecord>> {
        writeln!(self.writer, "Start inference.")?;
        let texts = examples
            .iter()
            .map(|e| self.render(e))
            .collect::<InferResult<Vec<_>>>()?;
        let outputs = self.pipeline.generate(&texts, &self.generation)?;
        if outputs.len() != examples.len() {
            return Err(InferError::Engine(format!(
                "expected {} outputs, got {}",
                examples.len(),
                outputs.len()
            )));
        }

        let mut records = Vec::with_capacity(examples.len());
        for (index, (example, output)) in examples.iter().zip(outputs).enumerate() {
            writeln!(self.writer, "======={index}=======")?;
            writeln!(self.writer, "Input: {example}\n")?;
            writeln!(self.writer, "Output: {output}\n")?;
            records.push(ResultRecord {
                input: example.clone(),
                output,
            });
        }

        let effective = self.pipeline.effective_config(&self.generation);
        write_predictions(predictions_file, &records, &effective)?;
        Ok(records)
    }

    pub fn preview_examples(&mut self, examples: &[String]) -> InferResult<()> {
        writeln!(self.writer, "first {PREVIEW_LEN} examples:")?;
        for example in examples.iter().take(PREVIEW_LEN) {
            writeln!(self.writer, "{example}")?;
        }
        Ok(())
    }
}

/// Build everything described by `config` and run the session on stdin/stdout.
pub fn run(config: RunConfig) -> InferResult<()> {
    let examples = if config.interactive {
        Vec::new()
    } else {
        load_examples(config.data_file.as_deref())?
    };

    let devices = select_devices(
        &config.gpus,
        config.only_cpu,
        config.backend == BackendKind::Serving,
    )?;
    let first_device = devices
        .first()
        .ok_or_else(|| InferError::config("no device selected"))?;

    let mut patches = PatchSet::new();
    patches
        .apply_attention_patch(config.memory_efficient_attention, first_device)
        .apply_ntk_scaling_patch(config.alpha);

    let loader = ModelLoader::prepare(config.loader.clone(), patches)?;

    let mut pipeline: Box<dyn GenerationPipeline> = match config.backend {
        BackendKind::Direct => {
            let marker = config.template.as_ref().map(|_| RESPONSE_MARKER.to_string());
            Box::new(DirectPipeline::new(loader.load(first_device)?, marker))
        }
        BackendKind::Serving => {
            let handles = devices
                .iter()
                .map(|d| loader.load(d))
                .collect::<InferResult<Vec<_>>>()?;
            Box::new(ServingPipeline::new(handles, config.serving)?)
        }
    };
    info!(backend = %pipeline.backend(), "generation pipeline ready");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut driver = SessionDriver::new(
        pipeline.as_mut(),
        config.template,
        config.generation,
        stdin.lock(),
        stdout.lock(),
    );

    if config.interactive {
        driver.run_interactive()
    } else {
        if config.data_file.is_some() {
            driver.preview_examples(&examples)?;
        }
        driver.run_batch(&examples, &config.predictions_file)?;
        Ok(())
    }
}
