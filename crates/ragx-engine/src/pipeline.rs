//! Retrieval-augmented generation
//!
//! Retrieves passages with the [`RetrievalEngine`], assembles a prompt from
//! them and hands it to an [`LlmClient`]. Generation starts only after
//! retrieval has returned.

use crate::RetrievalEngine;
use ragx_core::{LlmClient, RagxError, Result, SearchResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

const SYSTEM_INSTRUCTION: &str = "You are a knowledgeable assistant. Answer the question using \
only the numbered passages in the context. If the context does not contain the answer, say that \
you could not find it.";

/// Answer with the passages it was grounded on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagAnswer {
    pub answer: String,

    /// Passages included in the prompt, in citation order
    pub sources: Vec<SearchResult>,

    pub processing_time_ms: u64,
}

/// Retrieval followed by generation
pub struct RagPipeline {
    engine: Arc<RetrievalEngine>,
    llm: Arc<dyn LlmClient>,
    max_context_chars: usize,
}

impl RagPipeline {
    pub fn new(
        engine: Arc<RetrievalEngine>,
        llm: Arc<dyn LlmClient>,
        max_context_chars: usize,
    ) -> Self {
        Self {
            engine,
            llm,
            max_context_chars,
        }
    }

    /// Answer a question from the top `top_k` passages
    pub async fn answer(&self, question: &str, top_k: usize) -> Result<RagAnswer> {
        let started = Instant::now();

        let results = self.engine.query(question, top_k).await?;
        let sources = fit_context(results, self.max_context_chars);

        let prompt = build_prompt(question, &sources);
        info!(
            passages = sources.len(),
            prompt_chars = prompt.len(),
            "Calling LLM"
        );

        let answer = self.llm.generate(&prompt).await?;
        if answer.trim().is_empty() {
            return Err(RagxError::Generation("empty answer".to_string()));
        }

        Ok(RagAnswer {
            answer,
            sources,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Keep passages in rank order until the character budget is spent
fn fit_context(results: Vec<SearchResult>, max_chars: usize) -> Vec<SearchResult> {
    let mut total = 0;
    results
        .into_iter()
        .take_while(|r| {
            total += r.content.len();
            total <= max_chars
        })
        .collect()
}

fn build_prompt(question: &str, sources: &[SearchResult]) -> String {
    let builder = sources
        .iter()
        .enumerate()
        .fold(PromptBuilder::new(), |builder, (i, source)| {
            builder.add_context(format!(
                "[{}] (document: {})\n{}",
                i + 1,
                source.document_id,
                source.content.trim()
            ))
        });

    builder
        .system(SYSTEM_INSTRUCTION)
        .question(question)
        .add_instruction("Use only information relevant to the question.")
        .add_instruction("Cite passages as [N].")
        .build()
}

// ============================================================================
// Prompt Builder
// ============================================================================

/// Builder for constructing RAG prompts
pub struct PromptBuilder {
    system_instruction: String,
    context_sections: Vec<String>,
    question: String,
    instructions: Vec<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            system_instruction: String::new(),
            context_sections: Vec::new(),
            question: String::new(),
            instructions: Vec::new(),
        }
    }

    pub fn system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Add a context section
    pub fn add_context(mut self, context: impl Into<String>) -> Self {
        self.context_sections.push(context.into());
        self
    }

    pub fn question(mut self, q: impl Into<String>) -> Self {
        self.question = q.into();
        self
    }

    pub fn add_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instructions.push(instruction.into());
        self
    }

    /// Build the final prompt
    pub fn build(self) -> String {
        let mut prompt = String::new();

        if !self.system_instruction.is_empty() {
            prompt.push_str("<system>\n");
            prompt.push_str(&self.system_instruction);
            prompt.push_str("\n</system>\n\n");
        }

        if !self.context_sections.is_empty() {
            prompt.push_str("<context>\n");
            for section in &self.context_sections {
                prompt.push_str(section);
                prompt.push_str("\n\n");
            }
            prompt.push_str("</context>\n\n");
        }

        if !self.question.is_empty() {
            prompt.push_str("<question>\n");
            prompt.push_str(&self.question);
            prompt.push_str("\n</question>\n\n");
        }

        if !self.instructions.is_empty() {
            prompt.push_str("<instructions>\n");
            for (i, inst) in self.instructions.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, inst));
            }
            prompt.push_str("</instructions>\n");
        }

        prompt
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
