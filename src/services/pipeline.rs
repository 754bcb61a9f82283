// src/services/pipeline.rs

//! The question builder. Each delivery of a `ChunkJob` processes exactly one chunk of
//! a card set's source text and then either schedules the next chunk or marks the
//! set ready. Jobs arrive at least once; the `(card_set_id, chunk_start)` marker
//! written together with the questions makes repeated deliveries harmless.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    models::{card_set::CardSet, question::GeneratedQuestion},
    ports::{CompletionError, CompletionService, JobScheduler},
    services::chunking::{Chunk, ChunkIterator, next_chunk},
    store::{ProcessedChunk, RepoError, Repository},
    utils::html::clean_html,
};

pub const COMPLETION_FAILED: &str =
    "Question generation failed. Your tokens have been refunded; please try again later.";
pub const UNREADABLE_RESPONSE: &str =
    "The generated questions could not be read. Your tokens have been refunded; please try again later.";
pub const SCHEDULING_FAILED: &str =
    "Something went wrong. Your tokens have been refunded; please try again later.";

/// Body of a scheduled question builder message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkJob {
    pub card_set_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterator: Option<ChunkIterator>,
}

impl ChunkJob {
    pub fn first(card_set_id: &str) -> Self {
        Self {
            card_set_id: card_set_id.to_string(),
            iterator: None,
        }
    }
}

/// What one delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The next chunk was scheduled.
    Continued(ChunkIterator),
    /// Last chunk stored; the set is ready.
    Ready,
    /// The completion service was busy; the same job was scheduled again.
    Retrying,
    /// Another delivery of this chunk committed first. Nothing was written.
    Duplicate,
    /// The set was marked failed and its tokens released.
    Failed(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no such card set found")]
    NotFound,
    #[error("the card set cannot be processed at this time")]
    NotProcessable,
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// A completion that did not match `{d: [{q, o, a}], ic?}`.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("completion is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("question {index}: answer index {answer} is out of bounds for {options} options")]
    AnswerOutOfBounds {
        index: usize,
        answer: String,
        options: usize,
    },
}

/// A validated completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub questions: Vec<GeneratedQuestion>,
    /// Tail context for the following chunk, when the model supplied one.
    pub incomplete_chunk: Option<String>,
}

#[derive(Deserialize)]
struct RawGeneration {
    d: Vec<RawQuestion>,
    #[serde(default)]
    ic: Option<String>,
}

#[derive(Deserialize)]
struct RawQuestion {
    q: String,
    o: Vec<String>,
    a: serde_json::Number,
}

/// Validates a completion against the generation schema. Every answer index must be
/// a whole number inside its option list; anything else rejects the whole batch.
pub fn parse_generation(content: &str) -> Result<Generation, GenerationError> {
    let raw: RawGeneration = serde_json::from_str(content.trim())
        .map_err(|e| GenerationError::InvalidJson(e.to_string()))?;

    let questions = raw
        .d
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let answer = item
                .a
                .as_u64()
                .and_then(|a| usize::try_from(a).ok())
                .filter(|a| *a < item.o.len())
                .ok_or_else(|| GenerationError::AnswerOutOfBounds {
                    index,
                    answer: item.a.to_string(),
                    options: item.o.len(),
                })?;

            Ok(GeneratedQuestion {
                text: clean_html(&item.q),
                options: item.o.iter().map(|o| clean_html(o)).collect(),
                correct_index: answer,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Generation {
        questions,
        incomplete_chunk: raw.ic,
    })
}

/// Builds the instruction for one chunk. The material is wrapped in a tag unique to
/// this call so text inside the document cannot close it.
pub fn build_prompt(chunk: &Chunk, tag: &str) -> String {
    let partial_note = if chunk.has_more {
        "The learning material is too big to fit your context so only a chunk of it is provided."
    } else {
        ""
    };
    let context_field = if chunk.has_more {
        "ic: <The last 50 (fifty) words of the learning material>,"
    } else {
        ""
    };

    format!(
        r#"
Your task is to help a student learn by creating short tests
for them that will help them memorize and understand the topic.

Write at least 3 or at most 6 multiple choice questions for
the student based on the information provided in a part of the
learning material delimited by an XML tag <{tag}></{tag}>.

{partial_note}

Format the output as a minified RFC8259 compliant JSON response object
with data array that contains the questions as follows, no talking:

{{
  {context_field}
  d: [{{
    q: <contains the text of the question formatted as a markdown
        with at most 320 characters>
    o: <array of possible answers, formatted as a string of text using
        markdown, with 3 or 4 items. It must contain the correct answer>
    a: <is a number representing the index of the correct answer in
        the array of options>
  }}]
}}

Learning material: <{tag}>{text}</{tag}>
"#,
        text = chunk.text,
    )
}

fn random_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Everything a delivery needs, borrowed from `AppState`.
#[derive(Clone)]
pub struct Pipeline {
    pub repo: Arc<dyn Repository>,
    pub completion: Arc<dyn CompletionService>,
    pub scheduler: Arc<dyn JobScheduler>,
    /// Where chunk jobs are delivered.
    pub target_url: String,
    pub retry_delay: Duration,
}

impl Pipeline {
    /// Schedules the first chunk of a freshly prepared card set.
    pub async fn start(&self, card_set_id: &str) -> Result<(), crate::ports::SchedulerError> {
        self.publish(&ChunkJob::first(card_set_id), None).await
    }

    /// Handles one delivery of `job`.
    pub async fn process_chunk(&self, job: &ChunkJob) -> Result<ChunkOutcome, PipelineError> {
        // 1. Guard: the set must exist, have text and not have concluded
        let card_set = self
            .repo
            .find_card_set(&job.card_set_id)
            .await?
            .ok_or(PipelineError::NotFound)?;

        let source = match card_set.source_text.as_deref() {
            Some(text) if !card_set.is_terminal() => text,
            _ => return Err(PipelineError::NotProcessable),
        };

        // 2. Cut the chunk and look for an earlier commit of it
        let chunk = next_chunk(source, job.iterator.as_ref());
        // Chunk offsets are stored as INTEGER
        let chunk_start =
            i32::try_from(chunk.start).map_err(|_| PipelineError::NotProcessable)?;

        if let Some(done) = self.repo.find_processed_chunk(&card_set.id, chunk_start).await? {
            tracing::info!(
                card_set_id = %card_set.id,
                chunk_start,
                "Chunk already stored, resuming continuation"
            );
            return self.advance(&card_set, &chunk, done.next_context).await;
        }

        // 3. Ask the model
        let prompt = build_prompt(&chunk, &random_tag());
        let content = match self.completion.complete(&prompt).await {
            Ok(content) => content,
            Err(CompletionError::Overloaded) => {
                tracing::warn!(card_set_id = %card_set.id, "Completion service busy, retrying");
                return match self.publish(job, Some(self.retry_delay)).await {
                    Ok(()) => Ok(ChunkOutcome::Retrying),
                    Err(e) => {
                        tracing::error!(card_set_id = %card_set.id, "Failed to reschedule job: {}", e);
                        self.fail(&card_set, SCHEDULING_FAILED).await
                    }
                };
            }
            Err(CompletionError::Failed(e)) => {
                tracing::error!(card_set_id = %card_set.id, "Completion failed: {}", e);
                return self.fail(&card_set, COMPLETION_FAILED).await;
            }
        };

        // 4. Validate before anything is stored
        let generation = match parse_generation(&content) {
            Ok(generation) => generation,
            Err(e) => {
                tracing::error!(card_set_id = %card_set.id, "Rejected completion: {}", e);
                tracing::debug!("Completion text: {}", content);
                return self.fail(&card_set, UNREADABLE_RESPONSE).await;
            }
        };

        // 5. Store the batch together with its marker
        let next_context = chunk
            .has_more
            .then(|| generation.incomplete_chunk.clone().unwrap_or_default());

        let stored = self
            .repo
            .persist_chunk(
                ProcessedChunk {
                    card_set_id: card_set.id.clone(),
                    chunk_start,
                    next_context: next_context.clone(),
                },
                &generation.questions,
            )
            .await?;

        if !stored {
            tracing::warn!(
                card_set_id = %card_set.id,
                chunk_start,
                "Chunk was stored by a concurrent delivery"
            );
            return Ok(ChunkOutcome::Duplicate);
        }

        tracing::info!(
            card_set_id = %card_set.id,
            chunk_start,
            questions = generation.questions.len(),
            "Stored generated questions"
        );

        // 6. Continue or finish
        self.advance(&card_set, &chunk, next_context).await
    }

    async fn advance(
        &self,
        card_set: &CardSet,
        chunk: &Chunk,
        next_context: Option<String>,
    ) -> Result<ChunkOutcome, PipelineError> {
        if !chunk.has_more {
            self.repo.mark_ready(&card_set.id).await?;
            tracing::info!(card_set_id = %card_set.id, "Card set is ready");
            return Ok(ChunkOutcome::Ready);
        }

        let iterator = ChunkIterator {
            last_index: chunk.end,
            incomplete_chunk: next_context.unwrap_or_default(),
        };
        let job = ChunkJob {
            card_set_id: card_set.id.clone(),
            iterator: Some(iterator.clone()),
        };

        match self.publish(&job, None).await {
            Ok(()) => Ok(ChunkOutcome::Continued(iterator)),
            Err(e) => {
                tracing::error!(card_set_id = %card_set.id, "Failed to schedule next chunk: {}", e);
                self.fail(card_set, SCHEDULING_FAILED).await
            }
        }
    }

    async fn fail(
        &self,
        card_set: &CardSet,
        message: &'static str,
    ) -> Result<ChunkOutcome, PipelineError> {
        let released = self.repo.fail_card_set(&card_set.id, message).await?;
        tracing::warn!(
            card_set_id = %card_set.id,
            released,
            "Card set failed, tokens released"
        );
        Ok(ChunkOutcome::Failed(message))
    }

    async fn publish(
        &self,
        job: &ChunkJob,
        delay: Option<Duration>,
    ) -> Result<(), crate::ports::SchedulerError> {
        let body = serde_json::to_value(job)
            .map_err(|e| crate::ports::SchedulerError::Publish(e.to_string()))?;
        self.scheduler.publish(&self.target_url, body, delay).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_batch() {
        let content = r#"{"ic":"last words","d":[{"q":"Capital of France?","o":["Paris","Rome","Oslo"],"a":0},{"q":"2+2?","o":["3","4","5","6"],"a":1}]}"#;

        let generation = parse_generation(content).unwrap();

        assert_eq!(generation.questions.len(), 2);
        assert_eq!(generation.questions[1].correct_index, 1);
        assert_eq!(generation.questions[1].options.len(), 4);
        assert_eq!(generation.incomplete_chunk.as_deref(), Some("last words"));
    }

    #[test]
    fn context_is_optional() {
        let content = r#"{"d":[{"q":"Q","o":["a","b","c"],"a":2}]}"#;
        assert_eq!(parse_generation(content).unwrap().incomplete_chunk, None);
    }

    #[test]
    fn rejects_answer_out_of_bounds() {
        let content = r#"{"d":[{"q":"Q","o":["a","b","c"],"a":3}]}"#;

        let err = parse_generation(content).unwrap_err();

        assert!(matches!(err, GenerationError::AnswerOutOfBounds { index: 0, options: 3, .. }));
    }

    #[test]
    fn rejects_negative_and_fractional_answers() {
        assert!(parse_generation(r#"{"d":[{"q":"Q","o":["a","b"],"a":-1}]}"#).is_err());
        assert!(parse_generation(r#"{"d":[{"q":"Q","o":["a","b"],"a":0.5}]}"#).is_err());
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(matches!(
            parse_generation("Sure! Here are your questions."),
            Err(GenerationError::InvalidJson(_))
        ));
        assert!(parse_generation(r#"{"d":[{"q":"Q","o":"a","a":0}]}"#).is_err());
        assert!(parse_generation(r#"{"questions":[]}"#).is_err());
    }

    #[test]
    fn strips_markup_from_generated_text() {
        let content = r#"{"d":[{"q":"<script>alert(1)</script>What?","o":["<b>x</b>","y","z"],"a":0}]}"#;

        let question = &parse_generation(content).unwrap().questions[0];

        assert_eq!(question.text, "What?");
        assert_eq!(question.options[0], "x");
    }

    #[test]
    fn keeps_comparisons_and_ampersands_literal() {
        let content = r#"{"d":[{"q":"Is 2 < 3 & 4 > 1?","o":["AT&T","b","c"],"a":0}]}"#;

        let question = &parse_generation(content).unwrap().questions[0];

        assert_eq!(question.text, "Is 2 < 3 & 4 > 1?");
        assert_eq!(question.options[0], "AT&T");
    }

    #[test]
    fn prompt_wraps_material_in_tag() {
        let chunk = Chunk {
            text: "Photosynthesis converts light".to_string(),
            start: 0,
            end: 6144,
            has_more: true,
        };

        let prompt = build_prompt(&chunk, "k3j9x0ab");

        assert!(prompt.contains("<k3j9x0ab>Photosynthesis converts light</k3j9x0ab>"));
        assert!(prompt.contains("ic: <The last 50 (fifty) words"));
    }

    #[test]
    fn last_chunk_prompt_does_not_ask_for_context() {
        let chunk = Chunk {
            text: "short".to_string(),
            start: 0,
            end: 6144,
            has_more: false,
        };

        assert!(!build_prompt(&chunk, "tag").contains("ic:"));
    }

    #[test]
    fn tags_differ_between_calls() {
        let a = random_tag();
        assert_eq!(a.len(), 8);
        assert_ne!(a, random_tag());
    }

    #[test]
    fn job_without_iterator_omits_it() {
        let value = serde_json::to_value(ChunkJob::first("abc")).unwrap();
        assert_eq!(value, serde_json::json!({ "cardSetId": "abc" }));
    }
}
