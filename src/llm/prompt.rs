use crate::llm::{AdapterError, AnalysisContext};

const REASONING_MODELS: &[&str] = &["deepseek-r1", "reasoner", "o1", "qwq"];

const SYSTEM_PROMPT: &str = "You are a MySQL performance engineer reviewing index usage \
and slow statements. Only reference tables, columns and indexes that appear in the \
provided schema. Never invent object names. Answer with a single JSON object that \
matches the response schema exactly.";

const RESPONSE_SCHEMA: &str = r#"{
  "recommendations": [
    {
      "category": "unused_index | redundant_index | missing_index | query_rewrite | configuration | advisory",
      "target": {
        "schema": "string (optional)",
        "table": "string",
        "index": "string (required for unused_index and redundant_index)",
        "columns": ["string"]
      },
      "rationale": "non-empty string explaining the evidence",
      "suggested_action": "string (optional): one SQL statement or a short note",
      "confidence": "number between 0 and 1",
      "severity": "low | medium | high | critical (optional)",
      "digests": ["digest ids this recommendation is based on (optional)"]
    }
  ]
}"#;

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    /// The model emits free-form reasoning before its answer, so the
    /// provider must not force a JSON-only response mode.
    pub expects_reasoning: bool,
}

impl Prompt {
    /// System and user text as one block, for providers without roles.
    pub fn combined(&self) -> String {
        format!("{}\n\n{}", self.system, self.user)
    }
}

pub fn is_reasoning_model(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    REASONING_MODELS.iter().any(|pattern| match *pattern {
        // Avoid matching names such as "gpt-4o1" or "foo1".
        "o1" => model == "o1" || model.starts_with("o1-") || model.contains("/o1"),
        other => model.contains(other),
    })
}

pub fn build(context: &AnalysisContext, model: &str) -> Result<Prompt, AdapterError> {
    let payload = serde_json::to_string_pretty(context)
        .map_err(|err| AdapterError::Backend(format!("failed to encode context: {err}")))?;
    let expects_reasoning = is_reasoning_model(model);

    let mut user = String::with_capacity(payload.len() + RESPONSE_SCHEMA.len() + 512);
    user.push_str(
        "Analyze the statement digests and schema below. Statement text has literals \
         replaced by `?`. Suggest indexes to add, indexes to drop, or query rewrites, \
         with one recommendation per target.\n\n",
    );
    user.push_str("Context:\n");
    user.push_str(&payload);
    user.push_str("\n\nResponse schema:\n");
    user.push_str(RESPONSE_SCHEMA);
    if expects_reasoning {
        user.push_str(
            "\n\nThink inside <think></think> tags first, then output only the JSON object.",
        );
    } else {
        user.push_str("\n\nOutput only the JSON object, without markdown.");
    }

    Ok(Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        expects_reasoning,
    })
}
