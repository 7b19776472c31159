//! Backend request payload construction for gridllm
//!
//! Pure payload building, no network I/O: given a model
//! configuration, the prompt and the system prompt, produce
//! the endpoint path and JSON body for one streaming request.

use serde::{Deserialize, Serialize};
use log::trace;

/// Nucleus sampling cutoff sent on every request
const TOP_P: f64 = 0.9;

/// One chat-protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage
{   pub role: String
  , pub content: String
}

/// Raw completion-protocol request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionPayload
{   pub model: String
  , pub prompt: String
  , pub max_tokens: usize
  , pub temperature: f64
  , pub top_p: f64
  , pub n: usize
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>
  , pub stream: bool
}

/// Chat-protocol request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload
{   pub model: String
  , pub messages: Vec<ChatMessage>
  , pub max_tokens: usize
  , pub temperature: f64
  , pub top_p: f64
  , pub n: usize
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>
  , pub stream: bool
}

/// Either protocol's body; serializes as the inner payload
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestPayload
{   Completion(CompletionPayload)
  , Chat(ChatPayload)
}

/// A fully built backend request
#[derive(Debug, Clone)]
pub struct BuiltRequest
{   /// Path under the API base, protocol-dependent
    pub path: &'static str
  , pub payload: RequestPayload
}

/// Build the streaming request for one model. Completion mode
/// (prompt template set) and chat mode (template None) are
/// mutually exclusive.
pub fn build_request(
  model: &crate::ModelConfig
, prompt: &str
, system_prompt: &str
, config: &crate::config::GridllmConfig
) -> BuiltRequest
{   let max_tokens = model.max_tokens
      .unwrap_or(config.max_tokens);
    let stop = if model.stop_at_period
    {   Some(vec![".".to_string()])
    } else
    {   None
    };

    let built = match &model.prompt_template
    {   Some(template) => {
          // Completion mode: one opaque prompt string
          let full_prompt = template
            .replace("{system}", system_prompt)
            .replace("{prompt}", prompt);
          BuiltRequest
          {   path: "v1/completions"
            , payload: RequestPayload::Completion(
                CompletionPayload
                {   model: model.model.clone()
                  , prompt: full_prompt
                  , max_tokens
                  , temperature: model.temperature
                  , top_p: TOP_P
                  , n: model.num_completions
                  , stop
                  , stream: true
                }
              )
          }
        }
      , None => {
          // Chat mode: structured system + user messages
          BuiltRequest
          {   path: "v1/chat/completions"
            , payload: RequestPayload::Chat(
                ChatPayload
                {   model: model.model.clone()
                  , messages: vec![
                      ChatMessage
                      {   role: "system".to_string()
                        , content: system_prompt.to_string()
                      }
                    , ChatMessage
                      {   role: "user".to_string()
                        , content: prompt.to_string()
                      }
                    ]
                  , max_tokens
                  , temperature: model.temperature
                  , top_p: TOP_P
                  , n: model.num_completions
                  , stop
                  , stream: true
                }
              )
          }
        }
    };

    trace!("Built request for {}: {:?}", model.id, built);
    built
}
