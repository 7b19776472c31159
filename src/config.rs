//! Configuration for the gridllm engine and grid validation

use serde::{Deserialize, Serialize};
use log::debug;

/// Terminal text appended to a slot when a backend signals
/// `finish_reason: "stop"`. Backends disagree on whether the
/// consumed stop sequence is reported back, so the policy is
/// configurable rather than hard-coded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopTextPolicy
{   /// Append the backend's `stop_reason` when present,
    /// falling back to the given text
    BackendOrDefault(String)
  , /// Never append terminal text on stop
    Nothing
}

impl Default for StopTextPolicy
{   fn default() -> Self
    {   StopTextPolicy::BackendOrDefault(".".to_string())
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridllmConfig
{   /// Base URL of the OpenAI-compatible backend
    pub api_base: String
  , /// Bearer token, if the backend requires one
    pub api_key: Option<String>
  , /// Default max_tokens when a model has no override
    pub max_tokens: usize
  , /// Terminal-character policy on explicit stop
    pub stop_text: StopTextPolicy
}

impl Default for GridllmConfig
{   fn default() -> Self
    {   GridllmConfig
        {   api_base: "http://localhost:3333".to_string()
          , api_key: None
          , max_tokens: 50
          , stop_text: StopTextPolicy::default()
        }
    }
}

/// Validate that every model's owned slot range
/// [grid_offset, grid_offset + num_completions) fits the grid
/// and that no two models overlap. Must pass before a session
/// is allowed to issue any request.
pub fn validate_grid(
  models: &[crate::ModelConfig]
, capacity: usize
) -> Result<(), crate::error::Error>
{   debug!(
      "Validating {} models against capacity {}",
      models.len(), capacity
    );

    for model in models
    {   if model.num_completions == 0
        {   return Err(
              crate::error::Error::InvalidConfiguration(
                format!(
                  "Model {} requests zero completions",
                  model.id
                )
              )
            );
        }

        // checked: configs come from untrusted persisted
        // settings, so the offset may be absurd
        let end = match model.grid_offset
          .checked_add(model.num_completions)
        {   Some(end) => end
          , None => {
              return Err(
                crate::error::Error::InvalidConfiguration(
                  format!(
                    "Model {} slot range overflows at \
                     offset {}",
                    model.id, model.grid_offset
                  )
                )
              );
            }
        };
        if end > capacity
        {   return Err(
              crate::error::Error::InvalidConfiguration(
                format!(
                  "Model {} owns slots {}..{} but grid \
                   capacity is {}",
                  model.id, model.grid_offset, end, capacity
                )
              )
            );
        }
    }

    for (i, a) in models.iter().enumerate()
    {   for b in &models[i + 1..]
        {   let a_end = a.grid_offset + a.num_completions;
            let b_end = b.grid_offset + b.num_completions;
            if a.grid_offset < b_end && b.grid_offset < a_end
            {   return Err(
                  crate::error::Error::InvalidConfiguration(
                    format!(
                      "Models {} and {} own overlapping \
                       slot ranges",
                      a.id, b.id
                    )
                  )
                );
            }
        }
    }

    Ok(())
}
