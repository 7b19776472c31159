pub mod error;
pub mod config;
pub mod request;
pub mod decode;
pub mod stream;
pub mod merge;
pub mod session;
use serde::{Deserialize, Serialize};

/*

gridllm (Grid of LLMs) is an async-only rust library that fans
one prompt out to N independently configured OpenAI-compatible
model backends, streams every backend's token deltas into a
shared fixed-size suggestion grid, and lets a newer generation
session cancel and supersede an older one mid-flight.

gridllm/
├── Cargo.toml          # Main manifest
├── src/
│   ├── lib.rs          # Re-exports, engine API, core structures
│   ├── error.rs        # Custom error types and handling
│   ├── config.rs       # Engine configuration + grid validation
│   ├── request.rs      # Backend payload construction
│   ├── decode.rs       # SSE wire decoder state machine
│   ├── stream.rs       # Per-model stream adapter
│   ├── merge.rs        # Fan-out merge engine
│   └── session.rs      # Generation session controller
└── tests/              # Integration and unit tests

*/

/// GRIDLLM API INTERFACE:

// ===== StartGeneration =====

pub type StartGenerationReply
  = Result<u64, crate::error::Error>;
pub type StartGenerationReplySender
  = tokio::sync::mpsc::UnboundedSender<StartGenerationReply>;

pub struct StartGenerationArgs
{   pub prompt: String
  , pub reply: StartGenerationReplySender
}

// ===== CancelGeneration =====

pub type CancelGenerationReply
  = Result<(), crate::error::Error>;
pub type CancelGenerationReplySender
  = tokio::sync::mpsc::UnboundedSender<CancelGenerationReply>;

pub struct CancelGenerationArgs
{   pub reply: CancelGenerationReplySender
}

// ===== SetModelConfigs =====

pub type SetModelConfigsReply
  = Result<(), crate::error::Error>;
pub type SetModelConfigsReplySender
  = tokio::sync::mpsc::UnboundedSender<SetModelConfigsReply>;

pub struct SetModelConfigsArgs
{   pub models: Vec<ModelConfig>
  , pub reply: SetModelConfigsReplySender
}

// ===== SetSystemConfig =====

pub type SetSystemConfigReply
  = Result<(), crate::error::Error>;
pub type SetSystemConfigReplySender
  = tokio::sync::mpsc::UnboundedSender<SetSystemConfigReply>;

pub struct SetSystemConfigArgs
{   pub config: SystemConfig
  , pub reply: SetSystemConfigReplySender
}

// ===== MarkInserted =====

pub type MarkInsertedReply
  = Result<(), crate::error::Error>;
pub type MarkInsertedReplySender
  = tokio::sync::mpsc::UnboundedSender<MarkInsertedReply>;

pub struct MarkInsertedArgs
{   pub slot_index: usize
  , pub reply: MarkInsertedReplySender
}

// ===== GetGridSnapshot =====

pub type GetGridSnapshotReply
  = Result<GridSnapshot, crate::error::Error>;
pub type GetGridSnapshotReplySender
  = tokio::sync::mpsc::UnboundedSender<GetGridSnapshotReply>;

pub struct GetGridSnapshotArgs
{   pub reply: GetGridSnapshotReplySender
}

// ===== GetAvailableModels =====

pub type GetAvailableModelsReply
  = Result<Vec<ModelInfo>, crate::error::Error>;
pub type GetAvailableModelsReplySender
  = tokio::sync::mpsc::UnboundedSender<GetAvailableModelsReply>;

pub struct GetAvailableModelsArgs
{   pub reply: GetAvailableModelsReplySender
}

// ===== KillEngine =====

pub type KillEngineReply = Result<(), crate::error::Error>;
pub type KillEngineReplySender
  = tokio::sync::mpsc::UnboundedSender<KillEngineReply>;

pub struct KillEngineArgs
{   pub reply: KillEngineReplySender
}

// ===== GridllmHand (sender side) =====

pub struct GridllmHand
{   pub start_generation_tx
      : tokio::sync::mpsc::UnboundedSender<StartGenerationArgs>
  , pub cancel_generation_tx
      : tokio::sync::mpsc::UnboundedSender<CancelGenerationArgs>
  , pub set_model_configs_tx
      : tokio::sync::mpsc::UnboundedSender<SetModelConfigsArgs>
  , pub set_system_config_tx
      : tokio::sync::mpsc::UnboundedSender<SetSystemConfigArgs>
  , pub mark_inserted_tx
      : tokio::sync::mpsc::UnboundedSender<MarkInsertedArgs>
  , pub get_grid_snapshot_tx
      : tokio::sync::mpsc::UnboundedSender<GetGridSnapshotArgs>
  , pub get_available_models_tx
      : tokio::sync::mpsc::UnboundedSender
        <GetAvailableModelsArgs>
  , pub kill_engine_tx
      : tokio::sync::mpsc::UnboundedSender<KillEngineArgs>
}

// ===== GridllmFoot (receiver side) =====

pub struct GridllmFoot
{   pub start_generation_rx
      : tokio::sync::mpsc::UnboundedReceiver<StartGenerationArgs>
  , pub cancel_generation_rx
      : tokio::sync::mpsc::UnboundedReceiver<CancelGenerationArgs>
  , pub set_model_configs_rx
      : tokio::sync::mpsc::UnboundedReceiver<SetModelConfigsArgs>
  , pub set_system_config_rx
      : tokio::sync::mpsc::UnboundedReceiver<SetSystemConfigArgs>
  , pub mark_inserted_rx
      : tokio::sync::mpsc::UnboundedReceiver<MarkInsertedArgs>
  , pub get_grid_snapshot_rx
      : tokio::sync::mpsc::UnboundedReceiver<GetGridSnapshotArgs>
  , pub get_available_models_rx
      : tokio::sync::mpsc::UnboundedReceiver
        <GetAvailableModelsArgs>
  , pub kill_engine_rx
      : tokio::sync::mpsc::UnboundedReceiver<KillEngineArgs>
}

/// GRIDLLM STRUCTURES:

/// One configured backend participant in the grid.
/// Field names serialize camelCase to match the shapes the
/// settings store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig
{   /// Stable identity keying statuses and errors.
    /// Distinct from `model`, the wire-level model name.
    pub id: String
  , /// Backend model identifier sent on the wire
    pub model: String
  , /// None selects chat mode; Some(template) selects raw
    /// completion mode, with `{system}` and `{prompt}`
    /// substituted into the template
    #[serde(default)]
    pub prompt_template: Option<String>
  , /// Sampling temperature
    pub temperature: f64
  , /// Request `stop: ["."]` so completions end at a sentence
    pub stop_at_period: bool
  , /// Parallel completions this model must produce
    pub num_completions: usize
  , /// First absolute slot owned by this model; it exclusively
    /// owns [grid_offset, grid_offset + num_completions)
    pub grid_offset: usize
  , /// Per-model max_tokens override
    #[serde(default)]
    pub max_tokens: Option<usize>
  , /// Display color for the UI; ignored by the engine
    pub color: String
}

/// One entry in the backend's model catalog, as returned by
/// its `v1/models` listing endpoint. Field names follow the
/// wire format, which is snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo
{   pub id: String
  , #[serde(default)]
    pub created: u64
  , #[serde(default)]
    pub owned_by: String
}

/// Grid dimensions and shared context text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig
{   pub grid_rows: usize
  , pub grid_columns: usize
  , pub system_prompt: String
}

impl SystemConfig
{   /// Total slot capacity of the grid
    pub fn capacity(&self) -> usize
    {   self.grid_rows * self.grid_columns
    }
}

/// Per-model generation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq,
         Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelStatus
{   Idle
  , Waiting
  , Running
  , Error
}

/// One addressable position in the suggestion grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion
{   /// Accumulated text; append-only within a session
    pub text: Option<String>
  , /// The UI has already consumed this slot into the document
    pub inserted: bool
  , /// Model that owns the slot's text
    pub model_id: Option<String>
}

impl Default for Suggestion
{   fn default() -> Self
    {   Suggestion
        {   text: None
          , inserted: false
          , model_id: None
        }
    }
}

/// One normalized event from a backend stream: a token
/// increment or a completion marker addressed to an absolute
/// grid slot. The exchange currency between stream adapters,
/// the merge engine and the session controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionUpdate
{   pub model_id: String
  , /// Absolute slot index, already offset-adjusted
    pub slot_index: usize
  , /// Token increment, never a full replacement
    pub text: String
  , pub is_complete: bool
  , #[serde(default,
            skip_serializing_if = "Option::is_none")]
    pub error: Option<String>
}

/// Read model handed to the UI: the slot grid plus per-model
/// status and error maps.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSnapshot
{   pub suggestions: Vec<Suggestion>
  , pub statuses
      : std::collections::HashMap<String, ModelStatus>
  , pub errors
      : std::collections::HashMap<String, String>
  , /// Monotonically increasing generation epoch; bumped by
    /// starts, cancels and reconfiguration. 0 at creation.
    pub session_id: u64
}
