use std::collections::HashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use futures::StreamExt;
use log::{debug, trace, warn, error, info};
use crate::GridllmFoot;
use crate::{ModelStatus, Suggestion, CompletionUpdate};

/// Update as forwarded by a session's merge-consumer task,
/// tagged with the epoch that produced it
type TaggedUpdate = (u64, CompletionUpdate);

/// Listing-endpoint envelope; the catalog rides in `data`
#[derive(Debug, Deserialize)]
struct ModelCatalog
{   #[serde(default)]
    data: Vec<crate::ModelInfo>
}

/// GET the backend's model catalog from `{api_base}/v1/models`
async fn fetch_available_models(
  config: crate::config::GridllmConfig
, client: reqwest::Client
) -> Result<Vec<crate::ModelInfo>, crate::error::Error>
{   let url = format!(
      "{}/v1/models",
      config.api_base.trim_end_matches('/')
    );
    let mut req = client.get(&url);
    if let Some(key) = &config.api_key
    {   req = req.header(
          "Authorization",
          format!("Bearer {}", key)
        );
    }

    let response = req.send().await.map_err(|e| {
      error!("Error fetching models: {}", e);
      crate::error::Error::HttpError(e.to_string())
    })?;

    let status = response.status();
    if !status.is_success()
    {   error!("Error fetching models: {}", status);
        return Err(crate::error::Error::HttpError(
          format!("HTTP error! status: {}", status.as_u16())
        ));
    }

    let catalog: ModelCatalog
      = response.json().await.map_err(|e| {
        error!("Error parsing model catalog: {}", e);
        crate::error::Error::ParseError(e.to_string())
      })?;
    debug!("Fetched {} models", catalog.data.len());
    Ok(catalog.data)
}

/// Controller state for the suggestion grid and the current
/// generation session. Mutated only by the engine loop, one
/// update at a time, so no locking is needed even though
/// updates originate from logically concurrent streams.
pub struct GridllmEngineState
{   pub config: crate::config::GridllmConfig
  , pub system: crate::SystemConfig
  , pub models: Vec<crate::ModelConfig>
  , pub suggestions: Vec<Suggestion>
  , pub statuses: HashMap<String, ModelStatus>
  , pub errors: HashMap<String, String>
  , /// Terminal flag per slot; a completed slot ignores
    /// every further update
    slot_complete: Vec<bool>
  , /// Monotonically increasing epoch. Bumped by generation
    /// starts, cancels and reconfiguration; updates tagged
    /// with a stale epoch are discarded, which is what makes
    /// supersession race-free (an abort is not instantaneous)
    epoch: u64
  , /// Cancellation token of the active session, if any
    cancel: Option<CancellationToken>
  , http: reqwest::Client
}

impl GridllmEngineState
{   /// Create controller state with an empty grid
    pub fn new(
      config: crate::config::GridllmConfig
    , system: crate::SystemConfig
    , models: Vec<crate::ModelConfig>
    ) -> Self
    {   debug!("Initializing GridllmEngineState");
        let capacity = system.capacity();
        GridllmEngineState
        {   config
          , system
          , models
          , suggestions: vec![
              Suggestion::default(); capacity
            ]
          , statuses: HashMap::new()
          , errors: HashMap::new()
          , slot_complete: vec![false; capacity]
          , epoch: 0
          , cancel: None
          , http: reqwest::Client::new()
        }
    }

    fn reset_grid(&mut self)
    {   let capacity = self.system.capacity();
        self.suggestions
          = vec![Suggestion::default(); capacity];
        self.slot_complete = vec![false; capacity];
        self.statuses.clear();
        self.errors.clear();
    }

    fn set_model_status(
      &mut self
    , model_id: &str
    , status: ModelStatus
    )
    {   self.statuses
          .insert(model_id.to_string(), status);
        if status != ModelStatus::Error
        {   self.errors.remove(model_id);
        }
    }

    fn set_model_error(
      &mut self
    , model_id: &str
    , message: String
    )
    {   self.errors
          .insert(model_id.to_string(), message);
        self.statuses
          .insert(model_id.to_string(), ModelStatus::Error);
    }

    /// Cancel the active session's token, if any. Idempotent.
    fn cancel_active(&mut self)
    {   if let Some(token) = self.cancel.take()
        {   debug!("Cancelling session {}", self.epoch);
            token.cancel();
        }
    }

    fn handle_start_generation(
      &mut self
    , prompt: String
    , update_tx: &mpsc::UnboundedSender<TaggedUpdate>
    ) -> Result<u64, crate::error::Error>
    {   if self.models.is_empty()
        {   error!("Generation requested with no models");
            return Err(
              crate::error::Error::NoModelsConfigured
            );
        }
        crate::config::validate_grid(
          &self.models
        , self.system.capacity()
        )?;

        // Supersede whatever is in flight
        self.cancel_active();
        self.epoch += 1;
        self.reset_grid();
        let model_ids: Vec<String> = self.models
          .iter()
          .map(|m| m.id.clone())
          .collect();
        for id in &model_ids
        {   self.set_model_status(id, ModelStatus::Waiting);
        }

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());

        let session_id = self.epoch;
        let models = self.models.clone();
        let system_prompt
          = self.system.system_prompt.clone();
        let config = self.config.clone();
        let client = self.http.clone();
        let update_tx = update_tx.clone();

        debug!(
          "Starting session {} with {} models",
          session_id, models.len()
        );

        tokio::spawn(async move {
          let updates
            = crate::merge::generate_completions(
                models
              , prompt
              , system_prompt
              , config
              , client
              , token
              );
          tokio::pin!(updates);
          while let Some(update) = updates.next().await
          {   if update_tx
                .send((session_id, update))
                .is_err()
              {   break;
              }
          }
          debug!("Session {} drained", session_id);
        });

        Ok(session_id)
    }

    fn handle_cancel_generation(&mut self)
      -> Result<(), crate::error::Error>
    {   self.cancel_active();
        // Invalidate anything still in flight or queued
        self.epoch += 1;
        let waiting: Vec<String> = self.statuses
          .iter()
          .filter(|(_, s)| {
            **s == ModelStatus::Waiting
              || **s == ModelStatus::Running
          })
          .map(|(id, _)| id.clone())
          .collect();
        for id in waiting
        {   self.set_model_status(&id, ModelStatus::Idle);
        }
        Ok(())
    }

    fn handle_set_model_configs(
      &mut self
    , models: Vec<crate::ModelConfig>
    ) -> Result<(), crate::error::Error>
    {   crate::config::validate_grid(
          &models
        , self.system.capacity()
        )?;
        debug!("Replacing {} model configs", models.len());
        self.cancel_active();
        self.epoch += 1;
        self.models = models;
        self.statuses.clear();
        self.errors.clear();
        Ok(())
    }

    fn handle_set_system_config(
      &mut self
    , system: crate::SystemConfig
    ) -> Result<(), crate::error::Error>
    {   crate::config::validate_grid(
          &self.models
        , system.capacity()
        )?;
        debug!(
          "Resizing grid to {}x{}",
          system.grid_rows, system.grid_columns
        );
        self.cancel_active();
        self.epoch += 1;
        self.system = system;
        let capacity = self.system.capacity();
        self.suggestions
          = vec![Suggestion::default(); capacity];
        self.slot_complete = vec![false; capacity];
        Ok(())
    }

    fn handle_mark_inserted(
      &mut self
    , slot_index: usize
    ) -> Result<(), crate::error::Error>
    {   match self.suggestions.get_mut(slot_index)
        {   Some(slot) => {
              slot.inserted = true;
              Ok(())
            }
          , None => {
              Err(crate::error::Error::SlotOutOfRange(
                slot_index
              ))
            }
        }
    }

    /// Fetch the backend's model catalog on a spawned task so
    /// the engine loop never blocks on the network; the task
    /// replies directly to the caller
    fn handle_get_available_models(
      &self
    , reply: crate::GetAvailableModelsReplySender
    )
    {   let config = self.config.clone();
        let client = self.http.clone();
        tokio::spawn(async move {
          let result
            = fetch_available_models(config, client).await;
          let _ = reply.send(result);
        });
    }

    fn snapshot(&self) -> crate::GridSnapshot
    {   crate::GridSnapshot
        {   suggestions: self.suggestions.clone()
          , statuses: self.statuses.clone()
          , errors: self.errors.clone()
          , session_id: self.epoch
        }
    }

    /// Apply one merged update to the grid. Updates from a
    /// superseded epoch, unknown model ids, out-of-grid slots
    /// and already-terminal slots are all dropped here.
    fn apply_update(
      &mut self
    , session_id: u64
    , update: CompletionUpdate
    )
    {   if session_id != self.epoch
        {   trace!(
              "Dropping update from superseded session {}",
              session_id
            );
            return;
        }

        if !self.models.iter()
          .any(|m| m.id == update.model_id)
        {   warn!(
              "Update for unknown model id: {}",
              update.model_id
            );
            return;
        }

        if let Some(message) = update.error
        {   error!(
              "Model {} failed: {}",
              update.model_id, message
            );
            self.set_model_error(&update.model_id, message);
            return;
        }

        if update.slot_index >= self.suggestions.len()
        {   warn!(
              "Update for slot {} outside grid",
              update.slot_index
            );
            return;
        }
        if self.slot_complete[update.slot_index]
        {   return;
        }

        trace!(
          "Slot {} += {:?} (complete: {})",
          update.slot_index, update.text,
          update.is_complete
        );

        let slot
          = &mut self.suggestions[update.slot_index];
        let mut text = slot.text.take().unwrap_or_default();
        text.push_str(&update.text);
        slot.text = Some(text);
        slot.model_id = Some(update.model_id.clone());

        if update.is_complete
        {   self.slot_complete[update.slot_index] = true;
        }

        let status = if update.is_complete
        {   ModelStatus::Idle
        } else
        {   ModelStatus::Running
        };
        self.set_model_status(&update.model_id, status);
    }
}

/// Public API for the gridllm engine - owns the task
pub struct GridllmEngine
{   hand: crate::GridllmHand
  , _task_handle: tokio::task::JoinHandle<()>
}

impl GridllmEngine
{   /// Create and spawn a new engine
    /// Returns immediately - spawns background task.
    /// Model configs are validated when a generation starts
    /// or when they are replaced, not here.
    pub fn new(
      config: crate::config::GridllmConfig
    , system: crate::SystemConfig
    , models: Vec<crate::ModelConfig>
    ) -> Self
    {   debug!("Creating GridllmEngine with task ownership");

        let (start_generation_tx, start_generation_rx)
          = mpsc::unbounded_channel();
        let (cancel_generation_tx, cancel_generation_rx)
          = mpsc::unbounded_channel();
        let (set_model_configs_tx, set_model_configs_rx)
          = mpsc::unbounded_channel();
        let (set_system_config_tx, set_system_config_rx)
          = mpsc::unbounded_channel();
        let (mark_inserted_tx, mark_inserted_rx)
          = mpsc::unbounded_channel();
        let (get_grid_snapshot_tx, get_grid_snapshot_rx)
          = mpsc::unbounded_channel();
        let (get_available_models_tx, get_available_models_rx)
          = mpsc::unbounded_channel();
        let (kill_engine_tx, kill_engine_rx)
          = mpsc::unbounded_channel();

        let hand = crate::GridllmHand
        {   start_generation_tx: start_generation_tx.clone()
          , cancel_generation_tx
              : cancel_generation_tx.clone()
          , set_model_configs_tx
              : set_model_configs_tx.clone()
          , set_system_config_tx
              : set_system_config_tx.clone()
          , mark_inserted_tx: mark_inserted_tx.clone()
          , get_grid_snapshot_tx
              : get_grid_snapshot_tx.clone()
          , get_available_models_tx
              : get_available_models_tx.clone()
          , kill_engine_tx: kill_engine_tx.clone()
        };

        let foot = crate::GridllmFoot
        {   start_generation_rx
          , cancel_generation_rx
          , set_model_configs_rx
          , set_system_config_rx
          , mark_inserted_rx
          , get_grid_snapshot_rx
          , get_available_models_rx
          , kill_engine_rx
        };

        let _task_handle = tokio::spawn(async move {
          run_engine_loop(foot, config, system, models).await
        });

        GridllmEngine
        {   hand
          , _task_handle
        }
    }

    /// Start a generation session - returns almost
    /// immediately; supersedes any session in flight
    pub async fn start_generation(
      &self
    , prompt: String
    ) -> Result<
        mpsc::UnboundedReceiver<crate::StartGenerationReply>,
        crate::error::Error
      >
    {   debug!("start_generation queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::StartGenerationArgs
        {   prompt
          , reply: reply_tx
        };

        self.hand.start_generation_tx
          .send(cmd)
          .map_err(|_| {
            error!("Engine channel closed");
            crate::error::Error::EngineDisconnected
          })?;

        Ok(reply_rx)
    }

    /// Cancel the active session - returns almost immediately
    pub async fn cancel_generation(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::CancelGenerationReply>,
        crate::error::Error
      >
    {   debug!("cancel_generation queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::CancelGenerationArgs
        {   reply: reply_tx
        };

        self.hand.cancel_generation_tx
          .send(cmd)
          .map_err(|_| {
            error!("Engine channel closed");
            crate::error::Error::EngineDisconnected
          })?;

        Ok(reply_rx)
    }

    /// Replace the model configurations
    pub async fn set_model_configs(
      &self
    , models: Vec<crate::ModelConfig>
    ) -> Result<
        mpsc::UnboundedReceiver<crate::SetModelConfigsReply>,
        crate::error::Error
      >
    {   debug!(
          "set_model_configs queuing {} models",
          models.len()
        );
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::SetModelConfigsArgs
        {   models
          , reply: reply_tx
        };

        self.hand.set_model_configs_tx
          .send(cmd)
          .map_err(|_| {
            error!("Engine channel closed");
            crate::error::Error::EngineDisconnected
          })?;

        Ok(reply_rx)
    }

    /// Replace the system configuration (grid dimensions and
    /// shared system prompt)
    pub async fn set_system_config(
      &self
    , config: crate::SystemConfig
    ) -> Result<
        mpsc::UnboundedReceiver<crate::SetSystemConfigReply>,
        crate::error::Error
      >
    {   debug!("set_system_config queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::SetSystemConfigArgs
        {   config
          , reply: reply_tx
        };

        self.hand.set_system_config_tx
          .send(cmd)
          .map_err(|_| {
            error!("Engine channel closed");
            crate::error::Error::EngineDisconnected
          })?;

        Ok(reply_rx)
    }

    /// Mark a slot's text as consumed into the document
    pub async fn mark_inserted(
      &self
    , slot_index: usize
    ) -> Result<
        mpsc::UnboundedReceiver<crate::MarkInsertedReply>,
        crate::error::Error
      >
    {   debug!("mark_inserted queuing slot {}", slot_index);
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::MarkInsertedArgs
        {   slot_index
          , reply: reply_tx
        };

        self.hand.mark_inserted_tx
          .send(cmd)
          .map_err(|_| {
            error!("Engine channel closed");
            crate::error::Error::EngineDisconnected
          })?;

        Ok(reply_rx)
    }

    /// Read the current grid, statuses and errors
    pub async fn grid_snapshot(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::GetGridSnapshotReply>,
        crate::error::Error
      >
    {   trace!("grid_snapshot queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::GetGridSnapshotArgs
        {   reply: reply_tx
        };

        self.hand.get_grid_snapshot_tx
          .send(cmd)
          .map_err(|_| {
            error!("Engine channel closed");
            crate::error::Error::EngineDisconnected
          })?;

        Ok(reply_rx)
    }

    /// Ask the backend which models it can serve
    pub async fn available_models(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver
          <crate::GetAvailableModelsReply>,
        crate::error::Error
      >
    {   debug!("available_models queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::GetAvailableModelsArgs
        {   reply: reply_tx
        };

        self.hand.get_available_models_tx
          .send(cmd)
          .map_err(|_| {
            error!("Engine channel closed");
            crate::error::Error::EngineDisconnected
          })?;

        Ok(reply_rx)
    }

    /// Gracefully shutdown the engine
    pub async fn shutdown(self)
      -> Result<(), crate::error::Error>
    {   debug!("Shutting down GridllmEngine");
        let (reply_tx, mut reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::KillEngineArgs
        {   reply: reply_tx
        };

        self.hand.kill_engine_tx
          .send(cmd)
          .map_err(|_| {
            error!("Engine channel already closed");
            crate::error::Error::EngineDisconnected
          })?;

        // Wait for shutdown confirmation
        if let Some(result) = reply_rx.recv().await
        {   debug!("Engine shutdown confirmed");
            result
        } else
        {   error!("Engine exited without confirming");
            Err(crate::error::Error::EngineDisconnected)
        }
    }
}

/// Main engine event loop
///
/// Design: tokio::select! is ONLY for fast queueing. Every
/// arm routes to a synchronous state-machine handler and
/// returns; the only awaiting work lives in the per-session
/// merge-consumer tasks, which feed back through update_rx.
async fn run_engine_loop(
  foot: crate::GridllmFoot
, config: crate::config::GridllmConfig
, system: crate::SystemConfig
, models: Vec<crate::ModelConfig>
)
{   debug!("Starting GridllmEngine event loop");
    let mut state
      = GridllmEngineState::new(config, system, models);
    let (update_tx, mut update_rx)
      = mpsc::unbounded_channel::<TaggedUpdate>();
    let GridllmFoot
    {   mut start_generation_rx
      , mut cancel_generation_rx
      , mut set_model_configs_rx
      , mut set_system_config_rx
      , mut mark_inserted_rx
      , mut get_grid_snapshot_rx
      , mut get_available_models_rx
      , mut kill_engine_rx
    } = foot;

    loop
    { tokio::select!
      { Some((session_id, update)) = update_rx.recv() => {
          state.apply_update(session_id, update);
        }
      , Some(cmd) = start_generation_rx.recv() => {
          debug!("Received StartGeneration");
          let result = state.handle_start_generation(
            cmd.prompt
          , &update_tx
          );
          let _ = cmd.reply.send(result);
        }
      , Some(cmd) = cancel_generation_rx.recv() => {
          debug!("Received CancelGeneration");
          let result = state.handle_cancel_generation();
          let _ = cmd.reply.send(result);
        }
      , Some(cmd) = set_model_configs_rx.recv() => {
          debug!("Received SetModelConfigs");
          let result = state.handle_set_model_configs(
            cmd.models
          );
          let _ = cmd.reply.send(result);
        }
      , Some(cmd) = set_system_config_rx.recv() => {
          debug!("Received SetSystemConfig");
          let result = state.handle_set_system_config(
            cmd.config
          );
          let _ = cmd.reply.send(result);
        }
      , Some(cmd) = mark_inserted_rx.recv() => {
          debug!("Received MarkInserted");
          let result = state.handle_mark_inserted(
            cmd.slot_index
          );
          let _ = cmd.reply.send(result);
        }
      , Some(cmd) = get_grid_snapshot_rx.recv() => {
          trace!("Received GetGridSnapshot");
          let _ = cmd.reply.send(Ok(state.snapshot()));
        }
      , Some(cmd) = get_available_models_rx.recv() => {
          debug!("Received GetAvailableModels");
          state.handle_get_available_models(cmd.reply);
        }
      , Some(cmd) = kill_engine_rx.recv() => {
          debug!("Received KillEngine");
          state.cancel_active();
          let _ = cmd.reply.send(Ok(()));
          info!("GridllmEngine shutting down");
          break;
        }
      }
    }
}
