//! Fan-out merge engine
//!
//! Issues one streaming request per configured model and
//! merges every adapter's output into a single sequence with
//! a race-based fairness policy: one pending next-value per
//! still-active adapter, whichever resolves first is yielded
//! and that adapter is immediately re-armed, adapters that
//! finish drop out of the pool. Updates stay causally ordered
//! per slot but carry no ordering across models.

use std::pin::Pin;

use async_stream::stream;
use futures::{Stream, StreamExt};
use futures::stream::select_all;
use tokio_util::sync::CancellationToken;
use log::{debug, error};

use crate::CompletionUpdate;

type AdapterStream
  = Pin<Box<dyn Stream<Item = CompletionUpdate> + Send>>;

/// Fan the prompt out to every configured model and merge the
/// resulting streams. One shared cancellation token covers
/// every request in the session.
///
/// A model whose connection cannot even be established gets
/// one immediate error update and no adapter; other models
/// are unaffected. The merged sequence ends only when every
/// adapter has ended.
pub fn generate_completions(
  models: Vec<crate::ModelConfig>
, prompt: String
, system_prompt: String
, config: crate::config::GridllmConfig
, client: reqwest::Client
, cancel: CancellationToken
) -> impl Stream<Item = CompletionUpdate>
{   stream!
    {   let mut adapters: Vec<AdapterStream> = Vec::new();

        for model in &models
        {   debug!("Starting generation for {}", model.id);

            let built = crate::request::build_request(
              model
            , &prompt
            , &system_prompt
            , &config
            );
            let url = format!(
              "{}/{}",
              config.api_base.trim_end_matches('/'),
              built.path
            );

            let mut req = client.post(&url)
              .header("Content-Type", "application/json")
              .json(&built.payload);
            if let Some(key) = &config.api_key
            {   req = req.header(
                  "Authorization",
                  format!("Bearer {}", key)
                );
            }

            let sent = tokio::select!
            {   _ = cancel.cancelled() => {
                  debug!(
                    "Generation cancelled before {} \
                     connected",
                    model.id
                  );
                  return;
                }
              , result = req.send() => result
            };

            match sent
            {   Ok(response) => {
                  adapters.push(Box::pin(
                    crate::stream::completion_stream(
                      response
                    , model.id.clone()
                    , model.grid_offset
                    , model.num_completions
                    , config.stop_text.clone()
                    , cancel.clone()
                    )
                  ));
                }
              , Err(e) => {
                  if cancel.is_cancelled()
                  {   return;
                  }
                  error!(
                    "Failed to reach backend for {}: {}",
                    model.id, e
                  );
                  yield crate::stream::error_update(
                    &model.id
                  , model.grid_offset
                  , e.to_string()
                  );
                }
            }
        }

        let mut merged = select_all(adapters);
        while let Some(update) = merged.next().await
        {   yield update;
        }

        debug!("All model streams drained");
    }
}
