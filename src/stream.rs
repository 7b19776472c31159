//! Per-model stream adapter
//!
//! Wraps one already-issued streaming HTTP response and yields
//! normalized `CompletionUpdate` events addressed to absolute
//! grid slots (`slot_index = grid_offset + choice_index`).

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use log::{debug, error};

use crate::CompletionUpdate;
use crate::config::StopTextPolicy;
use crate::decode::{SseDecoder, ChoiceEvent};

/// Build the single update reporting a model-level failure.
/// A request-level failure has no choice index, so it targets
/// the model's first slot.
pub fn error_update(
  model_id: &str
, slot_index: usize
, message: String
) -> CompletionUpdate
{   CompletionUpdate
    {   model_id: model_id.to_string()
      , slot_index
      , text: String::new()
      , is_complete: true
      , error: Some(message)
    }
}

fn slot_update(
  model_id: &str
, grid_offset: usize
, event: ChoiceEvent
) -> CompletionUpdate
{   CompletionUpdate
    {   model_id: model_id.to_string()
      , slot_index: grid_offset + event.choice_index
      , text: event.text
      , is_complete: event.is_complete
      , error: None
    }
}

/// Adapt one streaming response into a sequence of updates.
///
/// A non-2xx status or a mid-stream transport error is fatal
/// to this model only and is reported as a single error
/// update. End of body without explicit stops triggers the
/// decoder's forced-completion synthesis. Cancellation ends
/// the sequence silently; it is never surfaced as a failure.
/// The body reader is dropped on every exit path.
pub fn completion_stream(
  response: reqwest::Response
, model_id: String
, grid_offset: usize
, num_completions: usize
, stop_text: StopTextPolicy
, cancel: CancellationToken
) -> impl Stream<Item = CompletionUpdate>
{   stream!
    {   let status = response.status();
        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_|
                "Unknown error".to_string()
              );
            error!(
              "Backend error for {}: {} {}",
              model_id, status, error_text
            );
            yield error_update(
              &model_id
            , grid_offset
            , format!("HTTP error! status: {}", status)
            );
            return;
        }

        let mut decoder
          = SseDecoder::new(num_completions, stop_text);
        let mut body = response.bytes_stream();

        loop
        {   let chunk = tokio::select!
            {   _ = cancel.cancelled() => {
                  debug!("Stream for {} cancelled", model_id);
                  break;
                }
              , chunk = body.next() => chunk
            };

            match chunk
            {   Some(Ok(bytes)) => {
                  for event in decoder.feed(&bytes)
                  {   yield slot_update(
                        &model_id, grid_offset, event
                      );
                  }
                }
              , Some(Err(e)) => {
                  if cancel.is_cancelled()
                  {   debug!(
                        "Stream for {} aborted", model_id
                      );
                      break;
                  }
                  error!(
                    "Stream error for {}: {}", model_id, e
                  );
                  yield error_update(
                    &model_id
                  , grid_offset
                  , e.to_string()
                  );
                  break;
                }
              , None => {
                  // Connection closed; force-complete any
                  // choice the backend left open
                  for event in decoder.finish()
                  {   yield slot_update(
                        &model_id, grid_offset, event
                      );
                  }
                  debug!("Stream for {} ended", model_id);
                  break;
                }
            }
        }
    }
}
