//! SSE wire decoder for OpenAI-compatible streaming bodies
//!
//! Turns raw byte chunks into discrete per-choice events. The
//! decoder is a restartable state machine: the line-assembly
//! buffer is owned state carried across `feed` calls, because
//! a chunk boundary never corresponds to a logical-line
//! boundary (it may even split a UTF-8 sequence).

use serde::Deserialize;
use log::{debug, warn, error};

use crate::config::StopTextPolicy;

/// One decoded event local to a single backend stream.
/// `choice_index` is 0-based within that model's own request;
/// the stream adapter maps it to an absolute grid slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceEvent
{   pub choice_index: usize
  , pub text: String
  , pub is_complete: bool
}

// ===== Wire payloads =====

#[derive(Debug, Deserialize)]
struct SsePayload
{   #[serde(default)]
    choices: Vec<SseChoice>
}

#[derive(Debug, Deserialize)]
struct SseChoice
{   #[serde(default)]
    index: usize
  , /// Completion-protocol token increment
    text: Option<String>
  , /// Chat-protocol token increment, absent on the
    /// terminal chunk
    delta: Option<SseDelta>
  , finish_reason: Option<String>
  , /// The actual terminating text the backend consumed.
    /// Not all backends return this.
    stop_reason: Option<String>
}

#[derive(Debug, Deserialize)]
struct SseDelta
{   content: Option<String>
}

// ===== Decoder =====

/// Upper bound on one buffered line. A backend that never
/// sends a newline must not grow the buffer without bound.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental decoder for one model's event stream
pub struct SseDecoder
{   /// Unconsumed bytes after the last complete line
    buffer: Vec<u8>
  , /// Idempotence guard: one flag per expected choice index
    completed: Vec<bool>
  , stop_text: StopTextPolicy
}

impl SseDecoder
{   /// Create a decoder expecting `num_completions` choices
    pub fn new(
      num_completions: usize
    , stop_text: StopTextPolicy
    ) -> Self
    {   SseDecoder
        {   buffer: Vec::new()
          , completed: vec![false; num_completions]
          , stop_text
        }
    }

    /// Feed one raw chunk of the response body, returning
    /// every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ChoiceEvent>
    {   self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos)
          = self.buffer.iter().position(|b| *b == b'\n')
        {   let line_bytes: Vec<u8>
              = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            self.decode_line(line.trim_end(), &mut events);
        }

        if self.buffer.len() > MAX_LINE_BYTES
        {   // Same non-fatal treatment as a malformed line;
            // the tail up to the next newline parses as
            // garbage and is dropped by decode_line
            error!(
              "Discarding oversized stream line ({} bytes \
               without a newline)",
              self.buffer.len()
            );
            self.buffer.clear();
        }

        events
    }

    /// Signal end of the underlying byte stream. Synthesizes
    /// a forced completion (empty text) for every index that
    /// never saw an explicit finish_reason, so a silently
    /// truncated connection can never leave a slot open.
    pub fn finish(&mut self) -> Vec<ChoiceEvent>
    {   if !self.buffer.is_empty()
        {   debug!(
              "Discarding {} bytes of truncated line",
              self.buffer.len()
            );
            self.buffer.clear();
        }

        let mut events = Vec::new();
        for index in 0..self.completed.len()
        {   if !self.completed[index]
            {   self.completed[index] = true;
                events.push(ChoiceEvent
                {   choice_index: index
                  , text: String::new()
                  , is_complete: true
                });
            }
        }

        if !events.is_empty()
        {   debug!(
              "Forced completion for {} open choices",
              events.len()
            );
        }
        events
    }

    /// True once every expected choice has completed
    pub fn all_complete(&self) -> bool
    {   self.completed.iter().all(|c| *c)
    }

    fn decode_line(
      &mut self
    , line: &str
    , events: &mut Vec<ChoiceEvent>
    )
    {   let data = match line.strip_prefix("data: ")
        {   Some(d) => d
          , // Comments, blank keep-alives, unknown fields
            None => { return; }
        };

        if data.trim() == "[DONE]"
        {   // End-of-stream sentinel, never JSON
            return;
        }

        let payload: SsePayload
          = match serde_json::from_str(data)
        {   Ok(p) => p
          , Err(e) => {
              // Non-fatal: log and keep decoding. Proxies
              // inject heartbeat and truncated lines.
              error!("Error parsing stream line: {}", e);
              return;
            }
        };

        for choice in payload.choices
        {   self.decode_choice(choice, events);
        }
    }

    fn decode_choice(
      &mut self
    , choice: SseChoice
    , events: &mut Vec<ChoiceEvent>
    )
    {   let index = choice.index;
        if index >= self.completed.len()
        {   warn!(
              "Dropping event for unexpected choice {}",
              index
            );
            return;
        }
        if self.completed[index]
        {   // Some backends re-emit after stop
            return;
        }

        if choice.finish_reason.as_deref() == Some("stop")
        {   self.completed[index] = true;
            events.push(ChoiceEvent
            {   choice_index: index
              , text: self.stop_text_for(choice.stop_reason)
              , is_complete: true
            });
            return;
        }

        let is_complete = choice.finish_reason.is_some();
        if is_complete
        {   self.completed[index] = true;
        }

        let text = choice.delta
          .and_then(|d| d.content)
          .or(choice.text)
          .unwrap_or_default();

        events.push(ChoiceEvent
        {   choice_index: index
          , text
          , is_complete
        });
    }

    fn stop_text_for(
      &self
    , stop_reason: Option<String>
    ) -> String
    {   match &self.stop_text
        {   StopTextPolicy::BackendOrDefault(default) => {
              stop_reason
                .unwrap_or_else(|| default.clone())
            }
          , StopTextPolicy::Nothing => String::new()
        }
    }
}
