use std::fmt;

/// Custom error type for gridllm operations
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error
{   /// Model configuration violates a grid invariant
    InvalidConfiguration(String)
  , /// A generation was requested with no models configured
    NoModelsConfigured
  , /// HTTP request error
    HttpError(String)
  , /// API returned an error response
    ApiError(String)
  , /// Failed to parse a backend event
    ParseError(String)
  , /// Slot index outside the grid
    SlotOutOfRange(usize)
  , /// Engine task is gone or already shut down
    EngineDisconnected
  , /// Generic error
    Other(String)
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::InvalidConfiguration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
          , Error::NoModelsConfigured => {
              write!(f, "No models configured")
            }
          , Error::HttpError(msg) => {
              write!(f, "HTTP error: {}", msg)
            }
          , Error::ApiError(msg) => {
              write!(f, "API error: {}", msg)
            }
          , Error::ParseError(msg) => {
              write!(f, "Parse error: {}", msg)
            }
          , Error::SlotOutOfRange(index) => {
              write!(f, "Slot index out of range: {}", index)
            }
          , Error::EngineDisconnected => {
              write!(f, "Engine disconnected")
            }
          , Error::Other(msg) => {
              write!(f, "Error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}
