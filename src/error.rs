use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to encode {0}: {1}")]
    Encode(&'static str, String),

    #[error("failed to decode {0}: {1}")]
    Decode(&'static str, String),

    #[error("corrupted {0}")]
    Corrupted(String),

    #[error("checksum mismatch: computed = {computed:#010x}, stored = {stored:#010x}")]
    ChecksumMismatch { computed: u32, stored: u32 },

    #[error("store location already in use: {0}")]
    LocationInUse(PathBuf),

    #[error("redb: {0}")]
    Redb(#[from] redb::Error),

    #[error("{}", shutdown_message(.0))]
    Shutdown(Vec<TierError>),
}

impl Error {
    /// Wraps the error with a description of the step that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// The layer of an external map an operation was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Screen,
    Cache,
    Store,
    /// Draining the cache into the store before shutdown.
    Flush,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Screen => "screen",
            Tier::Cache => "cache",
            Tier::Store => "store",
            Tier::Flush => "flush",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{tier}: {error}")]
pub struct TierError {
    pub tier: Tier,
    #[source]
    pub error: Error,
}

impl TierError {
    pub fn new(tier: Tier, error: Error) -> Self {
        Self { tier, error }
    }
}

fn shutdown_message(failures: &[TierError]) -> String {
    let parts: Vec<String> = failures.iter().map(ToString::to_string).collect();
    format!("{} tier(s) failed: {}", failures.len(), parts.join("; "))
}

/// Collects the outcome of independent best-effort steps.
///
/// Every step is attempted; failures are recorded instead of returned early.
#[derive(Debug, Default)]
pub(crate) struct Failures(Vec<TierError>);

impl Failures {
    pub(crate) fn record(&mut self, tier: Tier, result: Result<()>) {
        if let Err(error) = result {
            self.0.push(TierError::new(tier, error));
        }
    }

    pub(crate) fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(self.0))
        }
    }
}
