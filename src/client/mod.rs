//! The publisher and consumer sides of the pipeline.

use std::fmt;

use crate::broker;

pub mod body;
pub mod confirm;
pub mod consumer;
pub mod dedup;
pub mod flow;
pub mod idle;
pub mod publisher;
pub mod roster;
pub mod sequence;
pub mod supervisor;

pub use body::BodyError;
pub use roster::ResolveError;

#[derive(Debug)]
pub enum Error {
    Broker(broker::Error),
    Resolve(ResolveError),
    /// The operator asked to stop while a link was being (re)established.
    ShuttingDown,
}

impl From<broker::Error> for Error {
    fn from(e: broker::Error) -> Self {
        Self::Broker(e)
    }
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        Self::Resolve(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Broker(e) => write!(f, "broker: {e}"),
            Error::Resolve(e) => write!(f, "{e}"),
            Error::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

impl std::error::Error for Error {}
