//! Enrichment stages applied to every event in stream order.
//!
//! Each [`Interceptor`] takes the event by value and hands back an
//! [`Outcome`] saying what happens next. [`Chain::dispatch`] folds a single
//! event through all stages and reports whether it should be forwarded.

pub mod handle;
pub mod ps;

use std::fmt;
use thiserror::Error;

use crate::{
    handle::HandleError,
    kevent::{Kevent, KparamsError},
    ps::SnapshotError,
};

pub use handle::HandleInterceptor;
pub use ps::PsInterceptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorType {
    Ps,
    Handle,
}

impl fmt::Display for InterceptorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptorType::Ps => f.write_str("ps"),
            InterceptorType::Handle => f.write_str("handle"),
        }
    }
}

#[derive(Debug, Error)]
pub enum InterceptorError {
    #[error(transparent)]
    Kparams(#[from] KparamsError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// What a stage decided for one event.
#[derive(Debug)]
pub enum Outcome {
    /// Hand the event to the next stage.
    Continue(Kevent),
    /// Forward the event, skipping the remaining stages.
    Stop(Kevent),
    /// Suppress the event. Not a failure; used when a stage keeps the event
    /// for later emission.
    Drop,
    /// Enrichment failed. The event is carried along so it can still be
    /// forwarded; `proceed` tells whether later stages should still run.
    Fail {
        kevt: Kevent,
        error: InterceptorError,
        proceed: bool,
    },
}

pub trait Interceptor: Send + Sync {
    fn intercept(&self, kevt: Kevent) -> Outcome;
    fn name(&self) -> InterceptorType;
}

/// Final decision for one event.
#[derive(Debug)]
pub enum Verdict {
    Forward(Kevent),
    Drop,
}

/// First failure seen while dispatching an event.
#[derive(Debug, Error)]
#[error("{interceptor} interceptor failed: {source}")]
pub struct ChainError {
    pub interceptor: InterceptorType,
    /// The partially enriched event, unless a later stage suppressed it.
    pub kevt: Option<Kevent>,
    #[source]
    pub source: InterceptorError,
}

#[derive(Default)]
pub struct Chain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs `kevt` through every stage in order.
    ///
    /// Only the first failure is reported; later ones are logged. A failed
    /// event is returned inside the error so the caller can still forward it.
    pub fn dispatch(&self, mut kevt: Kevent) -> Result<Verdict, ChainError> {
        let mut failure: Option<(InterceptorType, InterceptorError)> = None;

        for interceptor in &self.interceptors {
            match interceptor.intercept(kevt) {
                Outcome::Continue(next) => kevt = next,
                Outcome::Stop(next) => {
                    kevt = next;
                    break;
                }
                Outcome::Drop => {
                    return match failure {
                        None => Ok(Verdict::Drop),
                        Some((interceptor, source)) => Err(ChainError {
                            interceptor,
                            kevt: None,
                            source,
                        }),
                    };
                }
                Outcome::Fail {
                    kevt: next,
                    error,
                    proceed,
                } => {
                    kevt = next;
                    match failure {
                        None => failure = Some((interceptor.name(), error)),
                        Some(_) => log::debug!(
                            "{} interceptor also failed on seq {}: {error}",
                            interceptor.name(),
                            kevt.seq
                        ),
                    }
                    if !proceed {
                        break;
                    }
                }
            }
        }

        match failure {
            None => Ok(Verdict::Forward(kevt)),
            Some((interceptor, source)) => Err(ChainError {
                interceptor,
                kevt: Some(kevt),
                source,
            }),
        }
    }
}
