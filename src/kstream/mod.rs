//! Kernel event stream: sources, the interceptor chain and deferred events.

pub mod consumer;
pub mod deferred;
pub mod interceptors;

pub use consumer::{ChannelSource, Consumer, ConsumerHandle, EventSource, JsonLinesSource};
pub use deferred::DeferredBuffer;
pub use interceptors::{Chain, ChainError, HandleInterceptor, Interceptor, Outcome, PsInterceptor, Verdict};
