mod base;
mod bus;
mod logger;

pub use base::{ExecutionEvent, Topic};
pub use bus::{EventBus, ObserverId, Subscription};
pub use logger::{LogSink, MemoryLogSink, NodeLogger};
