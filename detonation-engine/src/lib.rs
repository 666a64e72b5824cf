pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod sandbox;
pub mod storage;

pub use config::Config;
pub use events::{EventEmitter, EventStatus, ProgressEvent};
pub use pipeline::{DetonationPipeline, Sample};
pub use queue::BatchDriver;
