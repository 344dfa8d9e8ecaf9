//! ferry-services — the transfer core: manifest store, link scout, shaper,
//! sender engine, and receiver-side reassembler.

pub mod engine;
pub mod receiver;
pub mod scout;
pub mod shaper;
pub mod store;

pub use engine::{EngineError, ProgressSink, TransferEngine, TransferStats};
pub use receiver::Reassembler;
pub use scout::{LinkMetrics, LinkScout};
pub use shaper::{LinkShaper, ShaperConfig};
pub use store::{ManifestStore, StoreError};
