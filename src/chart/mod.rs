//! The chart subsystem (spec §4.5–§4.7): fetch, cache, render, post-render,
//! and drive the release state machine.

pub mod cache;
pub mod engine;
pub mod fetcher;
pub mod postrender;
pub mod release_store;
pub mod render;

pub use cache::ChartCache;
pub use engine::{ChartEngine, ChartEngineError};
pub use fetcher::{ChartFetcher, Credential, FetchError};
pub use postrender::PostRenderer;
pub use release_store::{ObjectRef, ReleaseRecord, ReleaseStatus, ReleaseStore};
pub use render::{RenderError, Renderer};
