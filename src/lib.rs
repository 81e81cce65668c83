//! brightness-scan: network brightness earthquake detection
//!
//! Grid-search detector in the style of Frank & Shapiro (2014): stack
//! lag-aligned seismic energy at every node of a travel-time grid, take the
//! per-sample maximum over nodes, and pick peaks above a robust threshold.
//! Each peak becomes a waveform template that is kept only if it is coherent
//! across the network.
//!
//! ## Architecture
//!
//! - **grid**: travel-time grid loading, volume cutting, moveout deduplication
//! - **waveform**: continuous traces and the 16-bit template copy
//! - **energy**: per-node energy stacks on a bounded worker pool
//! - **response**: cumulative network response, in memory or via scratch files
//! - **detection**: threshold statistics and peak declustering
//! - **template**: template cutting, coherence filter, template store
//! - **pipeline**: the end-to-end scan and its reports

pub mod config;
pub mod detection;
pub mod energy;
pub mod grid;
pub mod pipeline;
pub mod response;
pub mod template;
pub mod types;
pub mod waveform;

pub use config::ScanConfig;
pub use pipeline::{BrightnessScan, ScanError, ScanOutcome};
pub use types::{Detection, LagMode, Node, Phase, Pick};
