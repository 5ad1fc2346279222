//! # daomop
//!
//! Moving-object linkage for wide-field survey exposures.
//!
//! Source catalogs of many exposures are loaded into a [`detections::DetectionStore`],
//! stationary sources are flagged, detections of each night are joined into pairwise links
//! and then into single-night tracklets, and tracklets of successive nights are chained into
//! multi-night tracks. Closed tracks are ranked and deduplicated.
//!
//! ```text
//! Archive ──► DetectionStore ──► Pairwise Linker ──► Tracklet Builder
//!                                                          │
//!              CSV ◄── Ranker ◄── Night-to-Night Matcher ◄─┘
//! ```
//!
//! The [`pipeline::Pipeline`] runs every stage; each stage is also usable on its own.
pub mod archive;
pub mod constants;
pub mod daomop_errors;
pub mod detections;
pub mod linking;
pub mod output;
pub mod pipeline;
pub mod ranking;
pub mod sky;
pub mod time;
pub mod tracklets;
pub mod tracks;

pub use archive::{Archive, CachedArchive, ExposureCache, RetryPolicy, VospaceArchive};
pub use daomop_errors::{DaomopError, ErrorClass};
pub use detections::{DetectionStore, StoreParams};
pub use linking::LinkingParams;
pub use pipeline::{Pipeline, PipelineConfig, RunOutput, RunSummary};
