//! Live MiWay vehicle tracking.
//!
//! Three upstream feeds (GTFS-RT vehicle positions, a keyed JSON snapshot and
//! a per-route JSON feed) are polled on independent schedules, normalized into
//! one canonical vehicle record, merged field by field into a single store and
//! published to the display layer as add/update/remove changesets.
//!
//! ```text
//! sources ──> scheduler ──> normalizer ──> store ──> search ──> reconciler ──> display
//!                                                                    └─ route_shape (on select)
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod normalizer;
pub mod reconciler;
pub mod route_shape;
pub mod scheduler;
pub mod search;
pub mod service;
pub mod sources;
pub mod store;
pub mod tracker;

pub use config::{CliArgs, TrackerConfig};
pub use error::{ConfigError, FetchError, StartupError, TrackerError};
pub use models::{ChangeSummary, Fix, RouteShape, SourceTag, VehicleRecord};
pub use service::{TrackerBuilder, TrackerHandle, TrackerService};
pub use tracker::{DisplayEvent, SourceStatus, Tracker, ViewSnapshot};
