//! Umbrella crate for gobanview.
//!
//! Re-exports the core and protocol crates so downstream code can depend on a
//! single crate name (`gobanview`). The async runtime lives in
//! `gobanview-client`.

pub use gobanview_core as core;
pub use gobanview_protocol as protocol;
