//! thermowatch: sensor ingestion, time-series storage, spike detection and
//! alert fan-out for a single site.
//!
//! data flow:
//!
//! ```text
//!     source ──mpsc──▶ ingest ──▶ store ◀── detector ◀── scheduler / api
//!                                            │
//!                                   reference provider
//!                                            │
//!                                        dispatch ──▶ chart + notifier
//! ```

pub mod api;
pub mod chart;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod reference;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod subscribers;
