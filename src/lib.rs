//! # meshcollect
//!
//! Telemetry collector for Meshtastic mesh-radio networks. Packet events
//! delivered by a radio transport are recorded as append-only metric rows,
//! while a node directory keeps one row per node with the best names known
//! so far.
//!
//! ## Architecture
//!
//! - [`transport`] - transport boundary types: packet events, the roster
//!   snapshot, and the JSON-lines replay source
//! - [`dispatch`] - per-event entry point and the ingestion error boundary
//! - [`decode`] - identity announcement decode chain over a tagged payload
//!   union
//! - [`directory`] - node row write policy; placeholder names only ever move
//!   forward to real ones
//! - [`recorder`] - derives one metric row per packet
//! - [`store`] - resilient store facade: bounded connection pool, retry
//!   policy, health probing, with a sled backend
//! - [`collector`] - runtime wiring: event loop, reconcile sweep, stats,
//!   health supervision
//! - [`config`] / [`metrics`] / [`model`] / [`logutil`] - supporting pieces
//!
//! ## Resolution lifecycle
//!
//! A node first seen only by its identifier gets synthesized placeholder
//! names and is *provisional*. Either the direct NODEINFO path or the
//! periodic reconcile sweep later *promotes* it with announced names. The
//! promotion is a storage-level conditional replace, so the two paths are
//! safe to race and repeat.

pub mod collector;
pub mod config;
pub mod decode;
pub mod directory;
pub mod dispatch;
pub mod logutil;
pub mod metrics;
pub mod model;
pub mod recorder;
pub mod store;
pub mod transport;
