//! Multi-core packet capture distribution.
//!
//! `packetq-core` moves captured frames from many producer CPUs to many
//! consumers with per-consumer double-buffered slot queues and per-group
//! classification. Producers batch frames into a [`dispatch::LocalContext`]
//! and hand them to the [`Engine`]; each frame is matched against the device
//! bindings of the capture groups, filtered, classified and either fanned
//! out to every eligible consumer or steered to exactly one of them by a
//! distribution hash.
//!
//! ```no_run
//! use std::time::Duration;
//! use packetq_core::config::EngineConfig;
//! use packetq_core::frame::Frame;
//! use packetq_core::group::GroupPolicy;
//! use packetq_core::Engine;
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = Engine::new(EngineConfig::default())?;
//!
//! let mut consumer = engine.create_consumer()?;
//! consumer.enable()?;
//! let gid = consumer.join_group(None, 1, GroupPolicy::Shared)?;
//! consumer.bind(gid, Some(3), None)?;
//!
//! let mut rx = engine.local(0);
//! engine.receive(&mut rx, Frame::new(3, 0, vec![0u8; 60]));
//! engine.flush(&mut rx);
//!
//! for slot in consumer.read(Duration::from_millis(10))?.iter() {
//!     println!("{} bytes from ifindex {}", slot.payload.len(), slot.header.if_index);
//! }
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod control;
mod devmap;
pub mod dispatch;
mod engine;
pub mod error;
pub mod filter;
pub mod frame;
pub mod group;
pub mod ring;
mod stats;
pub mod utils;

pub use devmap::{MAX_DEVICES, MAX_HW_QUEUES};
pub use engine::{ConsumerHandle, Engine, MAX_CONSUMERS};
pub use stats::{Stats, MAX_CPUS};
