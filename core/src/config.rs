//! Engine configuration.
//!
//! Settings are deserialized from TOML or built in code; defaults match the
//! original module parameters. The configuration is validated once before
//! the engine starts and is immutable afterwards.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::Error;
use crate::frame::MAX_BATCH;
use crate::ring::MAX_RING_SLOTS;

/// Timestamp field layout in the slot header. Both variants occupy the same
/// eight bytes; `split` stores two 32-bit seconds/nanoseconds words,
/// `combined` a single 64-bit nanosecond count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    Split,
    Combined,
}

/// Which traffic directions the collaborator should feed into the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "yes")]
    pub incoming: bool,
    #[serde(default)]
    pub outgoing: bool,
    #[serde(default)]
    pub loopback: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            incoming: true,
            outgoing: false,
            loopback: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Default capture length in bytes for newly created consumers.
    #[serde(default = "default_caplen")]
    pub caplen: usize,
    /// Default slot count per queue buffer.
    #[serde(default = "default_queue_slots")]
    pub queue_slots: usize,
    /// Prefetch batch length per receive context (1..=64).
    #[serde(default = "default_prefetch_len")]
    pub prefetch_len: usize,
    /// Frames silently discarded after a queue overflow; 0 disables the
    /// backpressure valve.
    #[serde(default)]
    pub flow_control: u32,
    /// Strip the vlan tag from frames at ingress.
    #[serde(default)]
    pub vlan_untag: bool,
    /// Allow drivers to divert frames straight into the engine for devices
    /// with active bindings.
    #[serde(default)]
    pub direct_capture: bool,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: TimestampFormat,
    #[serde(default)]
    pub capture: CaptureConfig,
}

fn yes() -> bool {
    true
}

fn default_caplen() -> usize {
    1514
}

fn default_queue_slots() -> usize {
    131072
}

fn default_prefetch_len() -> usize {
    1
}

fn default_timestamp_format() -> TimestampFormat {
    TimestampFormat::Split
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            caplen: default_caplen(),
            queue_slots: default_queue_slots(),
            prefetch_len: default_prefetch_len(),
            flow_control: 0,
            vlan_untag: false,
            direct_capture: false,
            timestamp_format: default_timestamp_format(),
            capture: CaptureConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads the configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.caplen == 0 || self.caplen > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "caplen {} out of range (1..=65535)",
                self.caplen
            )));
        }
        if self.queue_slots == 0 || self.queue_slots > MAX_RING_SLOTS {
            return Err(Error::InvalidConfig(format!(
                "queue_slots {} out of range (1..={})",
                self.queue_slots, MAX_RING_SLOTS
            )));
        }
        if self.prefetch_len == 0 || self.prefetch_len > MAX_BATCH {
            return Err(Error::InvalidConfig(format!(
                "prefetch_len {} out of range (1..={})",
                self.prefetch_len, MAX_BATCH
            )));
        }
        Ok(())
    }
}
