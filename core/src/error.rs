//! Typed errors for the control surface.
//!
//! The data path never returns per-frame errors; saturation and rejection
//! degrade to counters. Everything here is raised synchronously by
//! configuration or control-plane calls.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no consumer id available")]
    ConsumerExhausted,

    #[error("unknown consumer id {0}")]
    UnknownConsumer(usize),

    #[error("consumer {0} is not enabled")]
    NotEnabled(usize),

    #[error("invalid group id {0}")]
    InvalidGroup(usize),

    #[error("no free group available")]
    GroupsExhausted,

    #[error("group {0}: permission denied")]
    PermissionDenied(usize),

    #[error("group {0}: not a member")]
    NotMember(usize),

    #[error("invalid class mask")]
    InvalidClassMask,

    #[error("unknown classifier '{0}'")]
    UnknownClassifier(String),

    #[error("classifier context too large ({0} bytes)")]
    ContextTooLarge(usize),

    #[error("invalid classifier level {0}")]
    InvalidLevel(usize),

    #[error("classifier builder failed: {0}")]
    StageBuild(anyhow::Error),

    #[error("invalid vlan id {0}")]
    InvalidVlanId(i32),

    #[error("vlan filters are disabled for group {0}")]
    VlanFiltersDisabled(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("queue allocation failed: {0}")]
    RingAllocation(String),
}
