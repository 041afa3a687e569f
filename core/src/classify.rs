//! Functional classification: actions, stages, chains and the stage factory.
//!
//! Each capture group carries an ordered chain of classifier stages. A stage
//! is a pure function of the frame, the previous stage's verdict and a
//! per-frame scratch word; it produces an [`Action`] naming the verdict
//! flags, the output class mask and an opaque distribution hash. Chains are
//! evaluated continuation-style: `drop`, `steal` or an explicit halt end the
//! chain early.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use crate::error::Error;
use crate::frame::Frame;

/// Maximum stages per chain.
pub const MAX_CHAIN: usize = 8;

/// Maximum bytes of per-stage context accepted from the control plane.
pub const MAX_STAGE_CONTEXT: usize = 4096;

/// Default output class (class 0, "data"), used when a chain is empty or a
/// stage does not pick one.
pub const CLASS_DEFAULT: u32 = 1;
/// Class 1, conventionally control traffic.
pub const CLASS_CONTROL: u32 = 1 << 1;
/// All classes.
pub const CLASS_ANY: u32 = u32::MAX;

const DROP: u8 = 1;
const STEAL: u8 = 1 << 1;
const CLONE: u8 = 1 << 2;
const TO_KERNEL: u8 = 1 << 3;

/// Verdict produced by a classifier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    kind: u8,
    class_mask: u32,
    hash: u32,
}

impl Action {
    /// Forward to class 0 with no distribution preference.
    pub fn pass() -> Self {
        Action {
            kind: 0,
            class_mask: CLASS_DEFAULT,
            hash: 0,
        }
    }

    /// Discard the frame for this group; counted as `drop`.
    pub fn drop() -> Self {
        Action {
            kind: DROP,
            class_mask: 0,
            hash: 0,
        }
    }

    /// Consume the frame entirely: no delivery, no kernel routing.
    pub fn steal() -> Self {
        Action {
            kind: STEAL,
            class_mask: 0,
            hash: 0,
        }
    }

    /// Deliver to every consumer eligible through `class_mask` instead of
    /// load-splitting.
    pub fn broadcast(class_mask: u32) -> Self {
        Action {
            kind: CLONE,
            class_mask,
            hash: 0,
        }
    }

    /// Deliver to one consumer of `class_mask`, picked by `hash`.
    pub fn steer(class_mask: u32, hash: u32) -> Self {
        Action {
            kind: 0,
            class_mask,
            hash,
        }
    }

    /// Additionally hint that the frame should reach the network stack.
    pub fn and_to_kernel(mut self) -> Self {
        self.kind |= TO_KERNEL;
        self
    }

    pub fn with_hash(mut self, hash: u32) -> Self {
        self.hash = hash;
        self
    }

    #[inline]
    pub fn is_drop(&self) -> bool {
        self.kind & DROP != 0
    }

    #[inline]
    pub fn is_steal(&self) -> bool {
        self.kind & STEAL != 0
    }

    #[inline]
    pub fn is_clone(&self) -> bool {
        self.kind & CLONE != 0
    }

    #[inline]
    pub fn sends_to_kernel(&self) -> bool {
        self.kind & TO_KERNEL != 0
    }

    #[inline]
    pub fn class_mask(&self) -> u32 {
        self.class_mask
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// Mutable per-frame state threaded through one chain evaluation.
#[derive(Debug, Default)]
pub struct Scratch {
    /// Opaque stage-to-stage state; ends up in the slot header state word.
    pub state: u64,
    /// Set by a stage to stop the chain after its own verdict.
    pub halt: bool,
}

impl Scratch {
    pub(crate) fn reset(&mut self) {
        self.state = 0;
        self.halt = false;
    }
}

/// A single classification stage.
pub trait ClassifierStage: Send + Sync {
    /// Stage name, for logs.
    fn name(&self) -> &str;

    /// Evaluate the frame, given the verdict of the previous stage.
    fn apply(&self, frame: &Frame, prev: Action, scratch: &mut Scratch) -> Action;
}

/// An ordered stage list, evaluated front to back. Chains are immutable;
/// control-plane edits build a new chain and swap it in whole.
pub struct ClassifierChain {
    stages: Vec<Arc<dyn ClassifierStage>>,
}

impl ClassifierChain {
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(ClassifierChain { stages: Vec::new() })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Copy of this chain with `level` replaced (or appended). Clearing a
    /// level truncates the chain there, since later stages were reachable
    /// only through it.
    pub(crate) fn with_stage(
        &self,
        level: usize,
        stage: Option<Arc<dyn ClassifierStage>>,
    ) -> Result<Arc<Self>, Error> {
        if level >= MAX_CHAIN {
            return Err(Error::InvalidLevel(level));
        }
        let mut stages = self.stages.clone();
        match stage {
            Some(stage) => {
                if level > stages.len() {
                    return Err(Error::InvalidLevel(level));
                }
                if level == stages.len() {
                    stages.push(stage);
                } else {
                    stages[level] = stage;
                }
            }
            None => stages.truncate(level),
        }
        Ok(Arc::new(ClassifierChain { stages }))
    }

    /// Runs the chain over one frame. `scratch` must be reset by the caller
    /// between frames.
    pub fn eval(&self, frame: &Frame, scratch: &mut Scratch) -> Action {
        let mut action = Action::pass();
        for stage in &self.stages {
            action = stage.apply(frame, action, scratch);
            if scratch.halt || action.is_drop() || action.is_steal() {
                break;
            }
        }
        action
    }
}

/// Builds a stage instance from an optional context blob.
pub type StageBuilder = fn(Option<&[u8]>) -> anyhow::Result<Arc<dyn ClassifierStage>>;

/// Named stage registry. The builtins are always present; embedders may
/// register additional builders before wiring up groups.
pub struct StageFactory {
    builders: RwLock<HashMap<String, StageBuilder>>,
}

impl StageFactory {
    pub(crate) fn with_builtins() -> Self {
        let mut builders: HashMap<String, StageBuilder> = HashMap::new();
        for (name, builder) in BUILTINS.iter() {
            builders.insert((*name).to_owned(), *builder);
        }
        StageFactory {
            builders: RwLock::new(builders),
        }
    }

    pub fn register(&self, name: &str, builder: StageBuilder) {
        log::debug!("classifier '{name}' registered");
        self.builders
            .write()
            .unwrap()
            .insert(name.to_owned(), builder);
    }

    pub(crate) fn build(
        &self,
        name: &str,
        context: Option<&[u8]>,
    ) -> Result<Arc<dyn ClassifierStage>, Error> {
        if let Some(ctx) = context {
            if ctx.len() > MAX_STAGE_CONTEXT {
                return Err(Error::ContextTooLarge(ctx.len()));
            }
        }
        let builder = *self
            .builders
            .read()
            .unwrap()
            .get(name)
            .ok_or_else(|| Error::UnknownClassifier(name.to_owned()))?;
        builder(context).map_err(Error::StageBuild)
    }
}

lazy_static! {
    static ref BUILTINS: Vec<(&'static str, StageBuilder)> = vec![
        ("pass", build_pass as StageBuilder),
        ("drop", build_drop),
        ("steal", build_steal),
        ("broadcast", build_broadcast),
        ("to-kernel", build_to_kernel),
        ("steer-rss", build_steer_rss),
    ];
}

/// Optional 4-byte little-endian class mask in the context blob.
fn class_from_context(context: Option<&[u8]>) -> anyhow::Result<u32> {
    match context {
        None => Ok(CLASS_DEFAULT),
        Some(ctx) => {
            let bytes: [u8; 4] = ctx
                .try_into()
                .map_err(|_| anyhow::anyhow!("expected a 4-byte class mask"))?;
            let mask = u32::from_le_bytes(bytes);
            anyhow::ensure!(mask != 0, "class mask must be non-zero");
            Ok(mask)
        }
    }
}

struct Pass {
    class_mask: u32,
}

impl ClassifierStage for Pass {
    fn name(&self) -> &str {
        "pass"
    }

    fn apply(&self, _frame: &Frame, prev: Action, _scratch: &mut Scratch) -> Action {
        Action {
            class_mask: self.class_mask,
            ..prev
        }
    }
}

struct DropAll;

impl ClassifierStage for DropAll {
    fn name(&self) -> &str {
        "drop"
    }

    fn apply(&self, _frame: &Frame, _prev: Action, _scratch: &mut Scratch) -> Action {
        Action::drop()
    }
}

struct Steal;

impl ClassifierStage for Steal {
    fn name(&self) -> &str {
        "steal"
    }

    fn apply(&self, _frame: &Frame, _prev: Action, _scratch: &mut Scratch) -> Action {
        Action::steal()
    }
}

struct Broadcast {
    class_mask: u32,
}

impl ClassifierStage for Broadcast {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn apply(&self, _frame: &Frame, _prev: Action, _scratch: &mut Scratch) -> Action {
        Action::broadcast(self.class_mask)
    }
}

struct ToKernel;

impl ClassifierStage for ToKernel {
    fn name(&self) -> &str {
        "to-kernel"
    }

    fn apply(&self, _frame: &Frame, prev: Action, _scratch: &mut Scratch) -> Action {
        prev.and_to_kernel()
    }
}

/// Steers by a hash of the payload bytes, spreading flows across the
/// eligible consumers of the configured classes.
struct SteerRss {
    class_mask: u32,
}

impl ClassifierStage for SteerRss {
    fn name(&self) -> &str {
        "steer-rss"
    }

    fn apply(&self, frame: &Frame, _prev: Action, _scratch: &mut Scratch) -> Action {
        Action::steer(self.class_mask, fnv1a(frame.payload()))
    }
}

fn build_pass(context: Option<&[u8]>) -> anyhow::Result<Arc<dyn ClassifierStage>> {
    Ok(Arc::new(Pass {
        class_mask: class_from_context(context)?,
    }))
}

fn build_drop(_context: Option<&[u8]>) -> anyhow::Result<Arc<dyn ClassifierStage>> {
    Ok(Arc::new(DropAll))
}

fn build_steal(_context: Option<&[u8]>) -> anyhow::Result<Arc<dyn ClassifierStage>> {
    Ok(Arc::new(Steal))
}

fn build_broadcast(context: Option<&[u8]>) -> anyhow::Result<Arc<dyn ClassifierStage>> {
    Ok(Arc::new(Broadcast {
        class_mask: class_from_context(context)?,
    }))
}

fn build_to_kernel(_context: Option<&[u8]>) -> anyhow::Result<Arc<dyn ClassifierStage>> {
    Ok(Arc::new(ToKernel))
}

fn build_steer_rss(context: Option<&[u8]>) -> anyhow::Result<Arc<dyn ClassifierStage>> {
    Ok(Arc::new(SteerRss {
        class_mask: class_from_context(context)?,
    }))
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
