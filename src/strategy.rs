use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::fragment::FragmentIdentity;
use crate::store::{PutMode, StoreKey, StoreResult};

const TICK_KEY_PREFIX: &str = "coverage.";

/// How a producer disambiguates its fragments inside the shared store.
///
/// The identity input (run segment or tick) always comes from the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeStrategy {
    /// Fragments keep their instrument-generated names under `<run_segment>/`.
    PathPartition { run_segment: String },
    /// The producer's single fragment is stored as `coverage.<tick>`.
    ExplicitTick { tick: u32 },
}

impl ExchangeStrategy {
    pub fn path_partition(run_segment: impl Into<String>) -> Self {
        ExchangeStrategy::PathPartition {
            run_segment: run_segment.into(),
        }
    }

    pub fn explicit_tick(tick: u32) -> Self {
        ExchangeStrategy::ExplicitTick { tick }
    }

    pub fn put_mode(&self) -> PutMode {
        match self {
            ExchangeStrategy::PathPartition { .. } => PutMode::Idempotent,
            ExchangeStrategy::ExplicitTick { .. } => PutMode::CreateNew,
        }
    }

    pub fn key_for(&self, file_name: &str) -> StoreResult<StoreKey> {
        match self {
            ExchangeStrategy::PathPartition { run_segment } => {
                segment_key(run_segment)?.join(file_name)
            }
            ExchangeStrategy::ExplicitTick { tick } => tick_key(*tick),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectMode {
    /// Everything under `<run_segment>/` whose name matches the fragment pattern.
    Wildcard { run_segment: String },
    /// Exactly `coverage.0` .. `coverage.<expected - 1>`.
    Count { expected: u32 },
}

/// `coverage.<tick>`: the store key owned by the producer with that ordinal.
pub fn tick_key(tick: u32) -> StoreResult<StoreKey> {
    StoreKey::new(format!("{TICK_KEY_PREFIX}{tick}"))
}

/// `.coverage.<tick>`: the local file a tick entry is materialized as.
pub fn tick_file_name(tick: u32) -> String {
    FragmentIdentity::Tick(tick).file_name()
}

/// A run segment must be a single key component.
pub fn segment_key(run_segment: &str) -> StoreResult<StoreKey> {
    let key = StoreKey::new(run_segment)?;
    if key.parent().is_some() {
        return Err(StoreError::InvalidKey {
            key: run_segment.to_string(),
            reason: "run segment must be a single path component",
        });
    }
    Ok(key)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeKind {
    #[default]
    PathPartition,
    ExplicitTick,
}
