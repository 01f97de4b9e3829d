pub mod collector;
pub mod config;
pub mod database;
pub mod error;
pub mod fragment;
pub mod observability;
pub mod plan;
pub mod producer;
pub mod report;
pub mod store;
pub mod strategy;
pub mod validation;

pub use collector::{CollectOutcome, FragmentCollector};
pub use error::{ExchangeError, FileReportIssue, StoreError};
pub use fragment::{CoverageData, FileCoverage, FragmentIdentity};
pub use producer::{FragmentProducer, TestCommand, TransferReport};
pub use store::{FsStore, MemoryStore, SharedStore, StoreKey};
pub use strategy::{CollectMode, ExchangeStrategy};
