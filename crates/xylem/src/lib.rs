//! Xylem: concurrent key/value transform engine
//!
//! Xylem drives a [`Mapping`] over the records produced by a [`Reader`],
//! runs every record as a self-reporting job on a pluggable [`Executor`],
//! and hands failures back as resumable [`TaskFailure`]s instead of
//! aborting the whole run.

mod chain;
mod config;
mod environment;
mod executor;
mod failure;
mod job;
mod mapping;
mod output;
mod record;
mod registry;

pub use chain::{Chain, MappingChain, Stage, compose};
pub use config::{EnvironmentConfig, Options, PanicPolicy, Pipeline, PipelineError, Step};
pub use environment::{Environment, ExecuteError, Run, RunSummary};
#[cfg(feature = "parallel")]
pub use executor::PoolExecutor;
pub use executor::{Executor, SimpleExecutor, SlotPermit, Slots, SubmitError, Task};
pub use failure::{FailureListener, RetryError, TaskFailure};
pub use job::{Job, JobId};
pub use mapping::{FnMapping, Identity, MapError, Mapping, from_fn};
pub use output::{OutputFactory, StagedOutput, StagedOutputFactory};
pub use record::{Collector, IterReader, Output, OutputError, ReadError, Reader, Record};
pub use registry::{MappingDecl, MappingRegistry, RegistryError, StageFactory};
