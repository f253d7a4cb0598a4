//! BPMN-first workflow engine for code-generation pipelines.
//!
//! The process definition is the program: this crate parses a BPMN 2.0
//! subset into a graph, interprets it with parallel-gateway concurrency,
//! per-task cancellation and retry/compensation policies, records every
//! step as spans, and derives a quality verdict from the span set. A
//! mining layer consumes completed traces and proposes optimized process
//! variants.

pub mod artifacts;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod mining;
pub mod mock;
pub mod model;
pub mod policy;
pub mod quality;
pub mod recorder;
pub mod registry;
pub mod truth;
pub mod types;
pub mod xes;

pub use config::EngineConfig;
pub use engine::{NodeState, RunResult, RunStatus, WorkflowEngine};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use model::{load_process, ProcessModel};
pub use quality::QualityScore;
pub use recorder::{SpanHandle, SpanRecord, SpanRecorder, SpanStatus};
pub use registry::{
    FnHandler, HandlerFailure, IoBinding, ServiceTaskRegistry, TaskCategory, TaskDefinition,
    TaskHandler,
};
pub use types::{Backoff, MergeRule, RetryPolicy, Value, ValueType};
