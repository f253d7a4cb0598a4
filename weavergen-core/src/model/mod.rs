//! The process model: the in-memory graph the interpreter executes.

pub mod export;
pub mod expr;
pub mod ir;
pub mod parser;
pub mod verifier;

pub use expr::Expr;
pub use ir::{
    BoundaryKind, FlowNode, GatewayDirection, ProcessGraph, ProcessModel, SequenceFlow, TaskNode,
};

use crate::error::EngineResult;

/// Parse and verify a BPMN definition, producing an executable model with
/// its parallel split/join pairs resolved.
pub fn load_process(xml: &str) -> EngineResult<ProcessModel> {
    let mut model = parser::parse_bpmn(xml)?;
    verifier::verify_or_err(&model)?;
    model.parallel_pairs = verifier::parallel_pairs(&model)?;
    Ok(model)
}
