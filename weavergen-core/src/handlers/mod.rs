//! Built-in service task set for semantic-convention code generation.
//!
//! These are the production handlers behind the `Generate` pipeline:
//! a YAML semantic-convention loader, deterministic model/agent/validator
//! generators, an integration step and a file-writing output task. Every
//! one of them has a schema-correct mock substitute by construction.

mod generation;
mod semantic;

use crate::error::EngineResult;
use crate::registry::ServiceTaskRegistry;
use std::path::PathBuf;

/// Register the full built-in task set. `out_dir` is where the output
/// task writes generated files.
pub fn register_builtin_tasks(
    registry: &mut ServiceTaskRegistry,
    out_dir: PathBuf,
) -> EngineResult<()> {
    semantic::register(registry)?;
    generation::register(registry, out_dir)?;
    Ok(())
}
