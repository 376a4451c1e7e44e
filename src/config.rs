use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Run configuration. Usually assembled from CLI flags; a TOML file with the
/// same field names can seed it first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// dump the entry disassembly, initial stack and registers before running
    pub verbose: bool,
    pub trace_sys: bool,
    pub trace_mem: bool,
    pub trace_mem_batch: bool,
    pub trace_exec: bool,
    pub trace_reg: bool,
    /// symbols or hex addresses gating per-instruction and memory traces;
    /// empty means trace everything
    pub trace_match: Vec<String>,
    /// how many caller frames are also tested against `trace_match`
    pub trace_match_depth: usize,
    pub demangle: bool,
    /// collapse repeating block chains up to this length; 0 disables
    pub loop_collapse: usize,
    pub force_base: u64,
    pub force_interp_base: u64,
    /// emulated root: absolute guest paths are retried under this prefix
    pub load_prefix: Option<PathBuf>,
}
