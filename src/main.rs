use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;

use uemu::config::Config;
use uemu::emulator::Emulator;
use uemu::errors::EmulatorError;

#[derive(Parser)]
#[clap(name = "uemu", about = "Run a foreign-architecture binary by emulating its CPU and servicing its syscalls on the host.")]
struct Options {
    /// TOML config file; flags below override its fields.
    #[clap(long = "config")]
    config_file: Option<PathBuf>,

    /// Emulated root: absolute guest paths are retried under this prefix.
    #[clap(long)]
    prefix: Option<PathBuf>,

    #[clap(short, long)]
    verbose: bool,

    /// Trace system calls.
    #[clap(long = "sys")]
    trace_sys: bool,

    /// Trace memory accesses.
    #[clap(long = "mem")]
    trace_mem: bool,

    /// Batch adjacent memory accesses into one trace entry.
    #[clap(long = "membatch")]
    trace_mem_batch: bool,

    /// Trace each executed instruction.
    #[clap(long = "exec")]
    trace_exec: bool,

    /// Trace register deltas.
    #[clap(long = "regs")]
    trace_reg: bool,

    /// Only trace these symbols or hex addresses (repeatable).
    #[clap(long = "match")]
    trace_match: Vec<String>,

    /// Also match this many caller frames.
    #[clap(long = "match-depth", default_value_t = 0)]
    trace_match_depth: usize,

    #[clap(long)]
    demangle: bool,

    /// Collapse repeating block chains up to this length.
    #[clap(long = "loop", default_value_t = 0)]
    loop_collapse: usize,

    /// Force the main image load address.
    #[clap(long = "base", value_parser = parse_addr, default_value = "0")]
    force_base: u64,

    /// Force the interpreter load address.
    #[clap(long = "interp-base", value_parser = parse_addr, default_value = "0")]
    force_interp_base: u64,

    /// exec file
    exec: PathBuf,
    args: Vec<String>,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("bad address {:?}: {}", s, e))
}

fn build_config(opts: &Options) -> Result<Config, EmulatorError> {
    let mut config: Config = match &opts.config_file {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)
            .map_err(|e| EmulatorError::Custom(anyhow!("bad config: {}", e)))?,
        None => Config::default(),
    };
    config.verbose |= opts.verbose;
    config.trace_sys |= opts.trace_sys;
    config.trace_mem |= opts.trace_mem;
    config.trace_mem_batch |= opts.trace_mem_batch;
    config.trace_exec |= opts.trace_exec;
    config.trace_reg |= opts.trace_reg;
    config.demangle |= opts.demangle;
    if !opts.trace_match.is_empty() {
        config.trace_match = opts.trace_match.clone();
    }
    if opts.trace_match_depth > 0 {
        config.trace_match_depth = opts.trace_match_depth;
    }
    if opts.loop_collapse > 0 {
        config.loop_collapse = opts.loop_collapse;
    }
    if opts.force_base > 0 {
        config.force_base = opts.force_base;
    }
    if opts.force_interp_base > 0 {
        config.force_interp_base = opts.force_interp_base;
    }
    if let Some(prefix) = &opts.prefix {
        config.load_prefix = Some(prefix.clone());
    }
    Ok(config)
}

fn main() -> Result<(), EmulatorError> {
    env_logger::init();
    let opts = Options::parse();
    let config = build_config(&opts)?;

    let argv = {
        let mut a = opts.args.clone();
        a.insert(0, opts.exec.display().to_string());
        a
    };
    let env: Vec<String> = std::env::vars().map(|(k, v)| format!("{}={}", k, v)).collect();

    let mut emu = Emulator::new(&opts.exec, config)?;
    match emu.run(&argv, &env) {
        Err(EmulatorError::ExitStatus(status)) => std::process::exit(status),
        other => other,
    }
}
