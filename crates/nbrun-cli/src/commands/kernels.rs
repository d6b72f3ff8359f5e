//! `nbrun kernels` command.

use anyhow::Result;
use clap::Args;
use nbrun_host::{HostConfig, KernelSpec};

#[derive(Args, Debug)]
pub struct KernelsArgs {
    /// Extra kernel spec, `NAME=COMMAND ARGS...` (repeatable)
    #[arg(
        long = "kernel",
        value_name = "NAME=COMMAND",
        value_parser = KernelSpec::parse
    )]
    pub kernels: Vec<KernelSpec>,

    /// Print JSON lines instead of a table
    #[arg(long)]
    pub json: bool,
}

pub fn cmd_kernels(args: &KernelsArgs) -> Result<()> {
    let mut config = HostConfig::from_env();
    for spec in &args.kernels {
        config.upsert_kernel_spec(spec.clone());
    }
    if config.kernel_specs.is_empty() {
        eprintln!(
            "no kernel specs configured (set NBRUN_KERNEL_<NAME> or pass --kernel)"
        );
        return Ok(());
    }
    config.kernel_specs.sort_by(|a, b| a.name.cmp(&b.name));
    for spec in &config.kernel_specs {
        if args.json {
            let line = serde_json::json!({ "name": spec.name, "argv": spec.argv });
            println!("{line}");
        } else {
            println!("{}\t{}", spec.name, spec.argv.join(" "));
        }
    }
    Ok(())
}
