//! The scgen command line.
//! Usage:
//!    scgen \[--output-dir DIR\] \[--template-dir DIR\] \[--as-child\] \<scxml-file\>

use std::env;
use std::path::PathBuf;
use std::process;

use ruscgen::common::{error, info, init_logging, parse_cli, USAGE};
use ruscgen::strategy::MachineStrategy;

fn main() {
    init_logging();

    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_cli(&args) {
        Ok(options) => options,
        Err(e) => {
            error!("{}", e);
            error!("{}", USAGE);
            process::exit(1);
        }
    };

    let scxml_file = PathBuf::from(&options.scxml_file);
    if !scxml_file.exists() {
        error!("SCXML file not found: {}", scxml_file.display());
        process::exit(1);
    }

    let output_dir = options
        .output_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let template_dir = options.template_dir.map(PathBuf::from);

    match ruscgen::generate(
        &scxml_file,
        &output_dir,
        template_dir.as_deref(),
        options.as_child,
    ) {
        Ok((model, machine, outcome)) => {
            info!("Generating code for: {}", model.name);
            info!("  States: {}", model.states.len());
            info!("  Events: {}", model.events.len());
            info!("  Needs script engine: {}", model.flags.needs_script_engine);
            if let MachineStrategy::InterpreterWrapper { reason } = &machine {
                info!("  -> interpreter wrapper ({})", reason);
            }
            info!("  Generated: {}", outcome.unit_path.display());
            if let Some(manifest) = &outcome.manifest_path {
                info!("  Child metadata: {}", manifest.display());
            }
        }
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}
