use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use etoad_service::{load_file, ProtocolDefinition, TaskKind};

/// Validate a protocol file without running it
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the protocol file (JSON or YAML)
    pub protocol: PathBuf,

    /// List every step with its parameters and update rules
    #[arg(long)]
    pub verbose: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let protocol_path = &args.protocol;

    if !protocol_path.exists() {
        color_eyre::eyre::bail!("Protocol file not found: {}", protocol_path.display());
    }

    output::status("Validating", &format!("{}", protocol_path.display()));

    // Parsing covers schema, step order and expression checks
    let protocol = match load_file(protocol_path) {
        Ok(p) => p,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    output::check(&format!("Protocol '{}' parsed", protocol.name));

    let rules: usize = protocol.steps.iter().map(|s| s.update_rules.len()).sum();
    let dilutions = protocol
        .steps
        .iter()
        .filter(|s| s.task == TaskKind::Dilute)
        .count();
    output::check(&format!(
        "Structure: {} steps ({} dilutions), {} update rules",
        protocol.steps.len(),
        dilutions,
        rules
    ));
    output::check("Update rules only reference earlier steps");

    if args.verbose {
        print_steps(&protocol);
    }

    println!();
    output::success("Protocol is valid");

    Ok(())
}

fn print_steps(protocol: &ProtocolDefinition) {
    println!();
    output::header("Steps");
    for (index, step) in protocol.steps.iter().enumerate() {
        let technique = if step.technique.is_empty() {
            String::new()
        } else {
            format!(" {}", step.technique)
        };
        output::info(&format!("{}. {} [{}{}]", index + 1, step.name, step.task, technique));

        for (name, value) in &step.parameters {
            output::dim(&format!("       {} = {}", name, value));
        }
        for rule in &step.update_rules {
            let selection = match &rule.selection {
                None => String::new(),
                Some(s) => {
                    let filters: Vec<String> = s
                        .filters
                        .iter()
                        .map(|f| format!("{}: {}", f.key, f.predicate))
                        .collect();
                    format!(
                        " where [{}] pick {}: {}",
                        filters.join(", "),
                        s.pick.key,
                        s.pick.aggregator
                    )
                }
            };
            output::dim(&format!(
                "       {} <- {}.{}{}",
                rule.target, rule.source_step, rule.source_key, selection
            ));
        }
    }
}
