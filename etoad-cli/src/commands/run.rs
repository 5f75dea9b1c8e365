use crate::output;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use etoad_service::execution::progress_channel;
use etoad_service::{
    load_file, ExecutionEvent, ExecutionStatus, ProtocolEngine, ServiceConfig, SimulatedCapability,
    StepStatus,
};

/// Run a protocol in process against the simulated capability
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the protocol file (JSON or YAML)
    pub protocol: PathBuf,

    /// Simulated analysis outputs, keyed by technique or step name
    #[arg(long, value_name = "FILE")]
    pub outputs: Option<PathBuf>,

    /// Intermediate payloads emitted per measurement step
    #[arg(long, value_name = "N")]
    pub payloads: Option<u32>,

    /// Delay before each payload, in milliseconds
    #[arg(long, value_name = "MS")]
    pub delay_ms: Option<u64>,
}

pub async fn execute(args: RunArgs, config: &ServiceConfig) -> Result<()> {
    let protocol_path = &args.protocol;

    if !protocol_path.exists() {
        color_eyre::eyre::bail!("Protocol file not found: {}", protocol_path.display());
    }

    output::status("Loading", &format!("{}", protocol_path.display()));
    let protocol = load_file(protocol_path)?;
    output::info(&format!(
        "Protocol '{}': {} steps",
        protocol.name,
        protocol.steps.len()
    ));

    let mut simulation = config.simulation.clone();
    if args.outputs.is_some() {
        simulation.outputs_file = args.outputs;
    }
    if let Some(payloads) = args.payloads {
        simulation.payloads_per_step = payloads;
    }
    if let Some(delay_ms) = args.delay_ms {
        simulation.step_delay_ms = delay_ms;
    }
    let capability = SimulatedCapability::from_config(&simulation)?;

    let engine = ProtocolEngine::new(Arc::new(capability));

    // Ctrl-C stops the run at the next step boundary
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, stopping after the current step");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let (tx, mut rx) = progress_channel();
    let total_steps = protocol.steps.len();
    let exec_handle = tokio::spawn(async move { engine.execute(&protocol, &tx).await });

    while let Some(event) = rx.recv().await {
        match &event {
            ExecutionEvent::ProtocolStarted {
                protocol_name,
                total_steps,
            } => {
                println!();
                output::header(&format!("Protocol '{}' ({} steps)", protocol_name, total_steps));
            }

            ExecutionEvent::StepStarted {
                step_name,
                step_index,
                parameters,
            } => {
                output::status(
                    "Running",
                    &format!("[{}/{}] {}", step_index + 1, total_steps, step_name),
                );
                for (name, value) in parameters {
                    output::dim(&format!("              {} = {}", name, value));
                }
            }

            ExecutionEvent::IntermediatePayload {
                step_name,
                label,
                payload,
                ..
            } => output::payload(step_name, label, payload.len()),

            ExecutionEvent::StepCompleted {
                step_name,
                status,
                outputs,
                error,
                duration,
                ..
            } => {
                if *status == StepStatus::Succeeded {
                    output::success(&format!(
                        "{} ({:.2}s, {} outputs)",
                        step_name,
                        duration.as_secs_f64(),
                        outputs.len()
                    ));
                } else {
                    output::failure(&format!(
                        "{}: {}",
                        step_name,
                        error.as_deref().unwrap_or("failed")
                    ));
                }
            }

            ExecutionEvent::StepSkipped {
                step_name, reason, ..
            } => output::warning(&format!("{} skipped ({})", step_name, reason)),

            ExecutionEvent::StepFailed {
                step_name, error, ..
            } => output::failure(&format!("{}: {}", step_name, error)),

            ExecutionEvent::ProtocolCompleted { .. } => println!(),
        }
    }

    let outcome = exec_handle.await?;
    match outcome.status {
        ExecutionStatus::Succeeded => output::success(&format!(
            "{} in {:.2}s ({} steps with outputs)",
            outcome.termination_message,
            outcome.duration.as_secs_f64(),
            outcome.outputs.len()
        )),
        _ => {
            output::failure(&format!("{}: {}", outcome.status, outcome.termination_message));
            std::process::exit(1);
        }
    }

    Ok(())
}
