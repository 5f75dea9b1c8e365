// Remote commands talking to a running etoad server

use crate::output;

use std::time::Duration;

use clap::Args;
use color_eyre::Result;
use futures::StreamExt;

use etoad_rpc::{EtoadRpcClient, ExecutionInfo, ExecutionStatus, RpcError};

/// How long `status` waits for more backlog before reporting
const STATUS_SETTLE: Duration = Duration::from_millis(100);

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Job file; relative paths resolve against the server's protocol directory
    pub job_file: String,

    /// Follow the status stream until the job finishes
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args, Debug)]
pub struct ExecutionArgs {
    /// Execution identifier returned by `submit`
    pub execution_id: String,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Execution identifier returned by `submit`
    pub execution_id: String,

    /// Show intermediate payloads instead of status updates
    #[arg(long)]
    pub payloads: bool,
}

fn print_info(info: &ExecutionInfo) {
    let step = match (&info.step_index, &info.step_name) {
        (Some(index), Some(name)) => format!(" step {} '{}'", index + 1, name),
        _ => String::new(),
    };
    let message = info
        .message
        .as_deref()
        .map(|m| format!(" - {}", m))
        .unwrap_or_default();
    output::status(
        &info.status.to_string(),
        &format!("{}{}{}", output::progress_bar(info.progress), step, message),
    );
}

/// Exit non-zero unless the job succeeded
fn finish(status: ExecutionStatus) {
    if status != ExecutionStatus::Succeeded {
        std::process::exit(1);
    }
}

async fn follow_status(client: &mut EtoadRpcClient, id: &str) -> Result<Option<ExecutionStatus>> {
    let mut stream = client.watch_status(id).await?;
    let mut last = None;
    while let Some(info) = stream.next().await {
        let info = info?;
        print_info(&info);
        last = Some(info.status);
    }
    Ok(last)
}

pub async fn submit(client: &mut EtoadRpcClient, args: SubmitArgs) -> Result<()> {
    output::status("Submitting", &args.job_file);
    let id = client.run_job(&args.job_file).await?;
    // The bare id on stdout so scripts can capture it
    println!("{}", id);

    if args.wait {
        if let Some(status) = follow_status(client, &id).await? {
            let (_, message) = client.result(&id).await?;
            output::info(&message);
            finish(status);
        }
    }
    Ok(())
}

pub async fn status(client: &mut EtoadRpcClient, args: ExecutionArgs) -> Result<()> {
    let info = client.status(&args.execution_id, STATUS_SETTLE).await?;
    print_info(&info);
    Ok(())
}

pub async fn watch(client: &mut EtoadRpcClient, args: WatchArgs) -> Result<()> {
    if args.payloads {
        let mut stream = client.watch_intermediate(&args.execution_id).await?;
        while let Some(payload) = stream.next().await {
            let payload = payload?;
            output::payload(&payload.step_name, &payload.status, payload.payload.len());
        }
        return Ok(());
    }

    if let Some(status) = follow_status(client, &args.execution_id).await? {
        finish(status);
    }
    Ok(())
}

pub async fn result(client: &mut EtoadRpcClient, args: ExecutionArgs) -> Result<()> {
    match client.result(&args.execution_id).await {
        Ok((status, message)) => {
            println!("{}", message);
            match status {
                ExecutionStatus::Succeeded => output::success(&status.to_string()),
                _ => output::failure(&status.to_string()),
            }
            finish(status);
            Ok(())
        }
        Err(err @ RpcError::Unavailable(_)) => {
            output::warning(&format!("{}; try `etoad watch {}`", err, args.execution_id));
            std::process::exit(2);
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn cancel(client: &mut EtoadRpcClient, args: ExecutionArgs) -> Result<()> {
    let status = client.cancel(&args.execution_id).await?;
    match status {
        ExecutionStatus::Running => {
            output::info("Cancellation requested; the job stops after its current step")
        }
        ExecutionStatus::Cancelled => output::check("Job cancelled"),
        other => output::info(&format!("Job already {}", other)),
    }
    Ok(())
}

pub async fn list(client: &mut EtoadRpcClient) -> Result<()> {
    let jobs = client.list().await?;
    if jobs.is_empty() {
        output::dim("No executions");
        return Ok(());
    }
    for job in jobs {
        println!("{}  {:<10} {}", job.execution_id, job.status.to_string(), job.protocol_name);
    }
    Ok(())
}
