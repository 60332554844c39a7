use anyhow::{bail, Context};
use clap::Parser;
use gcodestream::{
    init_logging, list_ports, Config, ControllerEvent, ControllerTrait, ControllerType,
    FileStreamReader, FirmwareController,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Stream a G-code program to a CNC controller
#[derive(Debug, Parser)]
#[command(
    name = "gcodestream",
    version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_DATE"), ")"),
    about
)]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Firmware on the controller: grbl, fluidnc, smoothie or tinyg
    #[arg(long, value_name = "F")]
    firmware: Option<ControllerType>,

    /// Serial port, host name or WebSocket URL
    #[arg(long, value_name = "P")]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, value_name = "B")]
    baud: Option<u32>,

    /// First program row to send (1-based); earlier rows only restore modal state
    #[arg(long, value_name = "N")]
    start_row: Option<usize>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// G-code program to stream
    #[arg(required_unless_present = "list_ports")]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs)?;

    if args.list_ports {
        for port in list_ports()? {
            println!("{}\t{}", port.port_name, port.description);
        }
        return Ok(());
    }

    let config = load_config(&args)?;
    let Some(path) = args.file.as_ref() else {
        bail!("no program file given");
    };

    let mut reader = FileStreamReader::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    if let Some(row) = args.start_row {
        reader
            .start_from_row(row)
            .with_context(|| format!("cannot start from row {}", row))?;
    }

    let params = config.connection.to_params();
    let controller =
        FirmwareController::new(config.streaming.firmware, config.controller_config());
    let mut events = controller.subscribe();

    tracing::info!(
        "Connecting to {} at {}",
        config.streaming.firmware,
        params.address()
    );
    controller.connect(&params).await?;

    let timeout = Duration::from_millis(config.connection.timeout_ms);
    let result = match wait_until_ready(&controller, &mut events, timeout).await {
        Ok(()) => stream(&controller, &mut events, Box::new(reader)).await,
        Err(e) => Err(e),
    };

    controller.disconnect().await?;
    result
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("cannot load {}", path.display()))?,
        None => {
            let path = Config::default_path()?;
            Config::load_or_default(&path)
                .with_context(|| format!("cannot load {}", path.display()))?
        }
    };

    if let Some(firmware) = args.firmware {
        config.streaming.firmware = firmware;
    }
    if let Some(port) = &args.port {
        config.connection.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.connection.baud_rate = baud;
    }
    config.validate()?;
    Ok(config)
}

async fn wait_until_ready(
    controller: &FirmwareController,
    events: &mut broadcast::Receiver<ControllerEvent>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !controller.is_ready() {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(ControllerEvent::FirmwareVersion(version))) => {
                tracing::info!("Firmware: {}", version)
            }
            Ok(Ok(ControllerEvent::Disconnected { reason })) => {
                bail!(
                    "disconnected before the controller was ready: {}",
                    reason.unwrap_or_else(|| "link closed".to_string())
                )
            }
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) => bail!("controller event channel closed"),
            Err(_) => bail!("controller not ready after {} ms", timeout.as_millis()),
        }
    }
    Ok(())
}

async fn stream(
    controller: &FirmwareController,
    events: &mut broadcast::Receiver<ControllerEvent>,
    program: Box<dyn gcodestream::GcodeStreamReader>,
) -> anyhow::Result<()> {
    controller.send(program).await?;

    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("Interrupted, cancelling");
                controller.cancel().await?;
                continue;
            }
        };

        match event {
            Ok(ControllerEvent::StreamStarted { rows }) => println!("Streaming {} rows", rows),
            Ok(ControllerEvent::CommandComplete(command)) => {
                let progress = controller.progress();
                if !command.is_ok() {
                    let reason = command
                        .failure
                        .as_ref()
                        .map(|f| f.message.as_str())
                        .unwrap_or("unknown error");
                    println!("{}: {}", command, reason);
                }
                if command.line_number.is_some() {
                    println!(
                        "{}/{} ({:.1}%)",
                        progress.completed_rows,
                        progress.total_rows,
                        progress.percent_complete()
                    );
                }
            }
            Ok(ControllerEvent::CommandSkipped(command)) => {
                tracing::debug!("Skipped {}", command)
            }
            Ok(ControllerEvent::Alarm { code, message }) => {
                println!("ALARM:{} {}", code, message)
            }
            Ok(ControllerEvent::StreamPausedOnError(command)) => {
                controller.cancel().await?;
                settle(controller).await;
                bail!("stream halted on {}", command);
            }
            Ok(ControllerEvent::StreamCanceled) => {
                settle(controller).await;
                bail!("stream cancelled");
            }
            Ok(ControllerEvent::StreamComplete {
                success,
                duration_ms,
            }) => {
                let progress = controller.progress();
                println!(
                    "Finished {} rows in {:.1}s",
                    progress.completed_rows,
                    duration_ms as f64 / 1000.0
                );
                if !success {
                    bail!("{} rows failed", progress.error_rows);
                }
                return Ok(());
            }
            Ok(ControllerEvent::Disconnected { reason }) => bail!(
                "connection lost: {}",
                reason.unwrap_or_else(|| "link closed".to_string())
            ),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => tracing::warn!("Missed {} events", skipped),
            Err(RecvError::Closed) => bail!("controller event channel closed"),
        }
    }
}

/// Let a cancel bring the machine to rest before the link is dropped
async fn settle(controller: &FirmwareController) {
    let drain = Duration::from_millis(controller.config().drain_timeout_ms);
    if !controller
        .wait_for_cancel(drain * 2 + Duration::from_secs(1))
        .await
    {
        eprintln!("Cancel did not finish, disconnecting anyway");
    }
}
