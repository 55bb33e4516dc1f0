//! CLI entry point for graphitizer.
//!
//! ```bash
//! graphitizer serve                      # HTTP API + telemetry loop
//! graphitizer --simulate serve           # same, against the in-process simulator
//! graphitizer set V00 255                # one confirmed write
//! graphitizer set PUMP_ON
//! graphitizer snapshot
//! graphitizer params
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use graphitizer::api::ApiServer;
use graphitizer::config::{Settings, DEFAULT_CONFIG_PATH};
use graphitizer::confirmation::ConfirmationEngine;
use graphitizer::hardware::{
    ChannelConnector, ChannelGate, SerialConnector, SimulatedConnector, SimulatedDevice,
};
use graphitizer::logging;
use graphitizer::protocol::{FrameCodec, ParameterRegistry};
use graphitizer::service::DeviceService;
use graphitizer::storage::{InfluxSink, LogSink, TelemetrySink};
use graphitizer::telemetry::TelemetryLoop;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "graphitizer")]
#[command(about = "Serial middleware for the graphitizer controller", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the in-process simulated controller instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the telemetry loop until Ctrl-C
    Serve,

    /// Print one fresh frame as JSON
    Snapshot,

    /// Send one write and print the confirming frame
    Set {
        /// Parameter name (V00..V08, T01..T08, PUMP_ON, PUMP_OFF)
        param: String,

        /// Value for levels and thresholds
        value: Option<String>,
    },

    /// List writable parameters
    Params,
}

/// Everything that shares the device channel.
struct Runtime {
    gate: Arc<ChannelGate>,
    codec: FrameCodec,
    sink: Arc<dyn TelemetrySink>,
    service: Arc<DeviceService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate().context("invalid configuration")?;
    logging::init(settings.logging.to_logging_config()?).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Params => {
            print_params();
            Ok(())
        }
        Commands::Serve => serve(&settings, cli.simulate).await,
        Commands::Snapshot => {
            let runtime = build_runtime(&settings, cli.simulate).await?;
            let frame = runtime.service.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&frame)?);
            Ok(())
        }
        Commands::Set { param, value } => {
            let runtime = build_runtime(&settings, cli.simulate).await?;
            let frame = runtime.service.set(&param, value.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&frame)?);
            Ok(())
        }
    }
}

async fn serve(settings: &Settings, simulate: bool) -> Result<()> {
    let runtime = build_runtime(settings, simulate).await?;

    let telemetry = TelemetryLoop::new(
        runtime.gate.clone(),
        runtime.codec,
        runtime.sink.clone(),
        settings.telemetry.interval,
    )
    .with_measurement(settings.telemetry.measurement.clone())
    .spawn();

    let api = ApiServer::new(settings.api.listen, runtime.service.clone())
        .spawn()
        .await
        .with_context(|| format!("binding {}", settings.api.listen))?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");

    api.shutdown().await.context("HTTP API task failed")?;
    let stats = telemetry.stop().await.context("telemetry task failed")?;
    tracing::info!(?stats, "Stopped");
    Ok(())
}

async fn build_runtime(settings: &Settings, simulate: bool) -> Result<Runtime> {
    let connector: Arc<dyn ChannelConnector> = if simulate {
        tracing::warn!("Using simulated controller");
        Arc::new(SimulatedConnector::new(
            SimulatedDevice::new().with_settle_polls(2),
        ))
    } else {
        Arc::new(SerialConnector::new(
            settings.device.locator()?,
            settings.device.baud_rate,
        ))
    };

    let gate = Arc::new(
        ChannelGate::open(connector, settings.device.read_timeout)
            .await
            .context("acquiring device channel")?,
    );
    let codec = FrameCodec::new(settings.device.frame);

    let sink: Arc<dyn TelemetrySink> = if settings.sink.enabled && !simulate {
        Arc::new(
            InfluxSink::new(
                &settings.sink.url,
                settings.sink.database.clone(),
                settings.sink.retention_policy.clone(),
                settings.sink.timeout,
            )
            .context("building InfluxDB client")?,
        )
    } else {
        Arc::new(LogSink)
    };

    let engine = ConfirmationEngine::new(gate.clone(), codec, settings.confirmation);
    let service = Arc::new(DeviceService::new(
        Arc::new(ParameterRegistry::new()),
        engine,
        sink.clone(),
        settings.telemetry.measurement.clone(),
    ));

    Ok(Runtime {
        gate,
        codec,
        sink,
        service,
    })
}

fn print_params() {
    let registry = ParameterRegistry::new();
    println!("{:<10} {:<10} {:<12}", "NAME", "CLASS", "RANGE");
    for spec in registry.specs() {
        let range = spec
            .range
            .map(|(min, max)| format!("{min}..={max}"))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<10} {:<10} {:<12}", spec.name, format!("{:?}", spec.class), range);
    }
}
