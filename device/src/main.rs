use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use crowd_sensor::actions::SystemCommandHandler;
use crowd_sensor::logging::{self, LogFormat};
use crowd_sensor::modem::Rak811Modem;
use crowd_sensor::net::{MqttPublisher, SensorIdentity};
use crowd_sensor::wifi::SystemWifi;
use crowd_sensor::{
    Config, CycleOutcome, DownlinkProtocol, Measurement, RetryQueueStore, SqliteStore,
    TransportProbe, TransportSelector, UplinkPublisher,
};

#[derive(Parser, Debug)]
#[command(name = "crowd-sensor", version, about = "Crowd-counting sensor uplink agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deliver one measurement, queueing it if no transport takes it
    Report {
        /// Number of devices detected in the window
        #[arg(long)]
        count: u64,
        /// Unix timestamp of the window; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Publish the configured coordinates over Wi-Fi
    Location,
    /// Probe both transports and try to bring dropped links back
    Check,
    /// Print the number of queued measurements
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(LogFormat::from_env())?;
    let cli = Cli::parse();

    let config = Config::load().context("loading sensor configuration")?;
    let store = SqliteStore::open(config.database_path())
        .with_context(|| format!("opening {}", config.database_path().display()))?;

    if let Commands::Pending = cli.command {
        println!("{}", store.pending_count()?);
        return Ok(());
    }

    let wifi = SystemWifi;
    let modem = Rak811Modem::from_config(&config);
    let selector = TransportSelector::new(TransportProbe::new(
        &store,
        &wifi,
        &modem,
        config.upload_interface.clone(),
    ));

    if let Commands::Check = cli.command {
        let report = selector.health_check().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let identity = SensorIdentity::resolve(&config, &wifi).await?;
    info!(uuid = %identity.uuid, name = %identity.name, "Sensor identity resolved");

    let mqtt = MqttPublisher::from_config(&config);
    let downlink = DownlinkProtocol::new(&store, identity.uuid.clone());
    let handler = SystemCommandHandler::from_config(&config);
    let publisher = UplinkPublisher::new(
        &selector,
        &store,
        &mqtt,
        &downlink,
        &handler,
        identity,
        config.topic_prefix.clone(),
    );

    match cli.command {
        Commands::Report { count, timestamp } => {
            let measurement = match timestamp {
                Some(ts) => Measurement::new(ts, count),
                None => Measurement::now(count),
            };
            match publisher.publish_cycle(measurement).await? {
                CycleOutcome::Delivered { drained } => info!(drained, "Cycle complete"),
                CycleOutcome::SentOverLora { command } => {
                    info!(?command, "Cycle complete over LoRa")
                }
                CycleOutcome::Queued { reason } => {
                    warn!(error = %reason, "Measurement queued for a later cycle")
                }
            }
        }
        Commands::Location => {
            let (Some(latitude), Some(longitude)) = (config.latitude, config.longitude) else {
                bail!("latitude and longitude are not configured");
            };
            if let Err(e) = publisher.publish_location(latitude, longitude).await {
                error!(error = %e, "Location not published");
                return Err(e.into());
            }
        }
        Commands::Check | Commands::Pending => {}
    }

    Ok(())
}
