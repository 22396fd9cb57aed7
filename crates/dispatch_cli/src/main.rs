use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dispatch_core::geo::GeoPoint;
use dispatch_core::model::{DriverId, TerritoryId, VerificationMethod};
use dispatch_core::resolver::Resolution;
use dispatch_core::territory::{InMemoryTerritoryStore, TerritoryCatalog};
use dispatch_core::test_helpers::seeded_territory_store;
use dispatch_core::{DispatchEngine, EngineConfig};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod simulate;

#[derive(Parser)]
#[command(
    name = "dispatch",
    about = "Territorial dispatch engine tools",
    long_about = "Resolve territories, estimate platform fees and run synthetic\n\
                  dispatch simulations against a territory catalog."
)]
struct Cli {
    /// Territory catalog (JSON). Defaults to the built-in Bogotá sample.
    #[arg(long, global = true, env = "DISPATCH_TERRITORIES")]
    territories: Option<PathBuf>,

    /// Engine config (JSON). Unset fields keep their defaults.
    #[arg(long, global = true, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a coordinate to a territory
    Resolve {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
    },
    /// Classify a trip and compute the platform fee for a driver home
    EstimateFee {
        /// Driver home territory id; omit for a driver without home
        #[arg(long)]
        home: Option<u32>,
        #[arg(long, allow_hyphen_values = true)]
        pickup_lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        pickup_lng: f64,
        #[arg(long, allow_hyphen_values = true)]
        dropoff_lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        dropoff_lng: f64,
        /// Fare to split; defaults to the distance-based estimate
        #[arg(long)]
        fare: Option<f64>,
    },
    /// Run a synthetic request/offer/trip simulation and print a summary
    Simulate(simulate::SimulateArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_territories(path: Option<&PathBuf>) -> Result<InMemoryTerritoryStore> {
    let Some(path) = path else {
        return Ok(seeded_territory_store());
    };
    let catalog = TerritoryCatalog::from_path(path)
        .with_context(|| format!("loading territories from {}", path.display()))?;
    let store = InMemoryTerritoryStore::from_catalog(catalog)?;
    info!(territories = store.len(), path = %path.display(), "territory catalog loaded");
    Ok(store)
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("loading engine config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn build_engine(territories: Arc<InMemoryTerritoryStore>, config: EngineConfig) -> Result<DispatchEngine> {
    Ok(DispatchEngine::builder(territories).with_config(config).build()?)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let territories = Arc::new(load_territories(cli.territories.as_ref())?);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Resolve { lat, lng } => {
            let engine = build_engine(territories, config)?;
            let output = match engine.resolve_territory(GeoPoint::new(lat, lng)) {
                Resolution::Resolved(territory) => json!({
                    "resolved": true,
                    "territory_id": territory.id,
                    "name": territory.name,
                    "official": territory.shape.is_official(),
                }),
                Resolution::Unresolved => json!({ "resolved": false }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::EstimateFee {
            home,
            pickup_lat,
            pickup_lng,
            dropoff_lat,
            dropoff_lng,
            fare,
        } => {
            let engine = build_engine(territories, config)?;
            let pickup = GeoPoint::new(pickup_lat, pickup_lng).validate()?;
            let dropoff = GeoPoint::new(dropoff_lat, dropoff_lng).validate()?;
            let fare = fare.unwrap_or_else(|| engine.config().fares.fare_for(pickup, dropoff));

            let driver = DriverId::new();
            engine.register_driver(driver)?;
            if let Some(home) = home {
                engine.bind_home_territory(driver, TerritoryId(home), VerificationMethod::Admin)?;
            }
            let estimate = engine.estimate_fee(driver, pickup, dropoff, fare)?;
            println!("{}", serde_json::to_string_pretty(&estimate)?);
        }
        Commands::Simulate(args) => {
            let summary = simulate::run(territories, config, &args)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
