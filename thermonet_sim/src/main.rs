//! thermonet simulator CLI
//!
//! Run deterministic building simulations through fault scenarios.

use clap::Parser;
use thermonet_core::{BuildingConfig, DeviceFamily, EngineConfig};
use thermonet_sim::scenarios::ScenarioId;
use thermonet_sim::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// thermonet deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "thermonet-sim")]
#[command(about = "Run deterministic building simulations for thermonet", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (steady_state, heating_only, actuator_outage,
    /// sensor_outage, malformed_agent, consistency_fault, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Ticks per scenario
    #[arg(short, long, default_value = "30")]
    ticks: u64,

    /// Device families to deploy (a = heater branch, b = cooler branch)
    #[arg(short, long, value_delimiter = ',', default_value = "a,b")]
    families: Vec<String>,

    /// Std-dev (K) of Gaussian sensor noise
    #[arg(long)]
    noise: Option<f64>,

    /// Building JSON file (default: the eight-room demo building)
    #[arg(short, long)]
    config: Option<String>,

    /// Engine tuning JSON file
    #[arg(long)]
    engine: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn parse_family(name: &str) -> Result<DeviceFamily, String> {
    match name.trim().to_lowercase().as_str() {
        "a" | "heater" => Ok(DeviceFamily::A),
        "b" | "cooler" => Ok(DeviceFamily::B),
        other => Err(format!("Unknown device family: {}", other)),
    }
}

fn load_engine_config(path: &str) -> Result<EngineConfig, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e))?;
    let config: EngineConfig = serde_json::from_str(&text).map_err(|e| format!("{}: {}", path, e))?;
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    if !args.json {
        info!("thermonet simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e: String| {
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            fail(&format!("{} (available: {}, all)", e, names.join(", ")))
        })]
    };

    let families: Vec<DeviceFamily> = args
        .families
        .iter()
        .map(|f| parse_family(f))
        .collect::<Result<_, _>>()
        .unwrap_or_else(|e| fail(&e));

    let building = match &args.config {
        Some(path) => BuildingConfig::from_json_file(path).unwrap_or_else(|e| fail(&e.to_string())),
        None => BuildingConfig::demo(),
    };
    let engine = match &args.engine {
        Some(path) => load_engine_config(path).unwrap_or_else(|e| fail(&e)),
        None => EngineConfig::default(),
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    // Run simulations
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let mut runner = ScenarioRunner::new(seed)
            .with_ticks(args.ticks)
            .with_building(building.clone())
            .with_engine_config(engine.clone())
            .with_families(&families);
        if let Some(std_dev) = args.noise {
            runner = runner.with_sensor_noise(std_dev);
        }

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED: {} ticks, mean {:.2}K",
                        scenario.name(),
                        seed,
                        result.total_ticks,
                        ScenarioMetrics::mean(&result.metrics.final_temperatures)
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => fail(&e.to_string()),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            // List failed seeds
            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
