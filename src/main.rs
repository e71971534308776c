use warehouse_mapf::communicator::TracingCommunicator;
use warehouse_mapf::config::{Cli, Config};
use warehouse_mapf::graph::Graph;
use warehouse_mapf::scenario::Scenario;
use warehouse_mapf::simulation::Simulation;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let config = if let Some(config_file) = cli.config.as_ref() {
        Config::from_yaml_file(config_file)?
    } else {
        info!("No config file specified, using default config");
        Config::default()
    }
    .override_from_command_line(&cli)?;

    let graph = Graph::from_map_file(&config.map_path, config.spacing)
        .with_context(|| format!("error loading map {}", config.map_path))?;

    let scenario = match &config.scenario_path {
        Some(path) => Scenario::load_from_file(path)
            .with_context(|| format!("error loading scenario {path}"))?,
        None => {
            let mut rng = StdRng::seed_from_u64(config.planner.seed);
            let scenario = Scenario::generate_randomly(&graph, config.num_agents, &mut rng)?;
            scenario
                .write_to_file("debug.yaml")
                .context("error writing generated scenario")?;
            scenario
        }
    };
    let agents = scenario.to_agents(&graph, config.physics)?;
    info!(
        "simulating {} agents with {:?} for {} cycles",
        agents.len(),
        config.strategy,
        config.cycles
    );

    let mut simulation = Simulation::new(&graph, &config, agents, Box::new(TracingCommunicator));
    let report = simulation.run(config.cycles);

    if let Some(path) = &config.output_path {
        report
            .write_to_file(path)
            .with_context(|| format!("error writing report {path}"))?;
        info!("report written to {path}");
    }
    Ok(())
}
