use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::deadlock::DEFAULT_MAXIMUM_WAIT_TIME;
use crate::physics::Physics;

#[derive(Parser, Debug)]
#[command(
    name = "Warehouse MAPF",
    about = "Real-time multi-agent path finding for warehouse robots.",
    version = "1.0"
)]
pub struct Cli {
    #[arg(long, help = "Path to a YAML config file")]
    pub config: Option<String>,

    #[arg(long, help = "Path to the map file")]
    pub map_path: Option<String>,

    #[arg(long, help = "Path to the YAML scenario file")]
    pub scenario_path: Option<String>,

    #[arg(long, help = "Path to the JSON report")]
    pub output_path: Option<String>,

    #[arg(long, value_enum, help = "Planning strategy")]
    pub strategy: Option<StrategyKind>,

    #[arg(long, help = "Number of random agents when no scenario is given")]
    pub num_agents: Option<usize>,

    #[arg(long, help = "Number of planning cycles to simulate")]
    pub cycles: Option<usize>,

    #[arg(long, help = "Seed for the random number generators")]
    pub seed: Option<u64>,

    #[arg(long, help = "Runtime limit of a cycle per agent, in seconds")]
    pub runtime_limit_per_agent: Option<f64>,

    #[arg(long, help = "Runtime limit of a cycle, in seconds")]
    pub runtime_limit_overall: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Windowed cooperative A* that plans agents closest to their goal first.
    Whcan,
    /// Windowed cooperative A* with escalating priorities.
    Whcav,
    Cbs,
    Far,
    Pas,
    Bcp,
    Odid,
    Dummy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CbsSearchMethod {
    BestFirst,
    DepthFirst,
    BreadthFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvadingStrategy {
    /// Lock the blocking node in the agent's RRA* and search again.
    EvadeByRerouting,
    /// Step aside to a random free neighbor.
    EvadeToNextNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhcanConfig {
    pub window: f64,
    pub use_bias: bool,
    /// Cost added on every node of another agent's RRA* route.
    pub bias: Option<f64>,
}

impl Default for WhcanConfig {
    fn default() -> Self {
        WhcanConfig {
            window: 15.0,
            use_bias: false,
            bias: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhcavConfig {
    pub window: f64,
    /// Restart the pass with a raised priority as soon as one agent fails.
    pub abort_at_first_conflict: bool,
}

impl Default for WhcavConfig {
    fn default() -> Self {
        WhcavConfig {
            window: 20.0,
            abort_at_first_conflict: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CbsConfig {
    pub search_method: CbsSearchMethod,
    /// Latest arrival a low-level search considers, relative to its start.
    pub horizon: f64,
}

impl Default for CbsConfig {
    fn default() -> Self {
        CbsConfig {
            search_method: CbsSearchMethod::BestFirst,
            horizon: 120.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarConfig {
    pub evading_strategy: EvadingStrategy,
    pub es1_maximum_breaking_tries: usize,
    pub es2_back_evading_avoidance: bool,
}

impl Default for FarConfig {
    fn default() -> Self {
        FarConfig {
            evading_strategy: EvadingStrategy::EvadeByRerouting,
            es1_maximum_breaking_tries: 2,
            es2_back_evading_avoidance: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasConfig {
    pub window: f64,
    pub max_priorities: i32,
}

impl Default for PasConfig {
    fn default() -> Self {
        PasConfig {
            window: 30.0,
            max_priorities: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BcpConfig {
    pub biased_cost_amount: f64,
    /// Rounds after which agents still colliding wait instead.
    pub max_rounds: usize,
}

impl Default for BcpConfig {
    fn default() -> Self {
        BcpConfig {
            biased_cost_amount: 6.0,
            max_rounds: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdidConfig {
    pub window: f64,
    pub use_final_reservations: bool,
    pub max_node_count_per_agent: usize,
}

impl Default for OdidConfig {
    fn default() -> Self {
        OdidConfig {
            window: 15.0,
            use_final_reservations: false,
            max_node_count_per_agent: 100,
        }
    }
}

/// Knobs shared by every strategy plus one section per strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub seed: u64,
    pub wait_step: f64,
    pub runtime_limit_per_agent: f64,
    pub runtime_limit_overall: f64,
    pub maximum_wait_time: f64,
    pub whcan: WhcanConfig,
    pub whcav: WhcavConfig,
    pub cbs: CbsConfig,
    pub far: FarConfig,
    pub pas: PasConfig,
    pub bcp: BcpConfig,
    pub odid: OdidConfig,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            seed: 0,
            wait_step: 5.0,
            runtime_limit_per_agent: 0.05,
            runtime_limit_overall: 1.0,
            maximum_wait_time: DEFAULT_MAXIMUM_WAIT_TIME,
            whcan: WhcanConfig::default(),
            whcav: WhcavConfig::default(),
            cbs: CbsConfig::default(),
            far: FarConfig::default(),
            pas: PasConfig::default(),
            bcp: BcpConfig::default(),
            odid: OdidConfig::default(),
        }
    }
}

impl PlannerConfig {
    pub fn whcan_bias(&self) -> f64 {
        self.whcan.bias.unwrap_or(self.wait_step * 1.0001)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.wait_step > 0.0) {
            return Err(anyhow!("wait step must be positive, got {}", self.wait_step));
        }
        if self.runtime_limit_per_agent < 0.0 || self.runtime_limit_overall < 0.0 {
            return Err(anyhow!(
                "runtime limits must not be negative, got {} per agent and {} overall",
                self.runtime_limit_per_agent,
                self.runtime_limit_overall
            ));
        }
        for (name, window) in [
            ("whcan", self.whcan.window),
            ("whcav", self.whcav.window),
            ("pas", self.pas.window),
            ("odid", self.odid.window),
        ] {
            if !(window > 0.0) {
                return Err(anyhow!("{name} window must be positive, got {window}"));
            }
        }
        if self.pas.max_priorities < 1 {
            return Err(anyhow!(
                "pas needs at least one priority level, got {}",
                self.pas.max_priorities
            ));
        }
        if self.odid.max_node_count_per_agent == 0 {
            return Err(anyhow!("odid node count per agent must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub map_path: String,
    /// Distance between neighboring grid cells.
    pub spacing: f64,
    pub scenario_path: Option<String>,
    pub output_path: Option<String>,
    pub strategy: StrategyKind,
    pub num_agents: usize,
    pub cycles: usize,
    /// Simulated seconds between two planning cycles.
    pub cycle_length: f64,
    /// Hand out a fresh random destination once an agent arrives.
    pub reassign_destinations: bool,
    pub physics: Physics,
    pub planner: PlannerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            map_path: "map_file/test/warehouse.map".to_string(),
            spacing: 1.0,
            scenario_path: None,
            output_path: None,
            strategy: StrategyKind::Whcan,
            num_agents: 4,
            cycles: 50,
            cycle_length: 2.0,
            reassign_destinations: true,
            physics: Physics::default(),
            planner: PlannerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("failed to parse YAML config")?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        Self::from_yaml_str(&content).with_context(|| format!("error with config file: {path}"))
    }

    /// Command-line values take precedence over the file.
    pub fn override_from_command_line(mut self, cli: &Cli) -> anyhow::Result<Self> {
        if let Some(map_path) = &cli.map_path {
            self.map_path = map_path.clone();
        }
        if let Some(scenario_path) = &cli.scenario_path {
            self.scenario_path = Some(scenario_path.clone());
        }
        if let Some(output_path) = &cli.output_path {
            self.output_path = Some(output_path.clone());
        }
        if let Some(strategy) = cli.strategy {
            self.strategy = strategy;
        }
        if let Some(num_agents) = cli.num_agents {
            self.num_agents = num_agents;
        }
        if let Some(cycles) = cli.cycles {
            self.cycles = cycles;
        }
        if let Some(seed) = cli.seed {
            self.planner.seed = seed;
        }
        if let Some(limit) = cli.runtime_limit_per_agent {
            self.planner.runtime_limit_per_agent = limit;
        }
        if let Some(limit) = cli.runtime_limit_overall {
            self.planner.runtime_limit_overall = limit;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.spacing > 0.0) {
            return Err(anyhow!("spacing must be positive, got {}", self.spacing));
        }
        if !(self.cycle_length > 0.0) {
            return Err(anyhow!(
                "cycle length must be positive, got {}",
                self.cycle_length
            ));
        }
        if self.physics.max_speed <= 0.0
            || self.physics.acceleration <= 0.0
            || self.physics.deceleration <= 0.0
        {
            return Err(anyhow!("physics needs positive speed and acceleration"));
        }
        self.planner.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml_str(
            "strategy: cbs\nplanner:\n  wait_step: 2.0\n  cbs:\n    search_method: depth_first\n",
        )
        .unwrap();
        assert_eq!(config.strategy, StrategyKind::Cbs);
        assert_eq!(config.planner.wait_step, 2.0);
        assert_eq!(config.planner.cbs.search_method, CbsSearchMethod::DepthFirst);
        assert_eq!(config.planner.whcav.window, 20.0);
        assert_eq!(config.planner.maximum_wait_time, 30.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sample_config_file() {
        let config = Config::from_yaml_file("config_file/config.yaml").unwrap();
        assert_eq!(config.strategy, StrategyKind::Whcan);
        assert_eq!(config.scenario_path.as_deref(), Some("map_file/test/warehouse.yaml"));
        assert_eq!(config.planner, PlannerConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_command_line_overrides() {
        let cli = Cli::parse_from([
            "warehouse_mapf",
            "--strategy",
            "bcp",
            "--seed",
            "7",
            "--runtime-limit-overall",
            "0",
        ]);
        let config = Config::default().override_from_command_line(&cli).unwrap();
        assert_eq!(config.strategy, StrategyKind::Bcp);
        assert_eq!(config.planner.seed, 7);
        assert_eq!(config.planner.runtime_limit_overall, 0.0);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.planner.wait_step = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.planner.pas.max_priorities = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_bias_is_slightly_more_than_a_wait() {
        let planner = PlannerConfig::default();
        assert!(planner.whcan_bias() > planner.wait_step);
    }
}
