use serde::Serialize;
use tracing::info;

/// Counters accumulated by a strategy over all planning cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub cycles: usize,
    pub timeouts: usize,
    pub planned_agents: usize,
    pub wait_steps: usize,
    pub random_hops: usize,
    pub time_us: u128,
    /// Expansions of single-agent searches.
    pub low_level_expand_nodes: usize,
    /// Conflict-tree nodes, joint states or planning rounds, depending on
    /// the strategy.
    pub high_level_expand_nodes: usize,
}

impl Stats {
    pub fn print(&self) {
        info!(
            "Cycles {:?} Timeouts {:?} Time(microseconds) {:?} Planned agents {:?} Wait steps {:?} Random hops {:?} High level expand nodes number: {:?} Low level expand nodes number {:?}",
            self.cycles,
            self.timeouts,
            self.time_us,
            self.planned_agents,
            self.wait_steps,
            self.random_hops,
            self.high_level_expand_nodes,
            self.low_level_expand_nodes
        );
    }
}
