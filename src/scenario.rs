use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{Agent, AgentId};
use crate::error::{MapfError, MapfResult};
use crate::graph::{Graph, NodeId};
use crate::physics::Physics;
use crate::reservation::{Interval, ReservationTable};

/// One robot of a scenario, placed by grid cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub start: (usize, usize),
    pub goal: (usize, usize),
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub can_go_through_obstacles: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub agents: Vec<AgentSpec>,
}

impl Scenario {
    pub fn load_from_file(path: &str) -> MapfResult<Scenario> {
        let reader = BufReader::new(File::open(path)?);
        let scenario = serde_yaml::from_reader(reader)?;
        Ok(scenario)
    }

    pub fn write_to_file(&self, path: &str) -> MapfResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(serde_yaml::to_string(self)?.as_bytes())?;
        Ok(())
    }

    /// Distinct free start cells and distinct free goal cells.
    pub fn generate_randomly<R: Rng + ?Sized>(
        graph: &Graph,
        num_agents: usize,
        rng: &mut R,
    ) -> MapfResult<Scenario> {
        let free = free_nodes(graph);
        if free.len() < num_agents {
            return Err(MapfError::Scenario(format!(
                "{num_agents} agents requested but the map has only {} free cells",
                free.len()
            )));
        }

        let starts: Vec<NodeId> = free.choose_multiple(rng, num_agents).copied().collect();
        let goals: Vec<NodeId> = free.choose_multiple(rng, num_agents).copied().collect();
        let mut agents = Vec::with_capacity(num_agents);
        for (id, (start, goal)) in starts.into_iter().zip(goals).enumerate() {
            let cell = |node| {
                graph
                    .cell_of(node)
                    .ok_or_else(|| MapfError::Scenario("random agents need a grid map".into()))
            };
            agents.push(AgentSpec {
                id,
                start: cell(start)?,
                goal: cell(goal)?,
                fixed: false,
                can_go_through_obstacles: false,
            });
        }

        info!("Generate scen: {agents:?}");
        Ok(Scenario { agents })
    }

    /// Places the agents on the graph, rejecting unknown or locked cells and
    /// shared starts. Every agent claims its start cell from time zero on.
    pub fn to_agents(&self, graph: &Graph, physics: Physics) -> MapfResult<Vec<Agent>> {
        let mut occupied = ReservationTable::strict(graph);
        let mut ids = HashSet::new();
        let mut agents = Vec::with_capacity(self.agents.len());
        for spec in &self.agents {
            let node_of = |(x, y): (usize, usize)| {
                graph.node_at(x, y).ok_or_else(|| {
                    MapfError::Scenario(format!("agent {}: cell ({x}, {y}) is off the map", spec.id))
                })
            };
            let start = node_of(spec.start)?;
            let goal = node_of(spec.goal)?;

            if !ids.insert(spec.id) {
                return Err(MapfError::Scenario(format!("agent id {} is used twice", spec.id)));
            }
            occupied.try_add(&Interval::permanent(start, 0.0), Some(spec.id), 0)?;

            let mut agent = Agent::new(spec.id, start, goal, physics);
            agent.fixed_position = spec.fixed;
            agent.can_go_through_obstacles = spec.can_go_through_obstacles;
            if !agent.verify(graph) {
                return Err(MapfError::Scenario(format!(
                    "agent {} starts or ends on a locked cell",
                    spec.id
                )));
            }
            agents.push(agent);
        }
        Ok(agents)
    }
}

/// Cells an ordinary agent may stand on.
pub fn free_nodes(graph: &Graph) -> Vec<NodeId> {
    (0..graph.node_count())
        .filter(|&node| !graph.is_blocked(node, false) && !graph.edges(node).is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReservationError;
    use rand::rngs::StdRng;

    fn map() -> Graph {
        Graph::from_map_file("map_file/test/warehouse.map", 1.0).unwrap()
    }

    #[test]
    fn test_read_scenario() {
        let scenario = Scenario::load_from_file("map_file/test/warehouse.yaml").unwrap();
        let agents = scenario.to_agents(&map(), Physics::default()).unwrap();

        assert_eq!(agents.len(), 4);
        assert_eq!(agents[0].next_node, 9);
        assert_eq!(agents[0].destination_node, 14);
        assert!(agents[3].fixed_position);
    }

    #[test]
    fn test_rejects_locked_and_shared_cells() {
        let graph = map();
        let locked = Scenario {
            agents: vec![AgentSpec {
                id: 0,
                start: (0, 0),
                goal: (1, 1),
                fixed: false,
                can_go_through_obstacles: false,
            }],
        };
        assert!(matches!(
            locked.to_agents(&graph, Physics::default()),
            Err(MapfError::Scenario(_))
        ));

        let spec = |id| AgentSpec {
            id,
            start: (1, 1),
            goal: (6, 1),
            fixed: false,
            can_go_through_obstacles: false,
        };
        let shared = Scenario {
            agents: vec![spec(0), spec(1)],
        };
        assert!(matches!(
            shared.to_agents(&graph, Physics::default()),
            Err(MapfError::Reservation(ReservationError::IntervalConflict { owner: Some(0), .. }))
        ));
    }

    #[test]
    fn test_generate_randomly() {
        let graph = map();
        let mut rng = StdRng::seed_from_u64(0);
        let scenario = Scenario::generate_randomly(&graph, 5, &mut rng).unwrap();
        let agents = scenario.to_agents(&graph, Physics::default()).unwrap();
        assert_eq!(agents.len(), 5);

        let goals: HashSet<_> = agents.iter().map(|agent| agent.destination_node).collect();
        assert_eq!(goals.len(), 5);

        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(Scenario::generate_randomly(&graph, 5, &mut rng).unwrap(), scenario);
        assert!(Scenario::generate_randomly(&graph, 100, &mut rng).is_err());
    }
}
