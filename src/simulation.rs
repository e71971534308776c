//! Discrete-time driver around a strategy: plans every cycle, drives every
//! agent along its path with its physics and keeps score.

use std::fs::File;
use std::io::BufWriter;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::common::{Agent, AgentId};
use crate::communicator::Communicator;
use crate::config::Config;
use crate::error::MapfResult;
use crate::graph::{degree_to_rad, Graph, NodeId};
use crate::reservation::{checkpoints_between, create_intervals, Interval, TOLERANCE};
use crate::scenario::free_nodes;
use crate::solver::{PathFinder, PlanningOutcome, Strategy};
use crate::stat::Stats;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentTrace {
    pub id: AgentId,
    /// Nodes the agent stood on or drove to, without repetitions.
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub strategy: String,
    pub cycles: usize,
    pub simulated_time: f64,
    pub completed_tasks: usize,
    /// Executed occupancies that overlapped another agent's.
    pub collisions: usize,
    pub timed_out_cycles: usize,
    pub stats: Stats,
    pub traces: Vec<AgentTrace>,
}

impl Report {
    pub fn write_to_file(&self, path: &str) -> MapfResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

pub struct Simulation<'a> {
    graph: &'a Graph,
    strategy: Strategy<'a>,
    agents: Vec<Agent>,
    rng: StdRng,
    time: f64,
    cycle_length: f64,
    reassign_destinations: bool,
    /// What the agents actually occupied, kept for one cycle back.
    executed: OccupancyLog,
    cycles: usize,
    completed_tasks: usize,
    collisions: usize,
    timed_out_cycles: usize,
    traces: Vec<AgentTrace>,
}

impl<'a> Simulation<'a> {
    pub fn new(
        graph: &'a Graph,
        config: &Config,
        agents: Vec<Agent>,
        communicator: Box<dyn Communicator>,
    ) -> Self {
        let traces = agents
            .iter()
            .map(|agent| AgentTrace {
                id: agent.id,
                nodes: vec![agent.next_node],
            })
            .collect();
        Simulation {
            graph,
            strategy: Strategy::new(config.strategy, graph, &config.planner, communicator),
            agents,
            rng: StdRng::seed_from_u64(config.planner.seed),
            time: 0.0,
            cycle_length: config.cycle_length,
            reassign_destinations: config.reassign_destinations,
            executed: OccupancyLog::new(graph.node_count()),
            cycles: 0,
            completed_tasks: 0,
            collisions: 0,
            timed_out_cycles: 0,
            traces,
        }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn run(&mut self, cycles: usize) -> Report {
        for _ in 0..cycles {
            self.step();
        }
        self.report()
    }

    /// One planning cycle followed by `cycle_length` seconds of driving.
    #[instrument(skip(self), fields(time = self.time), level = "debug")]
    pub fn step(&mut self) {
        for agent in self.agents.iter_mut() {
            agent.request_reoptimization = !agent.fixed_position;
        }
        if self.strategy.find_paths(self.time, &mut self.agents) == PlanningOutcome::TimedOut {
            self.timed_out_cycles += 1;
        }

        let until = self.time + self.cycle_length;
        self.executed.forget_before(self.time - self.cycle_length);
        for index in 0..self.agents.len() {
            let executed = execute(self.graph, &mut self.agents[index], self.time, until);
            if executed.arrived {
                self.completed_tasks += 1;
            }
            let id = self.agents[index].id;
            self.collisions += self.record(id, &executed.occupied);

            let trace = &mut self.traces[index];
            let node = self.agents[index].next_node;
            if trace.nodes.last() != Some(&node) {
                trace.nodes.push(node);
            }
        }
        if self.reassign_destinations {
            self.reassign(until);
        }

        self.cycles += 1;
        self.time = until;
    }

    fn record(&mut self, id: AgentId, occupied: &[Interval]) -> usize {
        let mut collisions = 0;
        for interval in occupied.iter().filter(|interval| interval.duration() > TOLERANCE) {
            let foreign = self.executed.record(id, *interval);
            if foreign > 0 {
                debug!("agent {id} collided on {interval}");
                collisions += foreign;
            }
        }
        collisions
    }

    /// Agents standing on their destination get a fresh one no other agent
    /// is heading to.
    fn reassign(&mut self, until: f64) {
        let free = free_nodes(self.graph);
        for index in 0..self.agents.len() {
            let agent = &self.agents[index];
            if agent.fixed_position
                || !agent.at_destination()
                || agent.arrival_time_at_next_node > until
            {
                continue;
            }
            let candidates: Vec<NodeId> = free
                .iter()
                .copied()
                .filter(|&node| {
                    node != agent.next_node
                        && self
                            .agents
                            .iter()
                            .all(|other| other.destination_node != node && other.next_node != node)
                })
                .collect();
            if let Some(&destination) = candidates.choose(&mut self.rng) {
                debug!("agent {} gets destination {destination}", agent.id);
                self.agents[index].destination_node = destination;
            }
        }
    }

    pub fn report(&self) -> Report {
        let report = Report {
            strategy: self.strategy.name().to_string(),
            cycles: self.cycles,
            simulated_time: self.time,
            completed_tasks: self.completed_tasks,
            collisions: self.collisions,
            timed_out_cycles: self.timed_out_cycles,
            stats: self.strategy.stats().clone(),
            traces: self.traces.clone(),
        };
        info!(
            "{} finished {} cycles: {} tasks completed, {} collisions",
            report.strategy, report.cycles, report.completed_tasks, report.collisions
        );
        report.stats.print();
        report
    }
}

/// Occupancies as they happened. Unlike a reservation table it keeps
/// overlapping entries, so every overlap is seen.
#[derive(Debug, Clone, Default)]
struct OccupancyLog {
    nodes: Vec<Vec<(AgentId, Interval)>>,
}

impl OccupancyLog {
    fn new(node_count: usize) -> Self {
        OccupancyLog {
            nodes: vec![Vec::new(); node_count],
        }
    }

    fn forget_before(&mut self, time: f64) {
        for slots in self.nodes.iter_mut() {
            slots.retain(|(_, interval)| interval.end >= time);
        }
    }

    /// Logs the interval and returns how many occupancies of other agents it
    /// overlaps.
    fn record(&mut self, owner: AgentId, interval: Interval) -> usize {
        let Some(slots) = self.nodes.get_mut(interval.node) else {
            return 0;
        };
        let overlaps = slots
            .iter()
            .filter(|(other, logged)| *other != owner && logged.overlaps(&interval))
            .count();
        slots.push((owner, interval));
        overlaps
    }
}

#[derive(Debug, Default)]
struct Executed {
    occupied: Vec<Interval>,
    arrived: bool,
}

/// Drives the agent from its next node to the next stop of its path, if it
/// is standing and leaves before `until`. Returns what it occupied.
fn execute(graph: &Graph, agent: &mut Agent, now: f64, until: f64) -> Executed {
    let mut executed = Executed::default();
    let from = agent.arrival_time_at_next_node.max(now);
    if from >= until {
        return executed;
    }
    agent.reservations_to_next_node.clear();

    let departure = match agent.path.next_action() {
        Some(action) if action.node == agent.next_node && !agent.fixed_position => {
            from + action.wait_after_stop
        }
        _ => f64::INFINITY,
    };
    let target = agent
        .path
        .actions()
        .enumerate()
        .skip(1)
        .find(|(_, action)| action.stop_at_node)
        .map(|(index, action)| (index, action.node));
    let (Some((target_index, target)), true) = (target, departure < until) else {
        executed.occupied.push(Interval::new(agent.next_node, from, until));
        return executed;
    };
    let Some(first_hop) = agent.path.action(1).map(|action| action.node) else {
        executed.occupied.push(Interval::new(agent.next_node, from, until));
        return executed;
    };
    let Some(edge) = graph.edge_between(agent.next_node, first_hop) else {
        debug!("agent {} path leaves the graph at {}", agent.id, agent.next_node);
        executed.occupied.push(Interval::new(agent.next_node, from, until));
        return executed;
    };

    let heading = degree_to_rad(edge.angle);
    let turn = agent.physics.time_to_turn(agent.orientation_at_next_node, heading);
    let Some((nodes, times)) = checkpoints_between(
        graph,
        &agent.physics,
        departure + turn,
        0.0,
        agent.next_node,
        target,
    ) else {
        debug!("agent {} cannot drive straight to {target}", agent.id);
        executed.occupied.push(Interval::new(agent.next_node, from, until));
        return executed;
    };

    let drive = create_intervals(departure, &nodes, &times, false);
    let arrival = times.last().copied().unwrap_or(departure);
    executed.occupied.push(Interval::new(agent.next_node, from, departure));
    executed.occupied.extend(drive.iter().copied());
    if arrival < until {
        executed.occupied.push(Interval::new(target, arrival, until));
    }

    for _ in 0..target_index {
        agent.path.remove_first();
    }
    agent.reservations_to_next_node = drive;
    agent.next_node = target;
    agent.arrival_time_at_next_node = arrival;
    agent.orientation_at_next_node = heading;
    executed.arrived = target == agent.destination_node;
    executed
}
