pub mod algorithm;
pub mod common;
pub mod communicator;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod graph;
pub mod physics;
pub mod reservation;
pub mod scenario;
pub mod simulation;
pub mod solver;
pub mod stat;
