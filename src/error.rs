use thiserror::Error;

use crate::common::AgentId;
use crate::graph::NodeId;

/// Raised by the reservation table when an interval cannot be committed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReservationError {
    #[error(
        "interval [{start}, {end}) on node {node} intersects a reservation of {owner:?} at priority {priority}"
    )]
    IntervalConflict {
        node: NodeId,
        start: f64,
        end: f64,
        owner: Option<AgentId>,
        priority: i32,
    },
    #[error("node {0} is not part of the graph")]
    UnknownNode(NodeId),
}

#[derive(Debug, Error)]
pub enum MapfError {
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error("malformed map: {0}")]
    MapFormat(String),
    #[error("invalid scenario: {0}")]
    Scenario(String),
    #[error("node {0} is not part of the graph")]
    UnknownNode(NodeId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type MapfResult<T> = Result<T, MapfError>;
