mod agent;
mod path;

pub use agent::{Agent, AgentId};
pub use path::{Action, Path};
