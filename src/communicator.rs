use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{info, warn};

/// Collaborator that receives planner notifications.
pub trait Communicator {
    /// The runtime budget of a planning cycle ran out.
    fn signal_timeout(&self);

    fn log_default(&self, message: &str) {
        info!("{message}");
    }

    fn log_severe(&self, message: &str) {
        warn!("{message}");
    }
}

/// Forwards everything to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCommunicator;

impl Communicator for TracingCommunicator {
    fn signal_timeout(&self) {
        warn!("planning cycle exceeded its runtime budget");
    }
}

/// Counts timeouts and keeps log lines. Clones share their records.
#[derive(Debug, Clone, Default)]
pub struct RecordingCommunicator {
    timeouts: Rc<Cell<usize>>,
    messages: Rc<RefCell<Vec<String>>>,
}

impl RecordingCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.get()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }
}

impl Communicator for RecordingCommunicator {
    fn signal_timeout(&self) {
        self.timeouts.set(self.timeouts.get() + 1);
    }

    fn log_default(&self, message: &str) {
        info!("{message}");
        self.messages.borrow_mut().push(message.to_string());
    }

    fn log_severe(&self, message: &str) {
        warn!("{message}");
        self.messages.borrow_mut().push(message.to_string());
    }
}
