pub mod actions;
pub mod context;
pub mod dispatcher;
pub mod drain;
pub mod queue;
pub mod recovery;
pub mod watch;

pub use actions::NodeActions;
pub use context::{Context, DrainSettings};
pub use dispatcher::{Dispatcher, NodeAction, Trigger, TriggerSource};
pub use drain::{drain_node, DrainError, DrainOutcome, DrainReport};
pub use queue::{TriggerHandler, WorkQueue};
pub use recovery::{uncordon_node, UncordonError, UncordonOutcome};
