//! Dispatcher, scheduler, and fanout: the three periodic loops that pull
//! work out of the outbox/inbox/job tables and push it onward.

mod dispatcher;
mod fanout;
mod handler_resolver;
mod scheduler;
mod selection;

pub use dispatcher::{Dispatcher, DispatcherOptions};
pub use fanout::{jitter_delay, FanoutEngine};
pub use handler_resolver::MapHandlerResolver;
pub use scheduler::{Scheduler, SchedulerOptions};
pub use selection::{DrainFirst, RoundRobin, SelectionStrategy};
