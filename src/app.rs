pub mod check_lock;
pub mod dispatcher;
pub mod queue;
pub mod runner;
pub mod scheduler;
