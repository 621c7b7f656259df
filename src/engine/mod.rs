pub mod consumers;
pub mod dispatch;
pub mod pending;
pub mod queue;
pub mod ranking;
pub mod rate_limiter;
pub mod router;
pub mod state_machine;
