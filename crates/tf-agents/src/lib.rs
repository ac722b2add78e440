pub mod executor;
pub mod heartbeat;
pub mod lifecycle;
pub mod retry;
pub mod state_machine;
pub mod supervisor;
