// Stagehand - background job dispatch for Rust services
//
// This library connects application code to a job broker: queue topology,
// dispatch of static, model and scheduled calls, and workers that shut down
// gracefully.

// Re-export the job layer
pub use stagehand_queue::*;

// Re-export supporting crates
pub use stagehand_log;
pub use stagehand_queue;
pub use stagehand_redis;

// Prelude for common imports
pub mod prelude {
    pub use stagehand_queue::prelude::*;
    pub use stagehand_queue::args;
    pub use stagehand_queue::settings::WorkersSettings;
    pub use stagehand_redis::RedisConfig;
}
