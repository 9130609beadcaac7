pub mod episode_store;
pub mod events;
pub mod job_store;
pub mod model;
pub mod orchestrator;
