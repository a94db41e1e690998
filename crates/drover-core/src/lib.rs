pub mod buffer;
pub mod cancel;
pub mod copy;
pub mod credentials;
pub mod engine;
pub mod errors;
pub mod events;
pub mod mount;
pub mod planner;
pub mod progress;
pub mod share_path;

/// Tunables for a single engine run.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub workers: usize,
    pub preserve_times: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, 8),
            preserve_times: true,
        }
    }
}
