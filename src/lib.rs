pub mod agent;
pub mod config;
pub mod dag;
pub mod errors;
pub mod exec;
pub mod git;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod project_config;
pub mod prompt;
pub mod retry;
pub mod roadmap;
pub mod sidecar;
pub mod signals;
pub mod state;
