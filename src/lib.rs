pub mod config;
pub mod control;
pub mod health;
pub mod http;
pub mod manager;
pub mod ports;
pub mod settings;
pub mod supervisor;

pub use manager::{ManagerError, ManagerStatus, ServerManager};
pub use supervisor::{SupervisionState, SupervisorConfig};
