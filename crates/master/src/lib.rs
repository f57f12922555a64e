pub mod election;
pub mod job_manager;
pub mod service;

pub use election::LeaderElection;
pub use job_manager::JobManager;
pub use service::MasterService;
