#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use config_policy_controller_core as core;
pub use config_policy_controller_k8s_api as k8s;
pub use config_policy_controller_k8s_index as index;
pub use config_policy_controller_k8s_status as status;

mod args;
mod dryrun;
mod lease;
mod metrics;
mod scheduler;
mod store;
mod watches;

pub use self::{
    args::Args,
    metrics::EvaluationMetrics,
    scheduler::{Config as SchedulerConfig, Scheduler},
    store::KubeStore,
};
