#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod labels;
pub mod policy;

pub use self::{
    labels::Labels,
    policy::{
        ComplianceState, ComplianceType, ConfigurationPolicy, ConfigurationPolicySpec,
        ConfigurationPolicyStatus, Interval, ObjectTemplate, PruneObjectBehavior, RelatedObject,
        RemediationAction,
    },
};
pub use k8s_openapi::{
    api::{self, core::v1::Namespace},
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
};
pub use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams,
        PostParams, ResourceExt,
    },
    core::GroupVersionKind,
    runtime::watcher,
    Client, Error, Resource,
};
