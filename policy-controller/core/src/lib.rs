#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod compliance;
pub mod evaluate;
pub mod list;
pub mod merge;
pub mod related;
pub mod schedule;
pub mod selector;
pub mod store;
mod value;

pub use self::{
    compliance::{Outcome, TemplateTally, Verdict},
    evaluate::{evaluate, status_changed, EvalError, Evaluation, ObjectDiff},
    related::{ObjectId, RelatedObjects},
    store::{KindInfo, MemoryStore, NamespaceInfo, Store, StoreError},
    value::{Kind, Map, Value},
};

pub const POLICY_CONTROLLER_NAME: &str = "config-policy-controller";
