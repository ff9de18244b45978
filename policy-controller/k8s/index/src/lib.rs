//! Configuration Policy Index
//!
//! Turns cluster change notifications into evaluation triggers. The index
//! watches:
//!
//! - `ConfigurationPolicy` resources. A policy is (re)evaluated when it is
//!   created, when its spec changes (a new generation), and when it starts
//!   terminating.
//! - `Namespace` resources. A change to the set of namespaces or to their
//!   labels re-evaluates every policy that selects namespaces.
//! - Objects of every kind named by a policy template, watched dynamically.
//!   An object change re-evaluates the policies that list it as a related
//!   object or whose templates could match it.
//!
//! ```text
//! [ Namespace ] ---------.
//!                        v
//! [ Object ] ----> [ Index ] --(Trigger)--> scheduler
//!                        ^
//! [ ConfigurationPolicy ]'
//! ```
//!
//! The index also caches namespace labels so that evaluation passes can
//! resolve namespace selectors without listing namespaces.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod metrics;
mod resource_id;

#[cfg(test)]
mod tests;

pub use self::{
    index::{Index, KindRef, SharedIndex, Trigger},
    resource_id::ResourceId,
};
