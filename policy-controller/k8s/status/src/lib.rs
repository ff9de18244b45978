#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod leader;
mod metrics;
mod update;


pub use self::{
    controller::Controller,
    leader::Leadership,
    metrics::ControllerMetrics,
    update::{make_event, make_patch, ComplianceEvent, Update},
};
