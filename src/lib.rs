#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod activity;
pub(crate) mod api;
pub mod app;
pub mod clients;
pub mod config;
pub mod observability;
pub mod scheduler;
pub mod stages;
pub mod storage;
pub mod store;
pub mod test_support;
pub mod util;
pub mod workflow;
