//! catalog-sync — registry import pipeline for a bibliographic catalog.

pub mod config;
pub mod error;
pub mod job;
pub mod live;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod steps;
pub mod store;
