//! convergd: convergence operator for cluster datasets and containers
//!
//! This crate drives the placement of data volumes ("datasets") and their
//! hosting application containers toward an operator-declared configuration,
//! through repeated observe → diff → apply cycles that tolerate partial
//! failure and concurrent state drift.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod model;
pub mod observer;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
