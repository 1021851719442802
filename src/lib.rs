//! Stroke lesion segmentation service.
//!
//! This library provides the core functionality for the stroke-seg-api
//! server, which drives the DeepISLES segmentation model through an external
//! process (docker container or local adapter), tracks jobs in memory and
//! serves the resulting NIfTI artifacts over a polling HTTP API.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
