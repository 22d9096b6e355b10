//! Solharvest agent library
//!
//! Harvests photovoltaic telemetry from three source families and writes
//! it to an InfluxDB v2 compatible time-series store:
//! - Quota-limited vendor REST API (with historical backfill)
//! - Authenticated vendor web portal, scraped
//! - Local inverter over Modbus TCP
//!
//! The pipeline per cycle is collect -> normalize -> filter -> write; each
//! source runs on its own schedule and fails independently.

pub mod backfill;
pub mod cache;
pub mod collectors;
pub mod config;
pub mod filter;
pub mod model;
pub mod normalize;
pub mod scheduler;
pub mod stats;
pub mod writer;
