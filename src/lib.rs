// ABOUTME: Library root for mpr-exchange
// ABOUTME: Exposes the exchange engine, configuration and PostgreSQL connection helpers

pub mod config;
pub mod exchange;
pub mod postgres;
