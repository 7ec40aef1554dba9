//! logdrift Core - Domain logic and business rules
//!
//! This crate contains the domain layer of the logdrift follower with:
//! - **Domain entities** - `FilterSpec`, `FollowerKey`, `FileIdentity`, `EngineParams`
//! - **Port definitions** - The `Handler` trait implemented by record consumers
//! - **Configuration** - Typed YAML configuration for the daemon
//!
//! # Architecture
//!
//! The domain module contains pure data types and validation with no
//! filesystem side effects. Ports define trait interfaces that downstream
//! crates (and embedders) implement. The follower runtime itself lives in
//! `logdrift-follow`.

pub mod config;
pub mod domain;
pub mod ports;
