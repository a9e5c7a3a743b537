//! Identity and access reconciliation engine.
//!
//! A chat platform's channel membership is the source of truth for who may
//! access which downstream resource. The engine discovers logical entities
//! from a configured permissions matrix, derives each entity's authoritative
//! membership from its channels, and converges five external services
//! (identity-provider groups, documentation collections, email contact
//! lists, low-code database bases, password-store collections) onto that
//! membership, producing a structured record of every action taken.

pub mod clients;
pub mod config;
pub mod error;
pub mod pattern;
pub mod report;
pub mod sync;
