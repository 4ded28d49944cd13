//! Domain models for the balance engine

pub mod account;
pub mod audit;
