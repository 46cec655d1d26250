// src/strategy/mod.rs

pub mod book;

pub use book::{expected_profit, CatalogError, StrategyBook, PROTOCOL_RATES};
