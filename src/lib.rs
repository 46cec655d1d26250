// src/lib.rs

// 1. Data Structures (The "Nouns")
// explicit 'pub' makes them available to main.rs
pub mod models;

// 2. Interfaces (The "Contract")
pub mod traits;

// 3. Adapters (The "Plumbing")
pub mod connectors;

// 4. Offline Doubles (The "Sandbox")
pub mod simulation;

// 5. Strategy Catalog (The "Book")
pub mod strategy;

// 6. Trade Loop and Metrics (The "Orchestrator")
pub mod engine;

// 7. Custodial Withdrawals (The "Treasury")
pub mod withdrawal;

// 8. HTTP API
pub mod dashboard;

// 9. Configuration
pub mod config;
