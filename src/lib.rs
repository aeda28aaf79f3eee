//! TipMarket Settlement Engine Library
//!
//! Resolves free-text betting-market predictions against final scores,
//! settles accumulator tickets, and distributes escrowed marketplace funds.

pub mod engine;
pub mod models;
pub mod notify;
pub mod purchase;
pub mod resolver;
pub mod store;
pub mod wallet;

pub use engine::SettlementEngine;
pub use models::{EngineConfig, SettlementReport};
pub use purchase::{MarketplaceService, PurchaseError};
pub use resolver::{resolve, Resolution};
