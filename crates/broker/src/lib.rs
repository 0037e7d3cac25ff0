//! Brokerage gateway and market-data seams.
//!
//! The engine only ever talks to these traits; the paper implementation
//! simulates fills and serves as the default mode and the test double.

pub mod gateway;
pub mod paper;

pub use gateway::{BrokerGateway, BrokerPosition, MarketDataProvider, OrderAck, OrderRequest};
pub use paper::{PaperGateway, PaperMarketData};
