//! Bid engine of the provider daemon.
//!
//! Watches for open orders, decides whether this provider can and
//! wants to serve them, and places priced bids. Pricing is pluggable
//! through [`BidPricingStrategy`].

mod order;
mod pricing;
mod service;

pub use order::BidError;
pub use pricing::{
    BidPricingStrategy, PricingError, RandomRangePricing, ScalePricing, ShellScriptPricing,
};
pub use service::{BidEngineService, BidEngineStatus};
