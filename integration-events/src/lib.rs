//! Integration events of the WMS services
//!
//! Every event embeds an [`EventHeader`](events_bus::EventHeader) and is
//! published under its struct name as event kind:
//!
//! - **inventory**: item creation, stock levels and adjustments
//! - **picking**: picking list lifecycle and picked quantities
//! - **receiving**: purchase orders and goods receipts
//! - **shipping**: packing and dispatch of orders
//!
//! [`catalog`] lists every kind and builds wire payloads from loose JSON
//! fields for operational tooling.

pub mod catalog;
pub mod inventory;
pub mod picking;
pub mod receiving;
pub mod shipping;

pub use catalog::{CatalogError, ALL_KINDS};
pub use inventory::*;
pub use picking::*;
pub use receiving::*;
pub use shipping::*;
