//! Marketplace chat - realtime conversation sync
//!
//! Keeps the visible message log of a buyer/seller conversation in step with
//! the store: history load with retry, optimistic sends, change-feed echoes
//! collapsed into one entry, read receipts, and a typing indicator.

pub mod messages;
pub mod backend;
pub mod channel;
pub mod store;
pub mod retry;
pub mod conversation;
pub mod presence;
pub mod session;
pub mod registry;
pub mod client;
pub mod inbox;
pub mod config;
pub mod error;

pub use error::{Error, Result};
