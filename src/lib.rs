//! Laptop loan reservations: a catalog of laptops, guest bookings over
//! inclusive date ranges, and owner blocks managed from a month calendar.

pub mod availability;
pub mod booking;
pub mod calendar;
pub mod compactor;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limits;
pub mod mail;
pub mod model;
pub mod observability;
pub mod session;
pub mod store;
pub mod wal;

pub use error::{Error, Result};
