//! Core domain types for the commodity dashboard data layer.
//!
//! This crate provides the types shared by every other crate:
//! - `Price`: precision-safe price wrapper
//! - `PriceTick`: a single live price observation
//! - `SyncTask`, `DurableRecord`, `EntityType`: offline persistence types
//! - `Clock`, `Connectivity`, `Notifier`: injected services

pub mod clock;
pub mod connectivity;
pub mod decimal;
pub mod entity;
pub mod error;
pub mod notify;
pub mod sync_task;
pub mod tick;

use std::pin::Pin;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::{AlwaysOnline, Connectivity};
pub use decimal::Price;
pub use entity::{DurableRecord, EntityType};
pub use error::{CoreError, Result};
pub use notify::{NotificationLevel, Notifier, UserNotification};
pub use sync_task::SyncTask;
pub use tick::{PriceSource, PriceTick};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
