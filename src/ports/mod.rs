//! Ports layer: Trait definitions for external operations.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the stores and the outside world (the hosted table service and
//! the wall clock).

mod clock;
mod table;

pub use clock::{Clock, FixedClock, SystemClock};
pub use table::{Filter, Order, Query, RemoteTable, Row, TableError};
