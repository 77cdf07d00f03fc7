//! Path-prefix routing.

pub mod table;

pub use table::{AuthPolicy, Route, RouteTable, Upstream};
