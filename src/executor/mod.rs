//! Query planning and execution
//!
//! The planner turns a parsed SELECT into a tree of logical operators; the
//! executor pulls rows through that tree one at a time.

pub mod executor;
pub mod planner;

pub use executor::{ExecContext, QueryResult};
pub use planner::{Plan, Planner};
