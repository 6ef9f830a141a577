//! Materializers: turn finalized plans into their derived tables.
//!
//! Both materializers follow the same shape. Sweep for qualifying plans,
//! derive rows, bulk-insert (duplicates by natural key are skipped), publish
//! one data change event per created row, then flip the plan's monotone
//! completion flag. Failures are collected per plan so one bad plan never
//! blocks the rest of the sweep; the sweep as a whole reports a partial
//! failure and is redelivered.

mod groceries;
mod tasks;

pub use groceries::{GroceryMaterialization, materialize_grocery_lists};
pub use tasks::{TaskMaterialization, materialize_tasks};
