// ABOUTME: Library half of the fleet binary
// ABOUTME: Service wiring and logging setup shared by the subcommands

pub mod app;
pub mod logging;

#[cfg(test)]
mod tests;

pub use app::{Fleet, FleetSummary};
