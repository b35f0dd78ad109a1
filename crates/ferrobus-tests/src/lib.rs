//! Test crate for the ferrobus workspace.
//!
//! End-to-end scenarios run the real receiver against the in-memory mock
//! link; property tests check the flow-control and settlement invariants
//! over randomized schedules.

#[cfg(test)]
mod proptest_receiver;
