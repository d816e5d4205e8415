//! Integration test crate. The tests live under `tests/`.
