//! End-to-end tests over the assembled system.

mod lifecycle_tests;
mod test_helpers;
