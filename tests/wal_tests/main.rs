//! Write-ahead log tests

mod recovery_tests;
mod rollback_tests;
