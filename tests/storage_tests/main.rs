//! Block storage tests

mod backend_tests;
mod block_file_tests;
