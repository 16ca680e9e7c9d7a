pub mod harness;

pub use harness::TestApp;
