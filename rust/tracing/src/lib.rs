pub mod init_tracer;
pub mod util;

pub use init_tracer::{init_stdout_tracing, init_test_tracing, OtelFilter, OtelFilterLevel};
