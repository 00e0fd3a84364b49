//! Background maintenance workers.
//!
//! Each worker runs in a loop at a configured interval until its
//! cancellation token fires, performing one pass per tick.

mod request_cache_cleanup;

pub use request_cache_cleanup::{run_cleanup, start_request_cache_cleanup_worker};
