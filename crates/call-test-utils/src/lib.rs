//! # Call Test Utilities
//!
//! Shared test utilities for the group-call orchestrator.
//!
//! This crate provides mock implementations and test fixtures for
//! isolated call-actor testing without a real signaling service or media
//! engine.
//!
//! ## Modules
//!
//! - `mock_signaling` - Scripted signaling service, records every request
//! - `mock_engine` - Mock media engine plus factory, injects engine events
//! - `recording_delegate` - Delegate that records every callback
//! - `fixtures` - Pre-configured call descriptors and participant deltas
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let call = TestCall::spawn().await;
//!
//!     call.handle
//!         .handle_participant_updates(TEST_CALL_ID, vec![participant(2, 200)])
//!         .await
//!         .unwrap();
//!
//!     // Run your assertions...
//! }
//! ```

pub mod fixtures;
pub mod mock_engine;
pub mod mock_signaling;
pub mod recording_delegate;

pub use fixtures::*;
pub use mock_engine::*;
pub use mock_signaling::*;
pub use recording_delegate::*;

/// Initialize tracing for a test binary. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
