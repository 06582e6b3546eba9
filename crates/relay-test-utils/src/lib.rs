// relay-test-utils: Shared test utilities for the relay suite.
//
// Provides a mock tabletop WebSocket client for integration testing of the
// relay's join handshake, correlation, and forwarding paths.

pub mod mock_table_client;

pub use mock_table_client::MockTableClient;
