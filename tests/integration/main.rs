//! End-to-end tests against an in-memory record store and a recording
//! chat channel.

mod mock_channel;
mod settlement_flow;
