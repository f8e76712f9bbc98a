//! System orchestration: thread wiring, messages, shared state.

pub mod fusion_system;
pub mod ingest;
pub mod messages;
pub mod shared_state;

pub use fusion_system::FusionSystem;
pub use ingest::FrameIngest;
pub use messages::CompletedSubmap;
pub use shared_state::SharedState;
