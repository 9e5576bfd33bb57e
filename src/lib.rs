pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod messaging;
pub mod peer;
pub mod session;
pub mod signaling;
// сеть, устройства и часы для тестов
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod store;
pub mod utils;

pub use commands::{CallHandle, ConsultationService, JoinedCall};
pub use config::CoreConfig;
pub use error::{CallError, FailureReason, PeerError, SessionError};
pub use messaging::{ChatMessage, Delivery, PrescriptionMessage};
pub use peer::{PeerState, SessionEvent};
pub use session::{ConsultationSession, SessionLifecycleManager, SessionStatus};
pub use signaling::{Signal, SignalKind, SignalRelay};
