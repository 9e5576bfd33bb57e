use crate::peer::types::MediaKind;
use crate::session::SessionStatus;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("participant {0} already joined")]
    AlreadyJoined(String),
    #[error("participant {participant} is not part of session {session}")]
    NotParticipant { session: String, participant: String },
    #[error("appointment {0} not found")]
    AppointmentNotFound(String),
    #[error("session store error: {0}")]
    Store(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no relay channel for session {0}")]
    UnknownSession(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("negotiation error: {0}")]
    Negotiation(String),
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("transport closed")]
    Closed,
    #[error("transport backend error: {0}")]
    Backend(String),
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        TransportError::Backend(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied for {0} capture")]
    PermissionDenied(MediaKind),
    #[error("media device unavailable: {0}")]
    Unavailable(String),
}

/// Причина перехода контроллера в `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied,
    SignalingTimeout,
    IceFailure,
    Negotiation,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureReason::PermissionDenied => "permission denied",
            FailureReason::SignalingTimeout => "signaling timeout",
            FailureReason::IceFailure => "ice failure",
            FailureReason::Negotiation => "negotiation error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("permission denied for {0} capture")]
    PermissionDenied(MediaKind),
    #[error("no answer within the signaling window")]
    SignalingTimeout,
    #[error("network path lost")]
    IceFailure,
    #[error("connection failed: {0}")]
    ConnectionFailed(FailureReason),
    #[error("session closed by peer")]
    SessionClosedByPeer,
    #[error("renegotiation failed: {0}")]
    RenegotiationFailed(String),
    #[error("negotiation error: {0}")]
    Negotiation(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("media error: {0}")]
    Media(String),
    #[error("not connected")]
    NotConnected,
    #[error("controller is gone")]
    ControllerGone,
}

impl From<MediaError> for PeerError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(kind) => PeerError::PermissionDenied(kind),
            MediaError::Unavailable(reason) => PeerError::Media(reason),
        }
    }
}

/// Ошибки UI-слоя
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}
