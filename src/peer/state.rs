use crate::error::FailureReason;
use crate::peer::ice::CandidateBuffer;
use crate::peer::media::LocalMedia;
use crate::peer::types::SdpPayload;
use std::collections::HashSet;
use std::fmt;

/// Метка data-channel
pub const DATA_CHANNEL_LABEL: &str = "consult-data";

/// Состояние контроллера
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Capturing,
    Offering,
    Answering,
    Connected,
    Renegotiating,
    Closed,
    Failed(FailureReason),
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed(_))
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Idle => f.write_str("idle"),
            PeerState::Capturing => f.write_str("capturing"),
            PeerState::Offering => f.write_str("offering"),
            PeerState::Answering => f.write_str("answering"),
            PeerState::Connected => f.write_str("connected"),
            PeerState::Renegotiating => f.write_str("renegotiating"),
            PeerState::Closed => f.write_str("closed"),
            PeerState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Проверка входящего offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferCheck {
    Fresh,
    /// Первый offer от нового экземпляра удалённого контроллера
    NewRemote,
    Stale,
    FromClosedPeer,
}

/// Проверка входящего answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerCheck {
    Apply,
    WrongTarget,
    Stale,
}

/// Учёт раундов offer/answer. Текущий offer один на раунд
#[derive(Debug, Default)]
pub struct Negotiation {
    round: u64,
    pending_offer: Option<u64>,
    last_remote_offer: u64,
    pub local_round: Option<u64>,
    pub remote_round: Option<u64>,
    remote_connection: Option<String>,
    closed_remotes: HashSet<String>,
    /// Кандидаты раундов ниже этого относятся к прошлому ICE-сеансу
    candidate_floor: u64,
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn next_round(&mut self) -> u64 {
        self.round += 1;
        self.round
    }

    pub fn offer_sent(&mut self, round: u64) {
        self.pending_offer = Some(round);
    }

    pub fn pending_offer(&self) -> Option<u64> {
        self.pending_offer
    }

    pub fn abandon_offer(&mut self) -> Option<u64> {
        self.pending_offer.take()
    }

    pub fn remote_connection(&self) -> Option<&str> {
        self.remote_connection.as_deref()
    }

    pub fn check_offer(&self, offer: &SdpPayload) -> OfferCheck {
        if self.closed_remotes.contains(&offer.connection_id) {
            return OfferCheck::FromClosedPeer;
        }
        match self.remote_connection.as_deref() {
            Some(current) if current != offer.connection_id => OfferCheck::NewRemote,
            None => OfferCheck::NewRemote,
            Some(_) if offer.round <= self.last_remote_offer => OfferCheck::Stale,
            Some(_) => OfferCheck::Fresh,
        }
    }

    /// Фиксирует принятый offer и привязывает удалённый экземпляр
    pub fn offer_accepted(&mut self, offer: &SdpPayload) {
        if self.remote_connection.as_deref() != Some(offer.connection_id.as_str()) {
            self.remote_connection = Some(offer.connection_id.clone());
            self.remote_round = None;
            self.candidate_floor = offer.round;
        } else if offer.fresh || offer.restart {
            self.candidate_floor = offer.round;
        }
        self.last_remote_offer = offer.round;
        self.round = self.round.max(offer.round);
    }

    pub fn check_answer(&self, answer: &SdpPayload, local_connection: &str) -> AnswerCheck {
        if answer.target.as_deref() != Some(local_connection) {
            return AnswerCheck::WrongTarget;
        }
        if self.closed_remotes.contains(&answer.connection_id) {
            return AnswerCheck::Stale;
        }
        match self.pending_offer {
            Some(round) if round == answer.round => AnswerCheck::Apply,
            _ => AnswerCheck::Stale,
        }
    }

    pub fn answer_accepted(&mut self, answer: &SdpPayload) {
        self.pending_offer = None;
        if self.remote_connection.as_deref() != Some(answer.connection_id.as_str()) {
            self.remote_connection = Some(answer.connection_id.clone());
        }
        self.round = self.round.max(answer.round);
    }

    pub fn candidate_floor(&self) -> u64 {
        self.candidate_floor
    }

    /// Вызывается перед отправкой offer с полным рукопожатием или ICE restart
    pub fn raise_candidate_floor(&mut self, round: u64) {
        self.candidate_floor = self.candidate_floor.max(round);
    }

    pub fn mark_closed(&mut self, connection_id: &str) {
        self.closed_remotes.insert(connection_id.to_string());
    }

    pub fn is_closed(&self, connection_id: &str) -> bool {
        self.closed_remotes.contains(connection_id)
    }

    /// Описание обеих сторон применено для одного и того же раунда
    pub fn descriptions_settled(&self) -> bool {
        matches!((self.local_round, self.remote_round), (Some(l), Some(r)) if l == r)
            && self.pending_offer.is_none()
    }

    /// Сброс перед полным повтором рукопожатия
    pub fn reset_descriptions(&mut self) {
        self.pending_offer = None;
        self.local_round = None;
        self.remote_round = None;
    }
}

/// Состояние участника в памяти процесса; создаётся при join, уничтожается при leave
#[derive(Debug)]
pub struct ParticipantConnectionState {
    pub state: PeerState,
    pub media: LocalMedia,
    pub candidates: CandidateBuffer,
    pub data_channel_open: bool,
    pub link_up: bool,
}

impl Default for ParticipantConnectionState {
    fn default() -> Self {
        Self {
            state: PeerState::Idle,
            media: LocalMedia::default(),
            candidates: CandidateBuffer::new(),
            data_channel_open: false,
            link_up: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescription;

    fn offer(conn: &str, round: u64) -> SdpPayload {
        SdpPayload {
            sdp: SessionDescription::offer(format!("offer-{conn}-{round}")),
            round,
            connection_id: conn.into(),
            target: None,
            fresh: round == 1,
            restart: false,
            ts: 0,
        }
    }

    fn answer(conn: &str, target: &str, round: u64) -> SdpPayload {
        SdpPayload {
            sdp: SessionDescription::answer(format!("answer-{conn}-{round}")),
            round,
            connection_id: conn.into(),
            target: Some(target.into()),
            fresh: false,
            restart: false,
            ts: 0,
        }
    }

    #[test]
    fn stale_offers_are_rejected() {
        let mut neg = Negotiation::new();
        assert_eq!(neg.check_offer(&offer("a1", 1)), OfferCheck::NewRemote);
        neg.offer_accepted(&offer("a1", 1));
        assert_eq!(neg.check_offer(&offer("a1", 1)), OfferCheck::Stale);
        assert_eq!(neg.check_offer(&offer("a1", 2)), OfferCheck::Fresh);
        neg.offer_accepted(&offer("a1", 2));
        assert_eq!(neg.check_offer(&offer("a1", 1)), OfferCheck::Stale);
        assert_eq!(neg.round(), 2);
    }

    #[test]
    fn rebinding_resets_candidate_floor() {
        let mut neg = Negotiation::new();
        let mut restart = offer("a1", 4);
        restart.restart = true;
        neg.offer_accepted(&offer("a1", 1));
        neg.offer_accepted(&restart);
        assert_eq!(neg.candidate_floor(), 4);

        neg.mark_closed("a1");
        neg.offer_accepted(&offer("a2", 1));
        assert_eq!(neg.candidate_floor(), 1);
        assert_eq!(neg.remote_connection(), Some("a2"));
        assert!(neg.is_closed("a1"));
    }

    #[test]
    fn offers_from_closed_peer_are_ignored() {
        let mut neg = Negotiation::new();
        neg.mark_closed("a1");
        assert_eq!(neg.check_offer(&offer("a1", 1)), OfferCheck::FromClosedPeer);
        assert_eq!(neg.check_offer(&offer("a2", 1)), OfferCheck::NewRemote);
    }

    #[test]
    fn answer_must_match_latest_unanswered_offer() {
        let mut neg = Negotiation::new();
        let r1 = neg.next_round();
        neg.offer_sent(r1);
        let r2 = neg.next_round();
        neg.offer_sent(r2);

        assert_eq!(neg.check_answer(&answer("b1", "me", r1), "me"), AnswerCheck::Stale);
        assert_eq!(
            neg.check_answer(&answer("b1", "someone-else", r2), "me"),
            AnswerCheck::WrongTarget
        );
        assert_eq!(neg.check_answer(&answer("b1", "me", r2), "me"), AnswerCheck::Apply);
        neg.answer_accepted(&answer("b1", "me", r2));
        assert_eq!(neg.pending_offer(), None);
        assert_eq!(neg.remote_connection(), Some("b1"));
        assert_eq!(neg.check_answer(&answer("b1", "me", r2), "me"), AnswerCheck::Stale);
    }
}
