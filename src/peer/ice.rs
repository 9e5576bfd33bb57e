use crate::peer::types::IceCandidate;
use tracing::debug;

/// Буфер кандидатов, которые пока нельзя применить или отправить
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    /// Кандидаты, полученные до установки remote description
    pending_remote: Vec<IceCandidate>,
    /// Локальные кандидаты, найденные до установки local description
    pending_local: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_remote(&mut self, candidate: IceCandidate) {
        debug!(
            connection_id = %candidate.connection_id,
            round = candidate.round,
            "remote candidate queued"
        );
        self.pending_remote.push(candidate);
    }

    /// Забирает кандидатов соединения `connection_id`, чей round уже покрыт
    /// применённым remote description. Порядок прихода сохраняется: первый
    /// ещё не готовый кандидат блокирует всех следующих от того же отправителя.
    pub fn ready_remote(&mut self, connection_id: &str, remote_round: u64) -> Vec<IceCandidate> {
        let mut ready = Vec::new();
        let mut blocked = false;
        self.pending_remote.retain(|candidate| {
            if candidate.connection_id != connection_id {
                return true;
            }
            if !blocked && candidate.round <= remote_round {
                ready.push(candidate.clone());
                false
            } else {
                blocked = true;
                true
            }
        });
        ready
    }

    /// Выбрасывает кандидатов соединения, которое уже закрыто
    pub fn discard_remote_from(&mut self, connection_id: &str) -> usize {
        let before = self.pending_remote.len();
        self.pending_remote
            .retain(|candidate| candidate.connection_id != connection_id);
        before - self.pending_remote.len()
    }

    /// Выбрасывает кандидатов прошлых ICE-сеансов
    pub fn discard_remote_below(&mut self, floor: u64) -> usize {
        let before = self.pending_remote.len();
        self.pending_remote.retain(|candidate| candidate.round >= floor);
        before - self.pending_remote.len()
    }

    pub fn push_local(&mut self, candidate: IceCandidate) {
        self.pending_local.push(candidate);
    }

    pub fn take_local(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_local)
    }

    pub fn remote_len(&self) -> usize {
        self.pending_remote.len()
    }

    pub fn local_len(&self) -> usize {
        self.pending_local.len()
    }

    pub fn clear_local(&mut self) {
        self.pending_local.clear();
    }

    pub fn clear(&mut self) {
        self.pending_remote.clear();
        self.pending_local.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(conn: &str, round: u64, n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            connection_id: conn.into(),
            round,
        }
    }

    #[test]
    fn buffered_candidates_come_out_in_arrival_order() {
        let mut buf = CandidateBuffer::new();
        for n in 1..=4 {
            buf.push_remote(cand("a1", 1, n));
        }
        assert!(buf.ready_remote("a1", 0).is_empty());
        let ready = buf.ready_remote("a1", 1);
        let order: Vec<_> = ready.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(order, (1..=4).map(|n| cand("a1", 1, n).candidate).collect::<Vec<_>>());
        assert_eq!(buf.remote_len(), 0);
    }

    #[test]
    fn later_round_blocks_the_rest_of_its_sender() {
        let mut buf = CandidateBuffer::new();
        buf.push_remote(cand("a1", 1, 1));
        buf.push_remote(cand("a1", 2, 2));
        buf.push_remote(cand("a1", 1, 3));
        buf.push_remote(cand("b1", 1, 4));

        let ready = buf.ready_remote("a1", 1);
        assert_eq!(ready, vec![cand("a1", 1, 1)]);
        assert_eq!(buf.remote_len(), 3);

        let ready = buf.ready_remote("a1", 2);
        assert_eq!(ready, vec![cand("a1", 2, 2), cand("a1", 1, 3)]);
        assert_eq!(buf.discard_remote_from("b1"), 1);
        assert_eq!(buf.remote_len(), 0);
    }

    #[test]
    fn restart_discards_older_rounds() {
        let mut buf = CandidateBuffer::new();
        buf.push_remote(cand("a1", 1, 1));
        buf.push_remote(cand("a1", 3, 2));
        assert_eq!(buf.discard_remote_below(3), 1);
        assert_eq!(buf.ready_remote("a1", 3), vec![cand("a1", 3, 2)]);
    }

    #[test]
    fn local_candidates_are_taken_once() {
        let mut buf = CandidateBuffer::new();
        buf.push_local(cand("me", 1, 1));
        buf.push_local(cand("me", 1, 2));
        assert_eq!(buf.take_local().len(), 2);
        assert_eq!(buf.local_len(), 0);
    }
}
