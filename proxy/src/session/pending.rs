use std::collections::VecDeque;

use crate::config::QueueOverflow;
use crate::stratum::protocol::ClientFrame;

/// Result of queueing a frame while no pool is connected.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queue full; the new frame was refused.
    Rejected(ClientFrame),
    /// Queue full; this older frame was evicted to make room.
    Evicted(ClientFrame),
}

/// Bounded FIFO of client frames awaiting a live upstream.
#[derive(Debug)]
pub struct PendingQueue {
    frames: VecDeque<ClientFrame>,
    limit: usize,
    overflow: QueueOverflow,
}

impl PendingQueue {
    pub fn new(limit: usize, overflow: QueueOverflow) -> Self {
        Self { frames: VecDeque::new(), limit: limit.max(1), overflow }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn has_login(&self) -> bool {
        self.frames.iter().any(ClientFrame::is_login)
    }

    pub fn push(&mut self, frame: ClientFrame) -> PushOutcome {
        if self.frames.len() < self.limit {
            self.frames.push_back(frame);
            return PushOutcome::Queued;
        }

        match self.overflow {
            QueueOverflow::RejectNewest => PushOutcome::Rejected(frame),
            QueueOverflow::DropOldest => {
                // Logins are never evicted; the pool needs one before anything else
                match self.frames.iter().position(|f| !f.is_login()) {
                    Some(idx) => {
                        let evicted = self.frames.remove(idx);
                        self.frames.push_back(frame);
                        evicted.map_or(PushOutcome::Queued, PushOutcome::Evicted)
                    }
                    None => PushOutcome::Rejected(frame),
                }
            }
        }
    }

    /// Appends past the limit. Used for the login that opens a session.
    pub fn push_forced(&mut self, frame: ClientFrame) {
        self.frames.push_back(frame);
    }

    /// Puts a replayed login ahead of everything else.
    pub fn push_front(&mut self, frame: ClientFrame) {
        self.frames.push_front(frame);
    }

    pub fn pop_front(&mut self) -> Option<ClientFrame> {
        self.frames.pop_front()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(n: u64) -> ClientFrame {
        ClientFrame::parse(&format!(
            r#"{{"id":{},"method":"submit","params":{{"job_id":"j","nonce":"{:08x}","result":"00"}}}}"#,
            n, n
        ))
        .unwrap()
    }

    fn login() -> ClientFrame {
        ClientFrame::parse(r#"{"id":1,"method":"login","params":{"login":"4User"}}"#).unwrap()
    }

    fn ids(q: &mut PendingQueue) -> Vec<u64> {
        std::iter::from_fn(|| q.pop_front())
            .map(|f| f.id.as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = PendingQueue::new(8, QueueOverflow::RejectNewest);
        for n in 2..7 {
            assert!(matches!(q.push(submit(n)), PushOutcome::Queued));
        }
        assert_eq!(ids(&mut q), vec![2, 3, 4, 5, 6]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_reject_newest() {
        let mut q = PendingQueue::new(2, QueueOverflow::RejectNewest);
        q.push(submit(2));
        q.push(submit(3));
        match q.push(submit(4)) {
            PushOutcome::Rejected(f) => assert_eq!(f.id.as_u64(), Some(4)),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(ids(&mut q), vec![2, 3]);
    }

    #[test]
    fn test_drop_oldest_spares_login() {
        let mut q = PendingQueue::new(2, QueueOverflow::DropOldest);
        q.push_forced(login());
        q.push(submit(2));
        match q.push(submit(3)) {
            PushOutcome::Evicted(f) => assert_eq!(f.id.as_u64(), Some(2)),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert!(q.has_login());
        assert_eq!(ids(&mut q), vec![1, 3]);
    }

    #[test]
    fn test_drop_oldest_all_logins_rejects() {
        let mut q = PendingQueue::new(1, QueueOverflow::DropOldest);
        q.push_forced(login());
        assert!(matches!(q.push(submit(2)), PushOutcome::Rejected(_)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_replay_goes_first() {
        let mut q = PendingQueue::new(4, QueueOverflow::RejectNewest);
        q.push(submit(5));
        assert!(!q.has_login());
        q.push_front(login());
        assert_eq!(ids(&mut q), vec![1, 5]);
    }

    #[test]
    fn test_failed_frame_returns_to_head() {
        let mut q = PendingQueue::new(4, QueueOverflow::RejectNewest);
        q.push_forced(login());
        q.push(submit(2));
        q.push(submit(3));

        let head = q.pop_front().unwrap();
        assert!(head.is_login());
        q.push_front(head);
        assert_eq!(ids(&mut q), vec![1, 2, 3]);
    }
}
