//! FIFO of atoms waiting for an embedding.

use crate::embedding::EmbedRequest;
use crate::model::atom::AtomId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Queued request plus the number of failed attempts so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEmbedding {
    pub request: EmbedRequest,
    pub attempts: u32,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingEmbedding>,
    queued: HashSet<AtomId>,
    failed: Vec<PendingEmbedding>,
}

/// Shared deferred-embedding queue.
///
/// An atom is queued at most once at a time; re-enqueueing a queued atom is
/// a no-op.
#[derive(Default)]
pub struct EmbeddingQueue {
    state: Mutex<QueueState>,
}

impl EmbeddingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the atom is already waiting.
    pub fn enqueue(&self, request: EmbedRequest) -> bool {
        let mut state = self.state.lock();
        if !state.queued.insert(request.atom_id) {
            return false;
        }
        state.pending.push_back(PendingEmbedding {
            request,
            attempts: 0,
        });
        true
    }

    /// Removes up to `max` requests from the front.
    pub fn take_batch(&self, max: usize) -> Vec<PendingEmbedding> {
        let mut state = self.state.lock();
        let count = max.min(state.pending.len());
        let batch: Vec<PendingEmbedding> = state.pending.drain(..count).collect();
        for pending in &batch {
            state.queued.remove(&pending.request.atom_id);
        }
        batch
    }

    /// Puts a request back at the end of the queue.
    pub fn requeue(&self, pending: PendingEmbedding) {
        let mut state = self.state.lock();
        if state.queued.insert(pending.request.atom_id) {
            state.pending.push_back(pending);
        }
    }

    /// Parks a request that exhausted its attempts.
    pub fn mark_failed(&self, pending: PendingEmbedding) {
        self.state.lock().failed.push(pending);
    }

    /// Moves every parked request back to the queue with a fresh attempt
    /// budget. Returns how many were queued again.
    pub fn requeue_failed(&self) -> usize {
        let mut state = self.state.lock();
        let parked = std::mem::take(&mut state.failed);
        let mut requeued = 0;
        for mut pending in parked {
            if state.queued.insert(pending.request.atom_id) {
                pending.attempts = 0;
                state.pending.push_back(pending);
                requeued += 1;
            }
        }
        requeued
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failed(&self) -> Vec<PendingEmbedding> {
        self.state.lock().failed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::EmbeddingQueue;
    use crate::embedding::EmbedRequest;
    use crate::hash::hash;
    use crate::model::atom::Modality;
    use crate::model::tenant::TenantId;
    use uuid::Uuid;

    fn request(content: &[u8]) -> EmbedRequest {
        EmbedRequest {
            atom_id: Uuid::new_v4(),
            tenant_id: TenantId::new("default").unwrap(),
            content_hash: hash(content),
            modality: Modality::Text,
            content: content.to_vec(),
        }
    }

    #[test]
    fn batches_come_out_in_fifo_order_and_skip_duplicates() {
        let queue = EmbeddingQueue::new();
        let first = request(b"one");
        assert!(queue.enqueue(first.clone()));
        assert!(!queue.enqueue(first.clone()));
        queue.enqueue(request(b"two"));
        queue.enqueue(request(b"three"));

        let batch = queue.take_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].request, first);
        assert_eq!(queue.len(), 1);

        let mut retry = batch[0].clone();
        retry.attempts += 1;
        queue.requeue(retry);
        let rest = queue.take_batch(10);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].attempts, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn failed_requests_can_be_queued_again() {
        let queue = EmbeddingQueue::new();
        let parked = request(b"parked");
        queue.enqueue(parked.clone());
        let mut batch = queue.take_batch(1);
        batch[0].attempts = 5;
        queue.mark_failed(batch.remove(0));
        assert!(queue.is_empty());

        assert_eq!(queue.requeue_failed(), 1);
        assert!(queue.failed().is_empty());
        let again = queue.take_batch(1);
        assert_eq!(again[0].request, parked);
        assert_eq!(again[0].attempts, 0);
        assert_eq!(queue.requeue_failed(), 0);
    }
}
