//! Property-based tests for ICE candidate ordering
//!
//! Whatever interleaving of early candidates and the remote description
//! occurs, every candidate is applied exactly once and in arrival order.

use crabmeet::mesh::{IceCandidateQueue, QueueOutcome};
use crabmeet::rtc::IceCandidate;
use proptest::prelude::*;

fn candidate(n: usize) -> IceCandidate {
    IceCandidate::new(format!("candidate:{} 1 UDP 2122 192.168.1.{} {} typ host", n, n % 255, 5000 + n))
}

proptest! {
    /// Candidates come out in exactly the order they went in.
    #[test]
    fn applied_order_matches_arrival(total in 0usize..64, description_at in 0usize..64) {
        let description_at = description_at.min(total);
        let mut queue = IceCandidateQueue::new();
        let mut applied = Vec::new();

        for n in 0..total {
            if n == description_at {
                applied.extend(queue.drain());
            }
            match queue.enqueue(candidate(n)) {
                QueueOutcome::Queued => {}
                QueueOutcome::ApplyNow(c) => applied.push(c),
            }
        }
        if description_at == total {
            applied.extend(queue.drain());
        }

        let expected: Vec<IceCandidate> = (0..total).map(candidate).collect();
        prop_assert_eq!(applied, expected);
        prop_assert!(queue.is_empty());
    }

    /// Draining more than once never replays candidates.
    #[test]
    fn drain_is_one_shot(early in 0usize..32, extra_drains in 1usize..4) {
        let mut queue = IceCandidateQueue::new();
        for n in 0..early {
            prop_assert_eq!(queue.enqueue(candidate(n)), QueueOutcome::Queued);
        }

        prop_assert_eq!(queue.drain().len(), early);
        for _ in 0..extra_drains {
            prop_assert!(queue.drain().is_empty());
        }
        prop_assert!(queue.is_drained());
    }
}
