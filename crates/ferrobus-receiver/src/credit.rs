//! Batched link-credit accounting.
//!
//! Flow frames are not sent per message. Credits accumulate and are flushed
//! once the batch reaches the prefetch count or the flush threshold,
//! whichever is lower. The prefetch bound guarantees the broker can never
//! outrun replenishment.

use ferrobus_amqp::link::ReceiveLink;

/// Accumulated credit is flushed once it reaches this many, regardless of
/// the prefetch count.
pub(crate) const FLOW_BATCH_THRESHOLD: i64 = 100;

/// Accumulates credit and decides when to issue a flow frame.
pub(crate) struct CreditController {
    next_credit_to_flow: i64,
    browsable: bool,
}

impl CreditController {
    pub fn new(browsable: bool) -> Self {
        Self {
            next_credit_to_flow: 0,
            browsable,
        }
    }

    /// Clears the accumulator; called when a (re)opened link starts from a
    /// fresh credit state.
    pub fn reset(&mut self) {
        self.next_credit_to_flow = 0;
    }

    /// Credit batched but not yet flowed. May be negative after a prefetch
    /// increase; the deficit is repaid by later replenishment.
    pub fn pending(&self) -> i64 {
        self.next_credit_to_flow
    }

    /// Adds credit without touching the link (used while no link exists).
    pub fn accumulate(&mut self, credits: i64) {
        if !self.browsable {
            self.next_credit_to_flow += credits;
        }
    }

    /// Adds credit and flushes the batch to the link when the threshold is
    /// reached. Returns the flowed amount, if any. Browsable receivers never
    /// issue credit.
    pub fn enqueue(
        &mut self,
        link: &mut dyn ReceiveLink,
        prefetch_count: u32,
        credits: i64,
    ) -> Option<u32> {
        if self.browsable {
            return None;
        }
        self.next_credit_to_flow += credits;
        if self.next_credit_to_flow >= i64::from(prefetch_count)
            || self.next_credit_to_flow >= FLOW_BATCH_THRESHOLD
        {
            let flow = self.next_credit_to_flow as u32;
            self.next_credit_to_flow = 0;
            link.flow(flow);
            Some(flow)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobus_amqp::link::{LinkFactory, LinkSettings, SettleModePair, Source};
    use ferrobus_amqp::mock::MockFactory;
    use ferrobus_amqp::value::ValueMap;

    fn open_link(factory: &MockFactory) -> Box<dyn ReceiveLink> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        factory
            .open_receive_link(
                LinkSettings {
                    name: "credit-test".into(),
                    source: Source {
                        address: "q".into(),
                        filter: ValueMap::new(),
                    },
                    properties: ValueMap::new(),
                    settle_mode: SettleModePair::peek_lock(),
                },
                tx,
                1,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn credits_batch_until_prefetch_count() {
        let factory = MockFactory::new();
        let mut link = open_link(&factory);
        let mut credit = CreditController::new(false);

        assert_eq!(credit.enqueue(link.as_mut(), 10, 4), None);
        assert_eq!(credit.enqueue(link.as_mut(), 10, 5), None);
        assert_eq!(credit.enqueue(link.as_mut(), 10, 1), Some(10));
        assert_eq!(credit.pending(), 0);
        assert_eq!(factory.link().flow_history(), vec![10]);
    }

    #[tokio::test]
    async fn large_prefetch_flushes_at_batch_threshold() {
        let factory = MockFactory::new();
        let mut link = open_link(&factory);
        let mut credit = CreditController::new(false);

        for _ in 0..99 {
            assert_eq!(credit.enqueue(link.as_mut(), 5000, 1), None);
        }
        assert_eq!(credit.enqueue(link.as_mut(), 5000, 1), Some(100));
    }

    #[tokio::test]
    async fn browsable_never_flows() {
        let factory = MockFactory::new();
        let mut link = open_link(&factory);
        let mut credit = CreditController::new(true);

        assert_eq!(credit.enqueue(link.as_mut(), 10, 500), None);
        assert_eq!(credit.pending(), 0);
        assert!(factory.link().flow_history().is_empty());
    }

    #[tokio::test]
    async fn growth_deficit_is_repaid_before_flowing() {
        let factory = MockFactory::new();
        let mut link = open_link(&factory);
        let mut credit = CreditController::new(false);

        // A prefetch increase parked a -5 deficit; replenishment climbs
        // back before flushing.
        assert_eq!(credit.enqueue(link.as_mut(), 3, -5), None);
        for _ in 0..7 {
            assert_eq!(credit.enqueue(link.as_mut(), 3, 1), None);
        }
        assert_eq!(credit.enqueue(link.as_mut(), 3, 1), Some(3));
    }
}
