//! Property tests for the receiver's flow-control and settlement invariants.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;

use ferrobus_amqp::condition::ErrorCondition;
use ferrobus_amqp::constants::CONDITION_OPERATION_CANCELLED;
use ferrobus_amqp::message::Message;
use ferrobus_amqp::mock::MockFactory;
use ferrobus_amqp::outcome::Outcome;
use ferrobus_amqp::value::ValueMap;
use ferrobus_receiver::{MessageReceiver, ReceiverOptions, RetryConfig};

/// Slop allowed by flow batching on top of the prefetch bound.
const FLOW_BATCH_SLOP: i64 = 100;

#[derive(Debug, Clone)]
enum Op {
    Deliver,
    Receive(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Deliver),
        2 => (1u32..20).prop_map(Op::Receive),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime builds")
}

fn options(prefetch: u32) -> ReceiverOptions {
    ReceiverOptions::default()
        .with_prefetch_count(prefetch)
        .with_retry(RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Prefetched messages plus outstanding credit never exceed the
    /// prefetch count plus the flow-batch slop, under any interleaving of
    /// deliveries and receives.
    #[test]
    fn credit_stays_within_prefetch_bound(
        ops in prop::collection::vec(op_strategy(), 1..30),
        prefetch in 1u32..15,
    ) {
        let rt = runtime();
        rt.block_on(async move {
            let factory = MockFactory::new();
            let receiver = MessageReceiver::create(
                Arc::new(factory.clone()),
                "prop-recv",
                "queue-prop",
                options(prefetch),
            )
            .await
            .expect("receiver opens");
            let link = factory.link();

            let mut delivered: i64 = 0;
            let mut received: i64 = 0;
            for op in ops {
                match op {
                    Op::Deliver => {
                        if link.credit() > 0 {
                            link.deliver(&Message::with_data(Bytes::from_static(b"m")));
                            delivered += 1;
                            tokio::time::sleep(Duration::from_millis(2)).await;
                        }
                    }
                    Op::Receive(n) => {
                        let max = n.clamp(1, prefetch);
                        let batch = receiver
                            .receive_with_timeout(max, Duration::from_millis(10))
                            .await
                            .expect("receive never errors here");
                        received += batch.len() as i64;
                    }
                }
                let buffered = delivered - received;
                let credit = i64::from(link.credit());
                prop_assert!(
                    credit + buffered <= i64::from(prefetch) + FLOW_BATCH_SLOP,
                    "credit {credit} + buffered {buffered} exceeded prefetch {prefetch}"
                );
            }

            receiver.close().await.expect("close succeeds");
            Ok(())
        })?;
    }

    /// Whatever terminal outcome the broker reports, a delivery is
    /// settled exactly once.
    #[test]
    fn deliveries_settle_at_most_once(outcome_choice in 0u8..4) {
        let rt = runtime();
        rt.block_on(async move {
            let factory = MockFactory::new();
            let receiver = MessageReceiver::create(
                Arc::new(factory.clone()),
                "prop-recv",
                "queue-prop",
                options(5),
            )
            .await
            .expect("receiver opens");
            let link = factory.link();

            let tag = link.deliver(&Message::with_data(Bytes::from_static(b"m")));
            receiver
                .receive_with_timeout(1, Duration::from_secs(1))
                .await
                .expect("delivery arrives");

            let remote = match outcome_choice {
                0 => Outcome::Accepted,
                1 => Outcome::Released,
                2 => Outcome::Rejected {
                    error: Some(ErrorCondition::new(CONDITION_OPERATION_CANCELLED)),
                },
                _ => Outcome::Modified {
                    delivery_failed: true,
                    undeliverable_here: false,
                    message_annotations: ValueMap::new(),
                },
            };

            let link_for_task = link.clone();
            let tag_for_task = tag.clone();
            let (result, _) = tokio::join!(receiver.complete(&tag), async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                link_for_task.remote_outcome(&tag_for_task, remote);
            });
            // Success only when the broker accepted; either way the
            // delivery must be settled exactly once.
            let _ = result;
            prop_assert_eq!(link.settle_count(&tag), 1);

            receiver.close().await.expect("close succeeds");
            Ok(())
        })?;
    }

    /// Batches are handed out in request order; tags inside and across
    /// batches preserve broker order.
    #[test]
    fn receives_are_served_fifo(
        first_max in 1u32..5,
        second_max in 1u32..5,
        deliveries in 2usize..8,
    ) {
        let rt = runtime();
        rt.block_on(async move {
            let factory = MockFactory::new();
            let receiver = Arc::new(
                MessageReceiver::create(
                    Arc::new(factory.clone()),
                    "prop-recv",
                    "queue-prop",
                    options(10),
                )
                .await
                .expect("receiver opens"),
            );

            let r1 = {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    receiver
                        .receive_with_timeout(first_max, Duration::from_secs(2))
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            let r2 = {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    receiver
                        .receive_with_timeout(second_max, Duration::from_secs(2))
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;

            let link = factory.link();
            let mut tags = Vec::new();
            for _ in 0..deliveries {
                tags.push(link.deliver(&Message::with_data(Bytes::from_static(b"m"))));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }

            // The first delivery wakes the head request, which drains at
            // most one message (the rest arrive after it completed).
            let first = r1.await.expect("join").expect("receive");
            prop_assert!(!first.is_empty());
            prop_assert_eq!(&first[0].delivery_tag, &tags[0]);

            let second = r2.await.expect("join").expect("receive");
            prop_assert!(!second.is_empty());
            let first_last_index = first.len() - 1;
            prop_assert_eq!(&first[first_last_index].delivery_tag, &tags[first.len() - 1]);
            prop_assert_eq!(&second[0].delivery_tag, &tags[first.len()]);

            receiver.close().await.expect("close succeeds");
            Ok(())
        })?;
    }
}

// Self-contained model of the flow-batching rule, checked independently of
// the receiver wiring: the accumulator never retains a full batch.
mod flush_model {
    use super::*;

    fn flush_threshold(prefetch: u32) -> i64 {
        i64::from(prefetch).min(FLOW_BATCH_SLOP)
    }

    struct Accumulator {
        pending: i64,
        flushed: Vec<i64>,
    }

    impl Accumulator {
        fn new() -> Self {
            Self {
                pending: 0,
                flushed: Vec::new(),
            }
        }

        fn enqueue(&mut self, prefetch: u32, credits: i64) {
            self.pending += credits;
            if self.pending >= i64::from(prefetch) || self.pending >= FLOW_BATCH_SLOP {
                self.flushed.push(self.pending);
                self.pending = 0;
            }
        }
    }

    proptest! {
        #[test]
        fn accumulator_never_holds_a_full_batch(
            credits in prop::collection::vec(1i64..5, 1..200),
            prefetch in 1u32..200,
        ) {
            let mut acc = Accumulator::new();
            for credit in credits {
                acc.enqueue(prefetch, credit);
                prop_assert!(acc.pending < flush_threshold(prefetch));
            }
            for flushed in acc.flushed {
                prop_assert!(flushed >= flush_threshold(prefetch));
            }
        }
    }
}
