// tests/property_test.rs

//! Property-based tests for the runtime coordination core.
//!
//! These check two of the specification's universal properties that are
//! awkward to pin down with a handful of hand-picked examples: P5 (framing
//! round-trip, for arbitrary payloads) and P2 (cause-chain ordering, for
//! arbitrary signal sequences).

use ignis_core::core::errors::CoreError;
use ignis_core::core::procpool::transport;
use proptest::prelude::*;
use tokio::net::UnixStream;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    })]

    /// P5: for any byte string, sending it through the framed transport
    /// yields it unchanged on the other side.
    #[test]
    fn p5_framing_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (a, b) = UnixStream::pair().unwrap();
            let mut a = transport::framed(a);
            let mut b = transport::framed(b);

            transport::send_frame(&mut a, payload.clone().into()).await.unwrap();
            let received = transport::recv_frame(&mut b).await.unwrap().unwrap();
            assert_eq!(received.as_ref(), payload.as_slice());
        });
    }

    /// P2: for any sequence of signals delivered during nested cleanup, the
    /// raised error's cause chain has the last signal outermost and the
    /// first signal as the innermost, deepest cause.
    #[test]
    fn p2_cause_chain_preserves_arrival_order(
        signals in proptest::collection::vec(1i32..32, 1..8)
    ) {
        let mut chain: Option<CoreError> = None;
        for &signo in &signals {
            let err = CoreError::Signal { signo, context: None };
            chain = Some(match chain {
                None => err,
                Some(prev) => err.with_context(prev),
            });
        }
        let mut chain = chain.unwrap();

        // Walk outermost-to-innermost; it must reproduce `signals` reversed.
        let mut observed = Vec::new();
        loop {
            observed.push(chain.signo().unwrap());
            match chain.cancellation_context() {
                Some(inner) => {
                    let next = inner.clone();
                    chain = next;
                }
                None => break,
            }
        }
        let expected: Vec<i32> = signals.iter().rev().copied().collect();
        assert_eq!(observed, expected);
    }
}
