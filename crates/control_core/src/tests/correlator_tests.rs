use super::*;
use crate::{error::TransportError, relay::RelayHub};
use shared::protocol::CommandResult;

fn batch() -> Vec<DeviceCommand> {
    vec![DeviceCommand::Pause { duration_ms: 1000 }]
}

fn completed() -> BatchOutcome {
    BatchOutcome::Completed {
        results: vec![CommandResult::success()],
    }
}

fn attached_correlator() -> (
    Correlator,
    Arc<RelayHub>,
    tokio::sync::mpsc::UnboundedReceiver<RelayMessage>,
) {
    let hub = Arc::new(RelayHub::new());
    let (_, outbound) = hub.attach();
    (Correlator::new(hub.clone()), hub, outbound)
}

#[tokio::test]
async fn response_resolves_pending_batch_exactly_once() {
    let (correlator, _hub, mut outbound) = attached_correlator();

    let pending = correlator.dispatch(batch()).expect("dispatch");
    let id = pending.correlation_id();
    assert_eq!(correlator.pending_count(), 1);

    let Some(RelayMessage::DispatchBatch {
        correlation_id,
        commands,
    }) = outbound.recv().await
    else {
        panic!("expected dispatch_batch");
    };
    assert_eq!(correlation_id, id);
    assert_eq!(commands, batch());

    assert!(correlator.on_response(id, completed()));
    assert_eq!(correlator.pending_count(), 0);
    assert!(!correlator.on_response(id, completed()));

    let outcome = correlator
        .wait(pending, Duration::from_secs(1))
        .await
        .expect("outcome");
    assert_eq!(outcome, completed());
}

#[tokio::test]
async fn unknown_ids_are_discarded() {
    let (correlator, _hub, _outbound) = attached_correlator();
    assert!(!correlator.on_response(CorrelationId::random(), completed()));
}

#[tokio::test]
async fn ids_are_unique_across_dispatches() {
    let (correlator, _hub, _outbound) = attached_correlator();
    let first = correlator.dispatch(batch()).expect("dispatch");
    let second = correlator.dispatch(batch()).expect("dispatch");
    assert_ne!(first.correlation_id(), second.correlation_id());
    assert_eq!(correlator.pending_count(), 2);
}

#[test]
fn transport_failure_leaves_no_pending_record() {
    let correlator = Correlator::new(Arc::new(RelayHub::new()));
    let err = correlator.dispatch(batch()).expect_err("no agent");
    assert_eq!(err, DispatchError::Transport(TransportError::Disconnected));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn timeout_abandons_the_correlation() {
    let (correlator, _hub, _outbound) = attached_correlator();
    let pending = correlator.dispatch(batch()).expect("dispatch");
    let id = pending.correlation_id();

    let err = correlator
        .wait(pending, Duration::from_millis(10))
        .await
        .expect_err("timeout");
    assert_eq!(err, CorrelationError::TimedOut(id));
    assert_eq!(correlator.pending_count(), 0);
    assert!(!correlator.on_response(id, completed()));
}

#[tokio::test]
async fn reaper_removes_expired_records() {
    let (correlator, _hub, _outbound) = attached_correlator();
    let pending = correlator.dispatch(batch()).expect("dispatch");
    let id = pending.correlation_id();

    assert!(correlator.reap_expired(Duration::from_secs(60)).is_empty());
    let reaped = correlator.reap_expired(Duration::ZERO);
    assert_eq!(reaped, vec![(id, batch())]);

    let err = correlator
        .wait(pending, Duration::from_secs(1))
        .await
        .expect_err("abandoned");
    assert_eq!(err, CorrelationError::Abandoned(id));
}
