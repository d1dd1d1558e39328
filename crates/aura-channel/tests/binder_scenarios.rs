//! Binder Integration Tests
//!
//! End-to-end behavior of a binder sharing one mock channel:
//! - Concurrent demand collapsing into a single open
//! - Fault tolerance and reconnection
//! - Masked and unmasked close of a faulted binder
//! - Repeated retire/reopen cycles
#![allow(clippy::unwrap_used)] // Test code uses unwrap for clarity

use assert_matches::assert_matches;
use aura_channel::testing::{MockChannel, MockChannelFactory};
use aura_channel::{
    BinderConfig, BinderEvent, Channel, ChannelBinder, ChannelError, ChannelResult,
    CommunicationState, FaultToleranceMode, MaskingMode, ReceiveOutcome, SynchronizerState,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn binder(factory: &Arc<MockChannelFactory>, config: BinderConfig) -> ChannelBinder<MockChannel> {
    ChannelBinder::<MockChannel>::with_factory(factory.clone(), config).unwrap()
}

fn connection_lost_count(events: &mut broadcast::Receiver<BinderEvent>) -> usize {
    let mut lost = 0;
    while let Ok(event) = events.try_recv() {
        if event == BinderEvent::ConnectionLost {
            lost += 1;
        }
    }
    lost
}

/// Concurrent sends arriving with no channel share one open
#[tokio::test(start_paused = true)]
async fn test_concurrent_sends_share_single_open() -> ChannelResult<()> {
    init_tracing();
    let factory = Arc::new(MockChannelFactory::new());
    factory.set_open_delay(Duration::from_millis(50));
    let config = BinderConfig {
        connect_on_open: false,
        ..BinderConfig::testing()
    };
    let binder = binder(&factory, config);
    binder.open(TIMEOUT).await?;
    assert_eq!(factory.calls(), 0);

    let sends = ["a", "b", "c"]
        .into_iter()
        .map(|message| binder.send(message.to_string(), TIMEOUT, MaskingMode::NONE));
    for result in join_all(sends).await {
        result?;
    }

    assert_eq!(factory.calls(), 1);
    let channel = factory.last_channel().unwrap();
    assert_eq!(channel.open_count(), 1);
    let mut sent = channel.sent_messages();
    sent.sort();
    assert_eq!(sent, vec!["a", "b", "c"]);
    assert_eq!(binder.synchronizer().in_flight(), 0);
    Ok(())
}

/// A fault while two operations hold the channel retires it after the last return
#[tokio::test(start_paused = true)]
async fn test_fault_while_held_retires_after_last_return() -> ChannelResult<()> {
    init_tracing();
    let factory = Arc::new(MockChannelFactory::new());
    let config = BinderConfig::testing().with_fault_tolerance(FaultToleranceMode::Always);
    let binder = binder(&factory, config);
    binder.open(TIMEOUT).await?;
    let mut events = binder.subscribe();
    let channel = factory.last_channel().unwrap();

    let budget = Duration::from_millis(200);
    let fault_when_held = async {
        for _ in 0..10 {
            if binder.synchronizer().in_flight() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(binder.synchronizer().in_flight(), 2);
        channel.fault();
    };
    let (first, second, ()) = tokio::join!(
        binder.try_receive(budget, MaskingMode::NONE),
        binder.try_receive(budget, MaskingMode::NONE),
        fault_when_held,
    );

    assert_eq!(first?, ReceiveOutcome::TimedOut);
    assert_eq!(second?, ReceiveOutcome::TimedOut);
    assert_eq!(binder.state(), CommunicationState::Opened);
    assert_eq!(binder.synchronizer().state(), SynchronizerState::NoChannel);
    assert_eq!(binder.synchronizer().in_flight(), 0);
    assert_eq!(connection_lost_count(&mut events), 1);
    Ok(())
}

/// Receiving with a zero budget and no channel returns at once
#[tokio::test]
async fn test_zero_budget_receive_without_channel() -> ChannelResult<()> {
    let binder: ChannelBinder<MockChannel> = ChannelBinder::accepting(BinderConfig::server())?;
    binder.open(TIMEOUT).await?;

    let outcome = binder.try_receive(Duration::ZERO, MaskingMode::NONE).await?;
    assert_eq!(outcome, ReceiveOutcome::TimedOut);
    assert_eq!(binder.synchronizer().queued_waiters(), 0);
    Ok(())
}

/// Closing a faulted binder reports the fault unless masked
#[tokio::test]
async fn test_close_of_faulted_binder() -> ChannelResult<()> {
    let factory = Arc::new(MockChannelFactory::new());

    let unmasked = binder(&factory, BinderConfig::testing());
    unmasked.open(TIMEOUT).await?;
    unmasked.fault(ChannelError::communication("peer vanished"));
    assert_matches!(
        unmasked.close_with_masking(TIMEOUT, MaskingMode::NONE).await,
        Err(ChannelError::Faulted { .. })
    );

    let masked = binder(&factory, BinderConfig::testing());
    masked.open(TIMEOUT).await?;
    masked.fault(ChannelError::communication("peer vanished"));
    masked
        .close_with_masking(TIMEOUT, MaskingMode::HANDLED)
        .await?;
    assert_eq!(masked.state(), CommunicationState::Closed);
    Ok(())
}

/// Every retire/reopen cycle opens and tears down exactly one channel
#[tokio::test]
async fn test_repeated_retire_and_reopen() -> ChannelResult<()> {
    const CYCLES: usize = 5;
    let factory = Arc::new(MockChannelFactory::new());
    let config = BinderConfig {
        connect_on_open: false,
        ..BinderConfig::testing().with_fault_tolerance(FaultToleranceMode::Always)
    };
    let binder = binder(&factory, config);
    binder.open(TIMEOUT).await?;

    for cycle in 0..CYCLES {
        binder
            .send(format!("message-{cycle}"), TIMEOUT, MaskingMode::NONE)
            .await?;
        assert_eq!(binder.synchronizer().in_flight(), 0);
        binder.abort_current_channel()?;
        assert_eq!(binder.synchronizer().state(), SynchronizerState::NoChannel);
    }

    assert_eq!(factory.calls(), CYCLES);
    let channels = factory.channels();
    assert_eq!(channels.len(), CYCLES);
    for channel in &channels {
        assert_eq!(channel.open_count(), 1);
        assert_eq!(channel.abort_count(), 1);
        assert_eq!(channel.state(), CommunicationState::Closed);
        assert_eq!(channel.sent_messages().len(), 1);
    }

    binder.close(TIMEOUT).await?;
    assert_eq!(binder.synchronizer().state(), SynchronizerState::Closed);
    Ok(())
}

/// An open that outlives its caller's budget is handed to the next caller
#[tokio::test(start_paused = true)]
async fn test_timed_out_open_is_retried_by_next_caller() -> ChannelResult<()> {
    let factory = Arc::new(MockChannelFactory::new());
    factory.set_open_delay(Duration::from_millis(200));
    let config = BinderConfig {
        connect_on_open: false,
        ..BinderConfig::client()
    };
    let binder = binder(&factory, config);
    binder.open(TIMEOUT).await?;

    binder
        .send("lost".into(), Duration::from_millis(50), MaskingMode::HANDLED)
        .await?;
    assert_eq!(binder.synchronizer().state(), SynchronizerState::NoChannel);

    factory.set_open_delay(Duration::ZERO);
    binder.send("kept".into(), TIMEOUT, MaskingMode::NONE).await?;

    assert_eq!(factory.calls(), 2);
    assert_eq!(factory.channels()[0].state(), CommunicationState::Closed);
    assert_eq!(factory.last_channel().unwrap().sent_messages(), vec!["kept"]);
    Ok(())
}

/// Protocol failures are published rather than returned under `UNHANDLED`
#[tokio::test]
async fn test_unhandled_errors_are_published() -> ChannelResult<()> {
    let factory = Arc::new(MockChannelFactory::new());
    let binder = binder(&factory, BinderConfig::testing());
    binder.open(TIMEOUT).await?;
    let mut events = binder.subscribe();

    factory
        .last_channel()
        .unwrap()
        .fail_next_send(ChannelError::protocol("unexpected frame"));
    binder.send("x".into(), TIMEOUT, MaskingMode::ALL).await?;

    assert_matches!(
        events.try_recv(),
        Ok(BinderEvent::UnhandledError(ChannelError::Protocol { .. }))
    );
    Ok(())
}

/// A non-tolerant binder faults with its channel and reports the fault to
/// every later operation regardless of masking
#[tokio::test]
async fn test_non_tolerant_binder_faults_with_channel() -> ChannelResult<()> {
    let factory = Arc::new(MockChannelFactory::new());
    let binder = binder(&factory, BinderConfig::testing());
    binder.open(TIMEOUT).await?;
    let mut events = binder.subscribe();

    factory.last_channel().unwrap().fault();

    assert_eq!(binder.state(), CommunicationState::Faulted);
    assert_eq!(binder.synchronizer().state(), SynchronizerState::Faulted);
    for masking in [MaskingMode::NONE, MaskingMode::UNHANDLED, MaskingMode::ALL] {
        assert_matches!(
            binder.try_receive(TIMEOUT, masking).await,
            Err(ChannelError::Faulted { .. })
        );
    }
    assert_matches!(
        binder.send("late".into(), TIMEOUT, MaskingMode::ALL).await,
        Err(ChannelError::Faulted { .. })
    );
    assert_matches!(events.try_recv(), Ok(BinderEvent::Faulted));
    assert!(events.try_recv().is_err());
    assert_eq!(factory.calls(), 1);
    Ok(())
}

/// The default open and close use the configured budgets and masking
#[tokio::test]
async fn test_default_open_and_close() -> ChannelResult<()> {
    let factory = Arc::new(MockChannelFactory::new());
    let binder = binder(&factory, BinderConfig::client());
    binder.open_default().await?;
    assert_eq!(binder.state(), CommunicationState::Opened);
    assert_eq!(factory.calls(), 1);

    binder.send_default("hello".into()).await?;
    binder.fault(ChannelError::communication("peer vanished"));
    binder.close_default().await?;

    assert_eq!(binder.state(), CommunicationState::Closed);
    assert_eq!(factory.channels()[0].state(), CommunicationState::Closed);
    Ok(())
}
