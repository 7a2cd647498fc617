use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::time::Instant;
use udpnat::{CloseReason, NatConfig, NatService};

fn short_lived() -> NatConfig {
    NatConfig::with_max_age(Duration::from_millis(50))
}

#[tokio::test(start_paused = true)]
async fn idle_flow_is_evicted_and_blocked_read_fails() -> Result<()> {
    let (handler, mut events) = recorder(None);
    let service = NatService::new(short_lived(), handler)?;
    let shutdown = CancellationToken::new();
    let sweeper = service.spawn_sweeper(shutdown.clone());
    let ctx = CancellationToken::new();

    service
        .submit(&ctx, "idle", Bytes::from_static(b"x"), client(), upstream(), discard_writer)
        .await;
    let session = service.table().get(&"idle").expect("flow created");
    assert!(matches!(next_event(&mut events).await, FlowEvent::Started { .. }));
    assert!(matches!(next_event(&mut events).await, FlowEvent::Packet { .. }));

    // The handler is now parked in read_packet.
    tokio::time::sleep(Duration::from_millis(60)).await;

    match next_event(&mut events).await {
        FlowEvent::ReadFailed { error: NatError::Closed, .. } => {}
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(session.close_reason(), Some(CloseReason::Evicted));
    assert!(!service.table().contains_key(&"idle"));

    shutdown.cancel();
    sweeper.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn expired_flow_is_replaced_on_next_packet() -> Result<()> {
    let (handler, mut events) = recorder(None);
    let service = NatService::new(short_lived(), handler)?;
    let ctx = CancellationToken::new();

    service
        .submit(&ctx, 1u8, Bytes::from_static(b"first"), client(), upstream(), discard_writer)
        .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    // No sweeper: the stale entry is found and evicted by the lookup itself.
    tokio::time::sleep(Duration::from_millis(60)).await;
    service
        .submit(&ctx, 1u8, Bytes::from_static(b"second"), client(), upstream(), discard_writer)
        .await;

    let mut old_closed = false;
    let mut new_flow_packet = None;
    while !(old_closed && new_flow_packet.is_some()) {
        match next_event(&mut events).await {
            FlowEvent::ReadFailed { flow: 0, error: NatError::Closed } => old_closed = true,
            FlowEvent::Started { flow, .. } => assert_eq!(flow, 1),
            FlowEvent::Packet { flow: 1, packet } => new_flow_packet = Some(packet),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(new_flow_packet.map(|p| p.buffer), Some(Bytes::from_static(b"second")));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn traffic_on_other_keys_evicts_idle_flow() -> Result<()> {
    let (handler, mut events) = recorder(None);
    let service = NatService::new(short_lived(), handler)?;
    let ctx = CancellationToken::new();

    service
        .submit(&ctx, 1u8, Bytes::from_static(b"idle"), client(), upstream(), discard_writer)
        .await;
    let idle = service.table().get(&1).expect("flow created");
    next_event(&mut events).await;
    next_event(&mut events).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    service
        .submit(&ctx, 2u8, Bytes::from_static(b"busy"), client(), upstream(), discard_writer)
        .await;

    let mut idle_closed = false;
    let mut busy_packet = false;
    while !(idle_closed && busy_packet) {
        match next_event(&mut events).await {
            FlowEvent::ReadFailed { flow: 0, error: NatError::Closed } => idle_closed = true,
            FlowEvent::Started { flow: 1, .. } => {}
            FlowEvent::Packet { flow: 1, .. } => busy_packet = true,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(idle.close_reason(), Some(CloseReason::Evicted));
    assert!(!service.table().contains_key(&1));
    assert_eq!(service.active_flows(), 1);
    Ok(())
}

#[tokio::test]
async fn completed_flow_is_not_reused() -> Result<()> {
    let (handler, mut events) = recorder(Some(1));
    let service = NatService::new(NatConfig::default(), handler)?;
    let ctx = CancellationToken::new();

    service
        .submit(&ctx, 'k', Bytes::from_static(b"one"), client(), upstream(), discard_writer)
        .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    let table = service.table().clone();
    wait_until(Duration::from_secs(1), || table.is_empty()).await?;

    service
        .submit(&ctx, 'k', Bytes::from_static(b"two"), client(), upstream(), discard_writer)
        .await;
    match next_event(&mut events).await {
        FlowEvent::Started { flow, .. } => assert_eq!(flow, 1, "a fresh handler invocation"),
        other => panic!("unexpected event: {other:?}"),
    }
    Ok(())
}

/// Reads with a past deadline, then without one.
struct DeadlineProbe {
    results: mpsc::UnboundedSender<std::result::Result<Packet, NatError>>,
}

#[async_trait]
impl FlowHandler for DeadlineProbe {
    async fn new_flow(
        &self,
        _ctx: CancellationToken,
        session: Arc<NatSession>,
        _source: SocketAddr,
        _destination: SocketAddr,
        _done: FlowDone,
    ) -> Result<()> {
        let _ = self.results.send(session.read_packet().await);

        session.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)));
        let _ = self.results.send(session.read_packet().await);

        session.set_read_deadline(None);
        let _ = self.results.send(session.read_packet().await);
        Ok(())
    }
}

#[tokio::test]
async fn deadline_failure_leaves_flow_usable() -> Result<()> {
    let (results_tx, mut results) = mpsc::unbounded_channel();
    let service = NatService::new(NatConfig::default(), DeadlineProbe { results: results_tx })?;
    let ctx = CancellationToken::new();

    service
        .submit(&ctx, 0u64, Bytes::from_static(b"before"), client(), upstream(), discard_writer)
        .await;
    let first = within(results.recv()).await.expect("first read");
    assert_eq!(first?.buffer, Bytes::from_static(b"before"));

    let second = within(results.recv()).await.expect("second read");
    assert!(matches!(second, Err(NatError::DeadlineExceeded)));
    assert!(service.table().contains_key(&0));

    service
        .submit(&ctx, 0u64, Bytes::from_static(b"after"), client(), upstream(), discard_writer)
        .await;
    let third = within(results.recv()).await.expect("third read");
    assert_eq!(third?.buffer, Bytes::from_static(b"after"));
    Ok(())
}

/// Closes its own session twice before returning.
struct DoubleClose;

#[async_trait]
impl FlowHandler for DoubleClose {
    async fn new_flow(
        &self,
        _ctx: CancellationToken,
        session: Arc<NatSession>,
        _source: SocketAddr,
        _destination: SocketAddr,
        _done: FlowDone,
    ) -> Result<()> {
        session.read_packet().await?;
        session.close()?;
        session.close()?;
        assert!(matches!(session.read_packet().await, Err(NatError::Closed)));
        Ok(())
    }
}

#[tokio::test]
async fn repeated_close_releases_writer_once() -> Result<()> {
    let service = NatService::new(NatConfig::default(), DoubleClose)?;
    let ctx = CancellationToken::new();
    let closes = Arc::new(AtomicUsize::new(0));
    let writer_factory = |_: &NatSession| {
        let closes = closes.clone();
        WriteBack::new(Discard).with_close(move || {
            closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };

    service
        .submit(&ctx, "twice", Bytes::from_static(b"x"), client(), upstream(), writer_factory)
        .await;
    let session = service.table().get(&"twice").expect("flow created");

    let table = service.table().clone();
    wait_until(Duration::from_secs(1), || table.is_empty()).await?;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(session.close_reason(), Some(CloseReason::Closed));
    Ok(())
}

#[tokio::test]
async fn cancelled_context_ends_its_flows() -> Result<()> {
    let (handler, mut events) = recorder(None);
    let service = NatService::new(NatConfig::default(), handler)?;
    let listener_ctx = CancellationToken::new();

    service
        .submit(&listener_ctx, 3i32, Bytes::from_static(b"x"), client(), upstream(), discard_writer)
        .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    listener_ctx.cancel();
    match next_event(&mut events).await {
        FlowEvent::ReadFailed { error: NatError::Closed, .. } => {}
        other => panic!("unexpected event: {other:?}"),
    }
    let table = service.table().clone();
    wait_until(Duration::from_secs(1), || table.is_empty()).await?;
    Ok(())
}
