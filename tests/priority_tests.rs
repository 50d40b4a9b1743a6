//! Ordering and exclusivity of requests through the device channel.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rs_megad::{
    hal::MockTransport, ChannelConfig, DeviceChannel, DeviceConfig, Error, Query,
    PRIORITY_BACKGROUND, PRIORITY_EXPEDITED,
};

fn channel(mock: &MockTransport) -> Arc<DeviceChannel<MockTransport>> {
    Arc::new(DeviceChannel::new(
        mock.clone(),
        &DeviceConfig::new("10.0.0.14", "sec"),
        ChannelConfig::default(),
    ))
}

async fn wait_queued(ch: &DeviceChannel<MockTransport>, n: usize) {
    while ch.priority_channel().queued() < n {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn expedited_request_overtakes_queued_polls() {
    let mock = MockTransport::new();
    let ch = channel(&mock);
    let holder = ch.priority_channel().acquire(PRIORITY_BACKGROUND).await;

    let mut tasks = Vec::new();
    for (i, priority) in [PRIORITY_BACKGROUND, PRIORITY_EXPEDITED, PRIORITY_BACKGROUND]
        .into_iter()
        .enumerate()
    {
        let task_ch = Arc::clone(&ch);
        tasks.push(tokio::spawn(async move {
            task_ch.request(priority, &Query::port(i)).await
        }));
        wait_queued(&ch, i + 1).await;
    }

    drop(holder);
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(mock.requests(), vec!["pt=1", "pt=0", "pt=2"]);
}

#[tokio::test(start_paused = true)]
async fn one_request_in_flight_at_a_time() {
    let mock = MockTransport::new().with_latency(Duration::from_millis(200));
    let ch = channel(&mock);

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let ch = Arc::clone(&ch);
            let priority = if i % 2 == 0 { PRIORITY_BACKGROUND } else { PRIORITY_EXPEDITED };
            tokio::spawn(async move { ch.request(priority, &Query::port(i)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(mock.requests().len(), 5);
    assert_eq!(mock.max_in_flight(), 1);
    let times = mock.request_times();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(200));
    }
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancelled_waiter_never_reaches_device() {
    let mock = MockTransport::new();
    let ch = channel(&mock);
    let holder = ch.priority_channel().acquire(PRIORITY_BACKGROUND).await;

    let token = CancellationToken::new();
    let waiter = {
        let ch = Arc::clone(&ch);
        let token = token.clone();
        tokio::spawn(async move {
            ch.request_cancellable(PRIORITY_EXPEDITED, &Query::port(7).param("cmd", "7:1"), &token)
                .await
        })
    };
    wait_queued(&ch, 1).await;

    token.cancel();
    assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(ch.priority_channel().queued(), 0);

    drop(holder);
    ch.request(PRIORITY_BACKGROUND, &Query::port(1)).await.unwrap();
    assert_eq!(mock.requests(), vec!["pt=1"]);
}
