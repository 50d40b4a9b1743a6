//! Retry, timeout and reply handling of the device channel.

use std::time::Duration;

use rs_megad::{
    hal::{MockReply, MockTransport},
    traits::HttpReply,
    ChannelConfig, DeviceChannel, DeviceConfig, Error, PortId, PortValue, Query, TransportError,
    PRIORITY_BACKGROUND,
};

fn channel(mock: &MockTransport) -> DeviceChannel<MockTransport> {
    DeviceChannel::new(
        mock.clone(),
        &DeviceConfig::new("10.0.0.14", "sec"),
        ChannelConfig::default(),
    )
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn three_timeouts_then_error() {
    let mock = MockTransport::new().with_fallback(MockReply::Hang);
    let ch = channel(&mock);

    let start = tokio::time::Instant::now();
    let err = ch
        .request(PRIORITY_BACKGROUND, &Query::port(7).param("cmd", "get"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TransportTimeout { attempts: 3 }));
    assert!(err.is_timeout());
    assert_eq!(mock.requests().len(), 3);
    // 3 x 5 s timeout + 2 x 1 s pause
    assert_eq!(start.elapsed(), Duration::from_secs(17));

    let times = mock.request_times();
    assert_eq!(times[1] - times[0], Duration::from_secs(6));
    assert_eq!(times[2] - times[1], Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn recovers_after_a_failed_attempt() {
    let mock = MockTransport::new().with_body("pt=7&cmd=get", "ON");
    mock.push(
        "pt=7&cmd=get",
        MockReply::Fail(TransportError::Connection("reset".into())),
    );
    let ch = channel(&mock);

    let value = ch.get_port(&PortId::Simple(7)).await.unwrap();
    assert_eq!(value, PortValue::OnOff(true));
    assert_eq!(mock.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn connection_failures_keep_their_cause() {
    let mock = MockTransport::new()
        .with_fallback(MockReply::Fail(TransportError::Connection("refused".into())));
    let ch = DeviceChannel::new(
        mock.clone(),
        &DeviceConfig::new("10.0.0.14", "sec"),
        ChannelConfig::default().with_attempts(2).with_retry_delay_ms(10),
    );

    let err = ch.request(PRIORITY_BACKGROUND, &Query::port(1)).await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Connection(_))));
    assert!(err.is_unreachable());
    assert_eq!(mock.requests().len(), 2);
}

// ============================================================================
// Replies
// ============================================================================

#[tokio::test]
async fn non_200_is_absent_not_error() {
    let mock = MockTransport::new().with_reply(
        "pt=3",
        MockReply::Reply(HttpReply::with_status(404, "not found")),
    );
    let ch = channel(&mock);

    assert_eq!(ch.port_page(3).await.unwrap(), None);
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn busy_reply_is_not_data() {
    let mock = MockTransport::new().with_body("pt=30&cmd=get", "busy");
    let ch = channel(&mock);

    assert_eq!(ch.get_port(&PortId::Simple(30)).await.unwrap(), PortValue::Busy);
}

#[tokio::test]
async fn authentication_outcomes() {
    let ok = MockTransport::new().with_fallback(MockReply::body("<html>MegaD-2561</html>"));
    assert!(channel(&ok).authenticate().await.unwrap());
    assert_eq!(ok.urls(), vec!["http://10.0.0.14/sec"]);

    let denied = MockTransport::new().with_fallback(MockReply::Reply(HttpReply::with_status(
        401,
        "Unauthorized",
    )));
    assert!(!channel(&denied).authenticate().await.unwrap());

    let broken =
        MockTransport::new().with_fallback(MockReply::Reply(HttpReply::with_status(500, "")));
    assert!(matches!(
        channel(&broken).authenticate().await,
        Err(Error::CannotConnect { status: 500 })
    ));
}
