mod common;

use std::time::Duration;

use accordclient::http::request::Route;
use accordclient::http::request::RestRequest;
use accordclient::task::TaskOutcome;
use accordclient::{Client, ClientConfig, ClientError};
use chrono::Utc;
use tokio::time::timeout;

use common::{MockServer, ScriptedResponse};

const WAIT: Duration = Duration::from_secs(10);

fn test_config(mock: &MockServer) -> ClientConfig {
    ClientConfig::new("Bot test-token").with_api_url(mock.http_url.clone())
}

#[tokio::test]
async fn test_submit_round_trip() {
    let mock = MockServer::spawn().await;
    let client = Client::new(test_config(&mock));

    let future = client.submit(RestRequest::new(Route::get_channel("77")));
    let outcome = timeout(WAIT, future).await.unwrap().unwrap();
    match &*outcome {
        TaskOutcome::Success(response) => {
            assert_eq!(response.status, 200);
            assert!(response.body.contains("data"));
        }
        TaskOutcome::Failure(e) => panic!("request failed: {e}"),
    }
    assert_eq!(mock.rest_hits(), 1);
}

#[tokio::test]
async fn test_bucket_rate_limit_retries_after_reset() {
    let mock = MockServer::spawn().await;
    let reset = Utc::now().timestamp() + 1;
    mock.script_rest(vec![
        ScriptedResponse::ok()
            .with_status(429)
            .with_header("X-RateLimit-Scope", "bucket")
            .with_header("Retry-After", "1")
            .with_header("X-RateLimit-Limit", "5")
            .with_header("X-RateLimit-Remaining", "0")
            .with_header("X-RateLimit-Reset", reset.to_string()),
    ])
    .await;
    let client = Client::new(test_config(&mock));

    // rate limiting is invisible to the caller: the future just resolves
    // once the bucket admits the retry
    let future = client.submit(RestRequest::new(Route::get_channel("5")));
    let outcome = timeout(WAIT, future).await.unwrap().unwrap();
    assert!(outcome.is_success());
    assert_eq!(mock.rest_hits(), 2);
}

#[tokio::test]
async fn test_global_rate_limit_defers_queued_requests() {
    let mock = MockServer::spawn().await;
    mock.script_rest(vec![ScriptedResponse::ok()
        .with_status(429)
        .with_header("X-RateLimit-Scope", "global")
        .with_header("Retry-After", "1")])
        .await;
    let client = Client::new(test_config(&mock));

    let first = client.submit(RestRequest::new(Route::get_channel("1")));
    let second = client.submit(RestRequest::new(Route::get_channel("2")));
    let third = client.submit(RestRequest::new(Route::get_channel("3")));

    // while the window is active nothing else goes out
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(mock.rest_hits(), 1);
    let stats = client.rest().stats();
    assert!(stats.global_active);
    assert!(stats.parked >= 1);

    for future in [first, second, third] {
        let outcome = timeout(WAIT, future).await.unwrap().unwrap();
        assert!(outcome.is_success());
    }
    assert_eq!(mock.rest_hits(), 4);
}

#[tokio::test]
async fn test_retry_ceiling_fails_the_future() {
    let mock = MockServer::spawn().await;
    mock.script_rest(
        (0..5)
            .map(|_| {
                ScriptedResponse::ok()
                    .with_status(429)
                    .with_header("X-RateLimit-Scope", "bucket")
                    .with_header("Retry-After", "0")
            })
            .collect(),
    )
    .await;
    let mut config = test_config(&mock);
    config.max_retries = 1;
    let client = Client::new(config);

    let future = client.submit(RestRequest::new(Route::get_channel("9")));
    let outcome = timeout(WAIT, future).await.unwrap().unwrap();
    assert!(matches!(
        &*outcome,
        TaskOutcome::Failure(ClientError::RateLimited { global: false, .. })
    ));
    assert_eq!(mock.rest_hits(), 2);
}

#[tokio::test]
async fn test_request_failure_is_isolated() {
    let mock = MockServer::spawn().await;
    mock.script_rest(vec![ScriptedResponse::ok().with_status(404)]).await;
    let client = Client::new(test_config(&mock));

    let failing = client.submit(RestRequest::new(Route::get_channel("404")));
    let outcome = timeout(WAIT, failing).await.unwrap().unwrap();
    assert!(matches!(
        &*outcome,
        TaskOutcome::Failure(ClientError::Server { status: 404, .. })
    ));

    // the scheduler keeps serving other requests
    let ok = client.submit(RestRequest::new(Route::get_channel("1")));
    assert!(timeout(WAIT, ok).await.unwrap().unwrap().is_success());
}

#[tokio::test]
async fn test_canceled_submission_is_withdrawn() {
    let mock = MockServer::spawn().await;
    // exhaust the bucket so the second request has to wait, giving the
    // cancellation time to land before execution
    let reset = Utc::now().timestamp() + 2;
    mock.script_rest(vec![ScriptedResponse::ok()
        .with_header("X-RateLimit-Limit", "1")
        .with_header("X-RateLimit-Remaining", "0")
        .with_header("X-RateLimit-Reset", reset.to_string())])
        .await;
    let client = Client::new(test_config(&mock));

    let first = client.submit(RestRequest::new(Route::get_channel("1")));
    assert!(timeout(WAIT, first).await.unwrap().unwrap().is_success());

    let parked = client.submit(RestRequest::new(Route::get_channel("1")));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(parked.cancel());
    assert!(matches!(
        timeout(WAIT, parked).await.unwrap(),
        Err(ClientError::Canceled)
    ));

    tokio::time::sleep(Duration::from_secs(2)).await;
    // only the first request ever reached the server
    assert_eq!(mock.rest_hits(), 1);
}
