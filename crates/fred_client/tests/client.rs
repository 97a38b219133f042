use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_dispatch::Error;
use api_dispatch::error::DispatchError;
use api_dispatch::http::HttpError;
use fred_client::{ApiClient, ApiResponse, Event, FredConfig, FredError, params};
use http::StatusCode;
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> FredConfig {
    FredConfig {
        base_url: format!("{}/fred", server.uri()),
        retry_backoff_ms: 10,
        ..FredConfig::with_api_key("abc")
    }
}

#[tokio::test]
async fn get_sends_key_and_default_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fred/series/observations"))
        .and(query_param("api_key", "abc"))
        .and(query_param("file_type", "json"))
        .and(query_param("series_id", "GDP"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config(&server)).unwrap();
    let value = client
        .endpoint("series/observations")
        .unwrap()
        .get_json(params([("series_id", "GDP")]))
        .await
        .unwrap();

    assert_eq!(value["count"], 1);
    assert_eq!(client.limiter().remaining(), 119);
}

#[tokio::test]
async fn get_all_fetches_every_page_in_offset_order() {
    let server = MockServer::start().await;
    let page = |offset: u64| json!({"count": 5, "limit": 2, "offset": offset});

    Mock::given(path("/fred/series/observations"))
        .and(query_param_is_missing("offset"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(0)))
        .expect(1)
        .mount(&server)
        .await;
    for offset in [2, 4] {
        Mock::given(path("/fred/series/observations"))
            .and(query_param("offset", offset.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(offset)))
            .expect(1)
            .mount(&server)
            .await;
    }

    let client = ApiClient::new(config(&server)).unwrap();
    let pages = client
        .endpoint("series/observations")
        .unwrap()
        .get_all(params([("series_id", "EFFR")]))
        .await
        .unwrap();

    let offsets: Vec<u64> = pages.iter().filter_map(|p| p["offset"].as_u64()).collect();
    assert_eq!(offsets, [0, 2, 4]);
    assert_eq!(client.limiter().remaining(), 117);
}

#[tokio::test]
async fn too_many_requests_is_surfaced_without_retry() {
    let server = MockServer::start().await;
    Mock::given(path("/fred/series"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config(&server)).unwrap();
    let error = client
        .endpoint("series")
        .unwrap()
        .get(params([("series_id", "GDP")]))
        .await
        .unwrap_err();

    assert!(error.is_rate_limited());
    assert_eq!(error.status(), Some(StatusCode::TOO_MANY_REQUESTS));
}

#[tokio::test]
async fn error_status_carries_the_upstream_body() {
    let server = MockServer::start().await;
    Mock::given(path("/fred/series"))
        .respond_with(ResponseTemplate::new(400).set_body_json(
            json!({"error_message": "Bad Request. Variable series_id is not set."}),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config(&server)).unwrap();
    let error = client
        .endpoint("series")
        .unwrap()
        .get(Vec::new())
        .await
        .unwrap_err();

    match error {
        FredError::Request {
            source: DispatchError::Upstream { response },
            ..
        } => {
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert!(response.text().contains("series_id is not set"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn connection_failure_is_retried_once() {
    // Nothing listens on a port once its listener is gone.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}/fred", listener.local_addr().unwrap());
    drop(listener);

    let client = ApiClient::new(FredConfig {
        base_url,
        retry_backoff_ms: 10,
        ..FredConfig::with_api_key("abc")
    })
    .unwrap();
    let error = client
        .endpoint("series")
        .unwrap()
        .get(Vec::new())
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        FredError::Request {
            source: DispatchError::Transport { .. },
            ..
        }
    ));
    assert_eq!(client.limiter().remaining(), 118);
}

#[tokio::test]
async fn handle_timeout_bounds_each_attempt() {
    let server = MockServer::start().await;
    Mock::given(path("/fred/series"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = ApiClient::new(config(&server)).unwrap();
    let error = client
        .endpoint("series")
        .unwrap()
        .with_timeout(Duration::from_millis(100))
        .get(Vec::new())
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        FredError::Request {
            source: DispatchError::Transport {
                source: HttpError::Timeout
            },
            ..
        }
    ));
    assert_eq!(client.limiter().remaining(), 118);
}

#[tokio::test]
async fn spawned_get_completes_in_the_background() {
    let server = MockServer::start().await;
    Mock::given(path("/fred/series"))
        .and(query_param("series_id", "GDP"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config(&server)).unwrap();
    let pending = client
        .endpoint("series")
        .unwrap()
        .spawn_get(params([("series_id", "GDP")]))
        .unwrap();

    let response = pending.await.unwrap();
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body, json!({"count": 1}));
}

#[tokio::test]
async fn unknown_paths_resolve_under_the_base() {
    let server = MockServer::start().await;
    Mock::given(path("/fred/brand/new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config(&server)).unwrap();
    let endpoint = client.endpoint("brand").unwrap().child("new").unwrap();
    assert_eq!(endpoint.topic(), "new");
    endpoint.get(Vec::new()).await.unwrap();
}

#[tokio::test]
async fn responses_are_published_to_matching_handlers() {
    let server = MockServer::start().await;
    Mock::given(path("/fred/series/observations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 0})))
        .mount(&server)
        .await;

    let client = ApiClient::new(FredConfig {
        enable_events: true,
        ..config(&server)
    })
    .unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let unrelated = Arc::new(AtomicUsize::new(0));
    {
        let observed = Arc::clone(&observed);
        client
            .subscribe("observations", move |event: Arc<Event<ApiResponse>>| {
                let observed = Arc::clone(&observed);
                async move {
                    let body: serde_json::Value = event.payload().json()?;
                    observed.lock().unwrap().push(body);
                    Ok::<_, Error>(())
                }
            })
            .unwrap();
    }
    {
        let unrelated = Arc::clone(&unrelated);
        client
            .subscribe_fn("series", move |_: &Event<ApiResponse>| {
                unrelated.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            })
            .unwrap();
    }

    client
        .endpoint("series/observations")
        .unwrap()
        .get(params([("series_id", "GDP")]))
        .await
        .unwrap();
    client.close().await;

    assert_eq!(*observed.lock().unwrap(), [json!({"count": 0})]);
    assert_eq!(unrelated.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn closed_client_rejects_requests() {
    let server = MockServer::start().await;
    let client = ApiClient::new(config(&server)).unwrap();
    client.close().await;

    let error = client
        .endpoint("series")
        .unwrap()
        .get(Vec::new())
        .await
        .unwrap_err();
    assert!(error.is_closed());
    assert!(client.is_closed());
}
