use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use loadable_proxy::adapters::http::serde_extractor::SerdeExtractor;
use loadable_proxy::adapters::http::{BytesExtractor, FetchError, HttpAdapter, ResourceExtractor};
use loadable_proxy::{LoadError, LoadLifecycle, LoadStatus};

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq)]
struct MockAvatar {
    id: u32,
    name: String,
}

fn mock_avatar() -> MockAvatar {
    MockAvatar {
        id: 49842,
        name: "turntable".to_string(),
    }
}

type AvatarAdapter = HttpAdapter<MockAvatar, SerdeExtractor<MockAvatar>>;
type BytesAdapter = HttpAdapter<Vec<u8>, BytesExtractor>;

fn init_adapter<R, X>(url: &str, extractor: X) -> Arc<HttpAdapter<R, X>>
where
    R: Send + Sync + 'static,
    X: ResourceExtractor<R>,
{
    let client = reqwest::Client::default();
    Arc::new(HttpAdapter::new(client, Url::parse(url).unwrap(), extractor))
}

fn avatar_adapter(url: &str) -> Arc<AvatarAdapter> {
    init_adapter(url, SerdeExtractor::default())
}

fn bytes_adapter(url: &str) -> Arc<BytesAdapter> {
    init_adapter(url, BytesExtractor)
}

fn fetch_error(error: &LoadError) -> &FetchError {
    error
        .adapter_error()
        .and_then(|inner| inner.downcast_ref::<FetchError>())
        .expect("fetch error")
}

#[tokio::test]
async fn test_load_stores_resource() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/avatar")
        .with_header("Content-Type", "application/json; charset=utf-8")
        .with_body(serde_json::to_string(&mock_avatar()).unwrap())
        .expect(1)
        .create_async()
        .await;

    let adapter = avatar_adapter(&(server.url() + "/avatar"));
    let lifecycle = LoadLifecycle::with_adapter("avatar", &adapter);

    // Concurrent loads share a single request
    let loads: Vec<_> = (0..10).map(|_| lifecycle.load()).collect();
    for load in loads {
        load.await.unwrap();
    }
    lifecycle.load().await.unwrap();

    assert_eq!(lifecycle.status(), LoadStatus::Loaded);
    assert_eq!(adapter.resource().as_deref(), Some(&mock_avatar()));
    assert!(!adapter.is_fetching());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_error_status_fails_load() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/missing")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let adapter = bytes_adapter(&(server.url() + "/missing"));
    let lifecycle = LoadLifecycle::with_adapter("missing", &adapter);

    let error = lifecycle.load().await.unwrap_err();
    assert!(matches!(fetch_error(&error), FetchError::Status(status) if status.as_u16() == 404));
    assert_eq!(lifecycle.status(), LoadStatus::FailedToLoad);
    assert!(adapter.resource().is_none());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_retry_fetches_again_and_clears_resource() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("GET", "/avatar")
        .with_header("Content-Type", "text/plain")
        .with_body("hello")
        .expect(1)
        .create_async()
        .await;

    let adapter = bytes_adapter(&(server.url() + "/avatar"));
    let lifecycle = LoadLifecycle::with_adapter("avatar", &adapter);

    lifecycle.load().await.unwrap();
    assert_eq!(adapter.resource().as_deref(), Some(&b"hello".to_vec()));
    first.assert_async().await;
    first.remove_async().await;

    let second = server
        .mock("GET", "/avatar")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let error = lifecycle.retry_load().await.unwrap_err();
    assert!(matches!(fetch_error(&error), FetchError::Status(status) if status.as_u16() == 500));
    assert_eq!(lifecycle.status(), LoadStatus::FailedToLoad);
    // The resource of the earlier fetch does not survive a retry
    assert!(adapter.resource().is_none());
    second.assert_async().await;
}

#[tokio::test]
async fn test_retry_supersedes_fetch_in_flight() {
    let mut server = mockito::Server::new_async().await;
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    let mock = server
        .mock("GET", "/avatar")
        .with_chunked_body(move |w| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(500));
                w.write_all(b"first")
            } else {
                w.write_all(b"second")
            }
        })
        .expect(2)
        .create_async()
        .await;

    let adapter = bytes_adapter(&(server.url() + "/avatar"));
    let lifecycle = LoadLifecycle::with_adapter("avatar", &adapter);

    let first = lifecycle.load();
    while requests.load(Ordering::SeqCst) == 0 {
        sleep(Duration::from_millis(10)).await;
    }
    assert!(adapter.is_fetching());

    let retry = lifecycle.retry_load();
    first.await.unwrap();
    retry.await.unwrap();
    assert_eq!(adapter.resource().as_deref(), Some(&b"second".to_vec()));

    // Give the slow response time to arrive, it must not replace the resource
    sleep(Duration::from_millis(700)).await;
    assert_eq!(adapter.resource().as_deref(), Some(&b"second".to_vec()));
    assert_eq!(lifecycle.status(), LoadStatus::Loaded);
    assert!(!adapter.is_fetching());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_empty_body_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server.mock("GET", "/empty").with_body("").create_async().await;

    let adapter = bytes_adapter(&(server.url() + "/empty"));
    let lifecycle = LoadLifecycle::with_adapter("empty", &adapter);

    let error = lifecycle.load().await.unwrap_err();
    assert!(matches!(fetch_error(&error), FetchError::EmptyBody));
    assert!(adapter.resource().is_none());
}

#[tokio::test]
async fn test_unsupported_content_type() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/avatar.png")
        .with_header("Content-Type", "image/png")
        .with_body("not json")
        .create_async()
        .await;

    let adapter = avatar_adapter(&(server.url() + "/avatar.png"));
    let lifecycle = LoadLifecycle::with_adapter("avatar", &adapter);

    let error = lifecycle.load().await.unwrap_err();
    assert!(matches!(
        fetch_error(&error),
        FetchError::UnsupportedContentType(content_type, None) if content_type == "image/png"
    ));
}

#[tokio::test]
async fn test_cancel_resolves_with_fetch_cancelled() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/avatar")
        .with_body("hello")
        .expect(0)
        .create_async()
        .await;

    let adapter = bytes_adapter(&(server.url() + "/avatar"));
    let lifecycle = LoadLifecycle::with_adapter("avatar", &adapter);

    // Both commands are queued before the driver or the fetch get to run
    let load = lifecycle.load();
    lifecycle.cancel_load();

    let error = load.await.unwrap_err();
    assert!(matches!(fetch_error(&error), FetchError::Cancelled));
    assert_eq!(lifecycle.status(), LoadStatus::FailedToLoad);
    assert!(!adapter.is_fetching());
    mock.assert_async().await;
}
