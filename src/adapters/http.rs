use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::FutureExt;
use parking_lot::Mutex;
use reqwest::header::HeaderName;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use thiserror::Error as ThisError;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::adapters::adapter::{LoadFuture, LoadableAdapter};
use crate::error::{AdapterError, BoxError};
use crate::trace::{debug, trace};

/// Turns a successful HTTP response into a resource.
pub trait ResourceExtractor<R>: Send + Sync + 'static {
    fn extract(&self, response: Response) -> impl Future<Output = Result<R, FetchError>> + Send;
}

#[derive(Debug, ThisError)]
pub enum FetchError {
    #[error("fetch was cancelled")]
    Cancelled,

    #[error("server responded with {0}")]
    Status(StatusCode),

    #[error("response body is empty")]
    EmptyBody,

    #[error("header '{0}' is not present in response, but is required to extract the resource")]
    HeaderNotFound(HeaderName),

    #[error("{}", unsupported_content_type(.0, .1))]
    UnsupportedContentType(String, Option<&'static str>), // Optional feature name can be provided

    #[error("failed to parse response body with Content-Type: {0}")]
    ContentParse(String, #[source] BoxError),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

fn unsupported_content_type(content_type: &str, feature: &Option<&'static str>) -> String {
    match feature {
        Some(feature) => format!(
            "content type '{content_type}' is supported only with feature '{feature}', which is disabled"
        ),
        None => format!("unsupported content type: {content_type}"),
    }
}

/// Extractor returning the raw response body.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesExtractor;

impl ResourceExtractor<Vec<u8>> for BytesExtractor {
    async fn extract(&self, response: Response) -> Result<Vec<u8>, FetchError> {
        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(FetchError::EmptyBody);
        }
        Ok(body.to_vec())
    }
}

struct InFlightFetch {
    id: u64,
    abort: AbortHandle,
}

/// Adapter fetching its resource with a GET request to a fixed url.
///
/// Every attempt gets a fresh fetch id. A finished fetch only counts if its id is still the
/// current one, so a fetch that was cancelled or replaced by a retry can never resolve an
/// attempt or overwrite the stored resource.
///
/// Cancelling aborts the fetch and returns `false`: the attempt then fails with
/// [`FetchError::Cancelled`] instead of the lifecycle's generic cancellation error.
pub struct HttpAdapter<R, X> {
    client: Client,
    url: Url,
    extractor: Arc<X>,
    resource: Arc<ArcSwapOption<R>>,
    fetch: Arc<Mutex<Option<InFlightFetch>>>,
    next_fetch_id: AtomicU64,
}

impl<R, X> HttpAdapter<R, X>
where
    R: Send + Sync + 'static,
    X: ResourceExtractor<R>,
{
    pub fn new(client: Client, url: Url, extractor: X) -> Self {
        HttpAdapter {
            client,
            url,
            extractor: Arc::new(extractor),
            resource: Arc::new(ArcSwapOption::empty()),
            fetch: Arc::new(Mutex::new(None)),
            next_fetch_id: AtomicU64::new(0),
        }
    }

    /// Last successfully fetched resource.
    pub fn resource(&self) -> Option<Arc<R>> {
        self.resource.load_full()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch.lock().is_some()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn discard_fetch(&self) {
        if let Some(previous) = self.fetch.lock().take() {
            trace!(url = %self.url, fetch = previous.id, "aborting fetch");
            previous.abort.abort();
        }
    }
}

async fn fetch_resource<R, X>(request: RequestBuilder, extractor: &X) -> Result<R, FetchError>
where
    X: ResourceExtractor<R>,
{
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }
    extractor.extract(response).await
}

impl<R, X> LoadableAdapter for HttpAdapter<R, X>
where
    R: Send + Sync + 'static,
    X: ResourceExtractor<R>,
{
    /// # Panics
    /// Spawns the fetch, so it must be called from within a Tokio runtime.
    fn start_loading(&self, retrying: bool) -> LoadFuture {
        if retrying {
            self.discard_fetch();
            self.resource.store(None);
        }

        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = oneshot::channel();
        let request = self.client.get(self.url.clone());
        let extractor = self.extractor.clone();
        let resource = self.resource.clone();
        let slot = self.fetch.clone();
        debug!(url = %self.url, fetch = id, retrying, "starting fetch");

        // Slot stays locked until the new fetch is registered, so the task can't see a stale id
        let mut fetch = self.fetch.lock();
        let task = tokio::spawn(async move {
            let result = fetch_resource(request, extractor.as_ref()).await;

            let mut current = slot.lock();
            if current.as_ref().map(|fetch| fetch.id) != Some(id) {
                trace!(fetch = id, "dropping result of superseded fetch");
                return;
            }
            *current = None;
            trace!(fetch = id, succeeded = result.is_ok(), "fetch finished");
            let outcome = match result {
                Ok(fetched) => {
                    resource.store(Some(Arc::new(fetched)));
                    Ok(())
                }
                Err(error) => Err(error),
            };
            drop(current);
            let _ = sender.send(outcome);
        });
        if let Some(previous) = fetch.replace(InFlightFetch {
            id,
            abort: task.abort_handle(),
        }) {
            previous.abort.abort();
        }
        drop(fetch);

        async move {
            match receiver.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(AdapterError::new(error)),
                // Fetch was aborted before it could report
                Err(_) => Err(AdapterError::new(FetchError::Cancelled)),
            }
        }
        .boxed()
    }

    fn cancel_loading(&self) -> bool {
        self.discard_fetch();
        false
    }
}

#[cfg(feature = "serde")]
pub mod serde_extractor {
    use std::marker::PhantomData;

    use reqwest::header::CONTENT_TYPE;
    use reqwest::Response;
    use serde::de::DeserializeOwned;

    use crate::adapters::http::{FetchError, ResourceExtractor};
    use crate::error::BoxError;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Format {
        Json,
        Toml,
        Yaml,
        Xml,
    }

    impl Format {
        fn from_media_type(media_type: &str) -> Option<Format> {
            match media_type {
                "application/json" => Some(Format::Json),
                // NOTE: no MIME type for TOML is registered officially
                "application/toml" => Some(Format::Toml),
                "application/yaml" | "application/x-yaml" => Some(Format::Yaml),
                "application/xml" | "text/xml" => Some(Format::Xml),
                _ => None,
            }
        }

        fn feature(self) -> &'static str {
            match self {
                Format::Json => "json",
                Format::Toml => "toml",
                Format::Yaml => "yaml",
                Format::Xml => "xml",
            }
        }

        fn enabled(self) -> bool {
            match self {
                Format::Json => cfg!(feature = "json"),
                Format::Toml => cfg!(feature = "toml"),
                Format::Yaml => cfg!(feature = "yaml"),
                Format::Xml => cfg!(feature = "xml"),
            }
        }

        fn parse<T: DeserializeOwned>(self, body: &[u8]) -> Result<T, BoxError> {
            match self {
                #[cfg(feature = "json")]
                Format::Json => Ok(serde_json::from_slice(body)?),
                #[cfg(feature = "toml")]
                Format::Toml => Ok(toml::from_str(std::str::from_utf8(body)?)?),
                #[cfg(feature = "yaml")]
                Format::Yaml => Ok(serde_yaml::from_slice(body)?),
                #[cfg(feature = "xml")]
                Format::Xml => Ok(serde_xml_rs::from_reader(body)?),
                #[allow(unreachable_patterns)]
                other => Err(format!("{} support is disabled", other.feature()).into()),
            }
        }
    }

    /// `Content-Type` without parameters such as `charset`.
    fn media_type(content_type: &str) -> String {
        content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    /// Extractor deserializing the body according to the response's `Content-Type`.
    pub struct SerdeExtractor<T> {
        _marker: PhantomData<fn() -> T>,
    }

    impl<T> Default for SerdeExtractor<T> {
        fn default() -> Self {
            SerdeExtractor {
                _marker: PhantomData,
            }
        }
    }

    impl<T> ResourceExtractor<T> for SerdeExtractor<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        async fn extract(&self, response: Response) -> Result<T, FetchError> {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .ok_or(FetchError::HeaderNotFound(CONTENT_TYPE))?
                .to_str()
                .map(media_type)
                .map_err(|_| FetchError::UnsupportedContentType("<NON_ASCII_DATA>".to_string(), None))?;

            let format = match Format::from_media_type(&content_type) {
                Some(format) if format.enabled() => format,
                Some(format) => {
                    return Err(FetchError::UnsupportedContentType(content_type, Some(format.feature())))
                }
                None => return Err(FetchError::UnsupportedContentType(content_type, None)),
            };

            let body = response.bytes().await?;
            format
                .parse(&body)
                .map_err(|e| FetchError::ContentParse(content_type, e))
        }
    }

}
