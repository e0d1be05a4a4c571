//! Outbound request admission.
//!
//! Every call to a source registry (catalog listing, tag listing, manifest
//! retrieval) holds a slot from a shared pool for its whole duration, so the
//! number of simultaneous requests never exceeds the configured query limit no
//! matter how many images are being processed.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::retry::{RetryError, RetryPolicy, retry};

pub struct RateLimitedFetcher {
    client: reqwest::Client,
    slots: Arc<Semaphore>,
    limit: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RateLimitedFetcher {
    pub fn new(client: reqwest::Client, limit: usize, retry: RetryPolicy) -> Self {
        let limit = limit.max(1);
        Self {
            client,
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops retrying once `cancel` fires. A request already on the wire is
    /// left to finish.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Number of requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    /// Runs `call` once while holding a slot. The slot is returned when the
    /// call finishes, fails, or is dropped.
    pub async fn limited<T, F>(&self, call: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| FetchError::SlotsClosed)?;
        call.await
    }

    /// Like [`limited`](Self::limited) but retried with the low-level request
    /// policy. The slot is released between attempts.
    pub async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        match retry(self.retry, &self.cancel, move || self.limited(call())).await {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted(err)) | Err(RetryError::Cancelled(Some(err))) => Err(err),
            Err(RetryError::Cancelled(None)) => Err(FetchError::Cancelled),
        }
    }

    /// GETs `url` and decodes the JSON body, with slots and retries.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let client = &self.client;

        self.with_retry(move || async move {
            let response = client
                .get(url)
                .send()
                .await
                .map_err(|source| FetchError::Http {
                    url: url.to_string(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status,
                });
            }

            let body = response.bytes().await.map_err(|source| FetchError::Http {
                url: url.to_string(),
                source,
            })?;

            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        })
        .await
    }

    /// Stops admitting new calls; waiting and future callers get
    /// [`FetchError::SlotsClosed`].
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::{Value, json};
    use test_log::test;
    use tokio::task::JoinSet;
    use wiremock::matchers::*;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const FAST: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(1));

    #[test(tokio::test)]
    async fn get_json_retries_transient_failures() {
        let server = MockServer::start().await;

        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_2 = call_count.clone();
        Mock::given(method("GET"))
            .and(path("/v2/ns/tags/list"))
            .respond_with(move |_: &wiremock::Request| {
                if call_count_2.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(200).set_body_json(json!({"child": ["pause"]}))
                }
            })
            .expect(2)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(reqwest::Client::new(), 2, FAST);
        let value: Value = fetcher
            .get_json(&format!("{}/v2/ns/tags/list", server.uri()))
            .await
            .unwrap();

        assert_eq!(value, json!({"child": ["pause"]}));
        assert_eq!(fetcher.in_flight(), 0);
    }

    #[test(tokio::test)]
    async fn get_json_surfaces_last_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = RateLimitedFetcher::new(reqwest::Client::new(), 2, FAST);
        let result: Result<Value, _> = fetcher
            .get_json(&format!("{}/v2/ns/tags/list", server.uri()))
            .await;

        assert!(matches!(
            result,
            Err(FetchError::Status { status, .. }) if status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert_eq!(fetcher.in_flight(), 0);
    }

    #[test(tokio::test)]
    async fn in_flight_never_exceeds_limit() {
        let fetcher = Arc::new(RateLimitedFetcher::new(reqwest::Client::new(), 3, FAST));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..20 {
            let fetcher = fetcher.clone();
            let current = current.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                fetcher
                    .limited(async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            });
        }

        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(fetcher.in_flight(), 0);
    }

    #[test(tokio::test)]
    async fn slot_is_released_on_failure() {
        let fetcher = RateLimitedFetcher::new(reqwest::Client::new(), 1, FAST);

        let result: Result<(), _> = fetcher
            .limited(async { Err(FetchError::Other("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(fetcher.in_flight(), 0);

        fetcher.limited(async { Ok(()) }).await.unwrap();
    }

    #[test(tokio::test)]
    async fn cancelled_fetcher_stops_retrying() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let fetcher = RateLimitedFetcher::new(
            reqwest::Client::new(),
            2,
            RetryPolicy::new(5, Duration::from_secs(60)),
        )
        .with_cancel(cancel.clone());

        let url = format!("{}/v2/ns/tags/list", server.uri());
        let (result, ()) = tokio::join!(fetcher.get_json::<Value>(&url), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        assert!(matches!(result, Err(FetchError::Status { .. })));

        let result = fetcher.get_json::<Value>(&url).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }

    #[test(tokio::test)]
    async fn closed_fetcher_rejects_calls() {
        let fetcher = RateLimitedFetcher::new(reqwest::Client::new(), 1, FAST);
        fetcher.close();

        let result = fetcher.limited(async { Ok(()) }).await;
        assert!(matches!(result, Err(FetchError::SlotsClosed)));
    }
}
