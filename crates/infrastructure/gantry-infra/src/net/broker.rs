use std::time::Duration;

use reqwest::{Client, Url};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::CancelScope;

/// Immutable set of endpoints a broker races for every resource: one
/// authoritative primary and zero or more best-effort mirrors in priority
/// order, with a per-mirror stagger delay.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    primary: Url,
    mirrors: Vec<Url>,
    stagger: Duration,
}

impl EndpointSet {
    pub fn new(primary: Url, mirrors: Vec<Url>, stagger: Duration) -> Self {
        Self {
            primary: ensure_dir_base(primary),
            mirrors: mirrors.into_iter().map(ensure_dir_base).collect(),
            stagger,
        }
    }

    pub fn primary(&self) -> &Url {
        &self.primary
    }

    pub fn mirrors(&self) -> &[Url] {
        &self.mirrors
    }

    pub fn stagger(&self) -> Duration {
        self.stagger
    }
}

/// Treat a base URL as a *directory base* even when supplied without a
/// trailing slash; otherwise `Url::join` would replace the final path
/// segment instead of appending the resource path.
fn ensure_dir_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server rejected request with status {0}")]
    ServerRejection(u16),
    #[error("unexpected response status {0}")]
    UnexpectedResponse(u16),
    #[error("no endpoint produced a usable response")]
    NoSources,
    #[error("invalid resource url: {0}")]
    BadUrl(String),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Primary,
    Mirror(usize),
}

struct CallOutcome {
    source: Source,
    result: Result<(u16, String), String>,
}

/// Primary statuses that end the race unconditionally: success, or a
/// permanent client-side rejection that no mirror may override.
fn primary_is_definitive(status: u16) -> bool {
    matches!(status, 200 | 400 | 401 | 404)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accepted {
    Primary(u16),
    Mirror,
}

/// Running acceptance state for one `fetch` race.
#[derive(Default)]
struct RaceState {
    primary_result: Option<Result<(u16, String), String>>,
    /// Body of the first mirror 200 to arrive, in arrival order.
    mirror_hit: Option<String>,
}

impl RaceState {
    fn record(&mut self, outcome: CallOutcome) {
        match outcome.source {
            Source::Primary => {
                self.primary_result = Some(outcome.result);
            }
            Source::Mirror(idx) => match outcome.result {
                Ok((200, body)) => {
                    if self.mirror_hit.is_none() {
                        self.mirror_hit = Some(body);
                    }
                }
                // Mirrors are a best-effort cache tier: anything but a 200
                // is silently ignored, transport errors included.
                Ok((status, _)) => debug!("mirror {idx} returned status {status}; ignored"),
                Err(e) => debug!("mirror {idx} transport error swallowed: {e}"),
            },
        }
    }

    /// Deterministic tie-break: a definitive primary response beats any
    /// mirror outcome regardless of arrival order; among mirrors only the
    /// first 200 counts.
    fn accepted(&self) -> Option<Accepted> {
        if let Some(Ok((status, _))) = &self.primary_result {
            if primary_is_definitive(*status) {
                return Some(Accepted::Primary(*status));
            }
        }
        if self.mirror_hit.is_some() {
            return Some(Accepted::Mirror);
        }
        None
    }

    fn resolve(mut self) -> Result<String, BrokerError> {
        match self.accepted() {
            Some(Accepted::Primary(200)) => match self.primary_result.take() {
                Some(Ok((_, body))) => Ok(body),
                _ => Err(BrokerError::NoSources),
            },
            Some(Accepted::Primary(status)) => Err(BrokerError::ServerRejection(status)),
            Some(Accepted::Mirror) => self.mirror_hit.take().ok_or(BrokerError::NoSources),
            None => match self.primary_result.take() {
                Some(Err(transport)) => Err(BrokerError::Transport(transport)),
                Some(Ok((status, _))) => Err(BrokerError::UnexpectedResponse(status)),
                None => Err(BrokerError::NoSources),
            },
        }
    }
}

/// Resolves one logical resource path to one verified response body,
/// tolerating individual endpoint failure or slowness by racing the primary
/// against staggered mirrors.
pub struct RequestBroker {
    client: Client,
    endpoints: EndpointSet,
}

impl RequestBroker {
    pub fn new(client: Client, endpoints: EndpointSet) -> Self {
        Self { client, endpoints }
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    pub async fn fetch(
        &self,
        resource: &str,
        scope: &CancelScope,
    ) -> Result<String, BrokerError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut call_scopes: Vec<CancelScope> = Vec::new();
        let mut pending = 0usize;
        let mut race = RaceState::default();

        let primary_url = self
            .endpoints
            .primary()
            .join(resource)
            .map_err(|e| BrokerError::BadUrl(e.to_string()))?;
        self.start_call(primary_url, Source::Primary, &tx, scope, &mut call_scopes);
        pending += 1;

        // Fan out to mirrors in priority order, giving earlier sources a
        // stagger window to answer first.
        for idx in 0..self.endpoints.mirrors().len() {
            if scope.is_cancelled() {
                return finish(call_scopes, Err(BrokerError::Cancelled));
            }

            if pending > 0 && race.accepted().is_none() {
                match tokio::time::timeout(self.endpoints.stagger(), rx.recv()).await {
                    Ok(Some(outcome)) => {
                        pending -= 1;
                        race.record(outcome);
                        pending -= drain(&mut rx, &mut race);
                    }
                    Ok(None) => {}
                    Err(_elapsed) => {}
                }
            }

            if scope.is_cancelled() {
                return finish(call_scopes, Err(BrokerError::Cancelled));
            }
            if race.accepted().is_some() {
                break;
            }

            let mirror_url = self.endpoints.mirrors()[idx]
                .join(resource)
                .map_err(|e| BrokerError::BadUrl(e.to_string()))?;
            self.start_call(mirror_url, Source::Mirror(idx), &tx, scope, &mut call_scopes);
            pending += 1;
        }

        // All sources considered; wait on completions alone.
        while race.accepted().is_none() && pending > 0 {
            tokio::select! {
                _ = scope.cancelled() => {
                    return finish(call_scopes, Err(BrokerError::Cancelled));
                }
                outcome = rx.recv() => match outcome {
                    Some(outcome) => {
                        pending -= 1;
                        race.record(outcome);
                        pending -= drain(&mut rx, &mut race);
                    }
                    None => break,
                },
            }
        }

        finish(call_scopes, race.resolve())
    }

    fn start_call(
        &self,
        url: Url,
        source: Source,
        tx: &mpsc::UnboundedSender<CallOutcome>,
        scope: &CancelScope,
        call_scopes: &mut Vec<CancelScope>,
    ) {
        let call_scope = scope.child();
        call_scopes.push(call_scope.clone());

        let client = self.client.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = call_scope.cancelled() => return,
                res = execute(client, url) => res,
            };
            let _ = tx.send(CallOutcome { source, result });
        });
    }
}

async fn execute(client: Client, url: Url) -> Result<(u16, String), String> {
    let resp = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = resp.status().as_u16();
    let body = resp.text().await.map_err(|e| e.to_string())?;
    Ok((status, body))
}

fn drain(rx: &mut mpsc::UnboundedReceiver<CallOutcome>, race: &mut RaceState) -> usize {
    let mut drained = 0;
    while let Ok(outcome) = rx.try_recv() {
        race.record(outcome);
        drained += 1;
    }
    drained
}

/// Every exit path cancels calls still pending, to bound resource usage.
fn finish(
    call_scopes: Vec<CancelScope>,
    result: Result<String, BrokerError>,
) -> Result<String, BrokerError> {
    for call_scope in &call_scopes {
        call_scope.cancel();
    }
    result
}
