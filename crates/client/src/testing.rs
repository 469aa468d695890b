//! Scripted transport shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use klb_upload_transfer::BoxFuture;

use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Records every request and answers from a FIFO script, or from a routing
/// handler when one is installed.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    requests: Mutex<Vec<HttpRequest>>,
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    handler: Mutex<Option<Handler>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, response: HttpResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    pub(crate) fn respond_json(&self, status: u16, body: serde_json::Value) {
        self.respond(HttpResponse::new(status, serde_json::to_vec(&body).unwrap()));
    }

    pub(crate) fn fail(&self, err: TransportError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub(crate) fn route(
        &self,
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_matching(&self, pred: impl Fn(&HttpRequest) -> bool) -> Vec<HttpRequest> {
        self.requests().into_iter().filter(|r| pred(r)).collect()
    }
}

impl Transport for ScriptedTransport {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            tokio::task::yield_now().await;
            self.requests.lock().unwrap().push(request.clone());
            if let Some(handler) = self.handler.lock().unwrap().as_ref() {
                return handler(&request);
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Io(format!("no scripted response for {}", request.url))))
        })
    }
}
