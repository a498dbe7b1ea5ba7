//! The dispatch loop: one spawned task per request, one iteration per leg.
//!
//! Everything a request emits happens on this task, which is what keeps
//! events in order: `request`, progress, `end`, `response`, then the
//! callback and the promise. Listeners are called without the request lock
//! held so they may freely inspect the request.

use std::panic::{self, AssertUnwindSafe};
use std::sync::PoisonError;

use tokio::sync::mpsc;

use super::events::{self, EventKind, ProgressDirection, ProgressEvent, RequestEvent};
use super::redirect::RedirectDecision;
use super::{Leg, Request, RequestState};
use crate::errors::{ErrorKind, RequestError};
use crate::net::{TransportError, TransportReply, TransportSignal};
use crate::promise::panic_message;
use crate::response::Response;

/// How a request ended.
pub(crate) enum Completion {
    Reply(TransportReply),
    /// A reply arrived but the redirect policy turned it into an error.
    ReplyWithError(TransportReply, RequestError),
    Failed(RequestError),
}

enum LegOutcome {
    Done(Result<TransportReply, TransportError>),
    Aborted,
    TimedOut,
}

pub(crate) async fn run(request: Request) {
    let mut first = true;

    loop {
        let Leg {
            request: leg,
            timeout,
            cancel,
            context,
        } = match request.prepare_leg(first) {
            Ok(leg) => leg,
            Err(err) => {
                log::warn!("Cannot send request: {}", err);
                finish(&request, Completion::Failed(err), RequestState::Completed);
                return;
            }
        };
        first = false;

        log::debug!("{} {}", leg.method, leg.url);
        context.activity.increment();
        events::emit(
            &request.listeners(EventKind::Request),
            &RequestEvent::Request(&request),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut exec = context.transport.execute(leg, tx);

        let sleep = async move {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(sleep);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break LegOutcome::Aborted,
                _ = &mut sleep => break LegOutcome::TimedOut,
                Some(signal) = rx.recv() => forward(&request, signal),
                result = &mut exec => break LegOutcome::Done(result),
            }
        };

        // dropping the transport future cancels whatever is still running
        drop(exec);
        if matches!(outcome, LegOutcome::Done(_)) {
            while let Ok(signal) = rx.try_recv() {
                forward(&request, signal);
            }
        }
        context.activity.decrement();

        let reply = match outcome {
            LegOutcome::Aborted => {
                log::debug!("Request aborted");
                let err = RequestError::new(ErrorKind::Aborted);
                finish(&request, Completion::Failed(err), RequestState::Aborted);
                return;
            }
            LegOutcome::TimedOut => {
                let duration = timeout.unwrap_or_default();
                log::debug!("Request timed out after {:?}", duration);
                let err = RequestError::new(ErrorKind::Timeout(duration));
                finish(&request, Completion::Failed(err), RequestState::Aborted);
                return;
            }
            LegOutcome::Done(Err(err)) => {
                log::debug!("Transport failed: {}", err);
                let err = RequestError::new(ErrorKind::Transport {
                    code: err.code,
                    description: err.description,
                });
                finish(&request, Completion::Failed(err), RequestState::Completed);
                return;
            }
            LegOutcome::Done(Ok(reply)) => reply,
        };

        if let Some(jar) = &context.cookie_jar {
            jar.write()
                .unwrap_or_else(PoisonError::into_inner)
                .store_response_cookies(&reply.url, &reply.headers);
        }

        match request.apply_redirect(&reply) {
            RedirectDecision::Follow { .. } => continue,
            RedirectDecision::Deliver => {
                finish(&request, Completion::Reply(reply), RequestState::Completed);
            }
            RedirectDecision::Fail(kind) => {
                let err = RequestError::new(kind).with_status(reply.status);
                finish(
                    &request,
                    Completion::ReplyWithError(reply, err),
                    RequestState::Completed,
                );
            }
        }
        return;
    }
}

fn forward(request: &Request, signal: TransportSignal) {
    match signal {
        TransportSignal::UploadProgress { loaded, total } => emit_progress(
            request,
            ProgressEvent::new(ProgressDirection::Upload, loaded, total),
        ),
        TransportSignal::DownloadProgress { loaded, total } => emit_progress(
            request,
            ProgressEvent::new(ProgressDirection::Download, loaded, total),
        ),
        TransportSignal::SecureConnect(info) => events::emit(
            &request.listeners(EventKind::SecureConnect),
            &RequestEvent::SecureConnect(&info),
        ),
    }
}

fn emit_progress(request: &Request, progress: ProgressEvent) {
    events::emit(
        &request.listeners(EventKind::Progress),
        &RequestEvent::Progress(progress),
    );
}

/// Completes a request: `end`, `response`, then the callback and the
/// promise. Runs once per request.
pub(crate) fn finish(request: &Request, completion: Completion, terminal: RequestState) {
    events::emit(&request.listeners(EventKind::End), &RequestEvent::End);

    let response_type = {
        let mut inner = request.lock();
        // release file handles held by multipart sources
        inner.multipart = None;
        inner.response_type
    };

    let result = match completion {
        Completion::Reply(reply) => Ok(Response::from_reply(reply, response_type)),
        Completion::ReplyWithError(reply, err) => {
            Err(err.with_response(Response::from_reply(reply, response_type)))
        }
        Completion::Failed(err) => Err(err),
    };

    let response = match &result {
        Ok(response) => Some(response),
        Err(err) => err.response(),
    };
    if let Some(response) = response {
        events::emit(
            &request.listeners(EventKind::Response),
            &RequestEvent::Response(response),
        );
    }

    let (callback, promise) = {
        let mut inner = request.lock();
        inner.state = terminal;
        inner.cancel = None;
        inner.outcome = Some(result.clone());
        (inner.callback.take(), inner.promise.clone())
    };

    if callback.is_none() && promise.is_none() {
        log::warn!("Request finished with neither a callback nor a promise attached");
        return;
    }

    if let Some(callback) = callback {
        let outcome = result.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
            log::error!("Completion callback panicked: {}", panic_message(payload.as_ref()));
        }
    }

    if let Some(promise) = promise {
        promise.resolver().settle(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::oneshot;

    use crate::agent::tests::{scripted_agent, Step};
    use crate::errors::{ErrorKind, RequestError};
    use crate::net::TransportErrorCode;
    use crate::promise::{PromiseState, Reaction};
    use crate::request::{EventKind, Method, RequestEvent, RequestState};
    use crate::response::Response;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&RequestEvent<'_>) + Send + Sync + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let listener = move |event: &RequestEvent<'_>| {
            sink.lock().unwrap().push(event.kind().to_string());
        };
        (log, listener)
    }

    #[tokio::test]
    async fn plain_get_delivers_response() {
        let (agent, transport) = scripted_agent(vec![Step::reply(200, &[("content-type", "application/json")], r#"{"ok":1}"#)]);

        let res = agent.get("http://example.com/items").send_async().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.json(), Some(&json!({ "ok": 1 })));

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, http::Method::GET);
        assert_eq!(agent.activity().count(), 0);
    }

    #[tokio::test]
    async fn follows_redirect_with_events_in_order() {
        let (agent, transport) = scripted_agent(vec![
            Step::reply(301, &[("location", "/final")], ""),
            Step::reply(200, &[], "done"),
        ]);
        let (log, listener) = recorder();

        let req = agent
            .get("http://example.com/start")
            .on(EventKind::Request, listener.clone())
            .on(EventKind::End, listener.clone())
            .on(EventKind::Response, listener);
        let res = req.send_async().await.unwrap();

        assert_eq!(res.status(), 200);
        assert_eq!(res.text(), "done");
        assert_eq!(res.url().as_str(), "http://example.com/final");
        assert_eq!(req.redirect_count(), 1);
        assert_eq!(req.state(), RequestState::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["request", "request", "end", "response"]);
        assert_eq!(transport.requests()[1].url.as_str(), "http://example.com/final");
    }

    #[tokio::test]
    async fn too_many_redirects() {
        let steps = (0..6)
            .map(|i| Step::reply(302, &[("location", format!("/hop{}", i + 1).as_str())], ""))
            .collect();
        let (agent, transport) = scripted_agent(steps);

        let err = agent.get("http://example.com/hop0").send_async().await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::TooManyRedirects(5)));
        assert_eq!(err.status, Some(302));
        assert_eq!(err.response().unwrap().status(), 302);
        assert_eq!(transport.requests().len(), 6);
    }

    #[tokio::test]
    async fn zero_redirects_delivers_3xx() {
        let (agent, _) = scripted_agent(vec![Step::reply(302, &[("location", "/x")], "")]);
        let res = agent.get("http://example.com/").redirects(0).send_async().await.unwrap();
        assert_eq!(res.status(), 302);
    }

    #[tokio::test]
    async fn post_becomes_get_on_303_and_drops_body() {
        let (agent, transport) = scripted_agent(vec![
            Step::reply(303, &[("location", "/result")], ""),
            Step::reply(200, &[], ""),
        ]);

        agent
            .post("http://example.com/form")
            .send("a=1")
            .send("b=2")
            .send_async()
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].method, http::Method::POST);
        assert_eq!(sent[0].body_bytes(), b"a=1&b=2");
        assert_eq!(
            sent[0].headers.get("content-type").unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(sent[1].method, http::Method::GET);
        assert!(sent[1].body.is_empty());
        assert!(sent[1].headers.get("content-type").is_none());
    }

    #[tokio::test]
    async fn put_keeps_body_on_307() {
        let (agent, transport) = scripted_agent(vec![
            Step::reply(307, &[("location", "http://other.example.com/v2")], ""),
            Step::reply(204, &[], ""),
        ]);

        let req = agent.put("http://example.com/v1").send(json!({ "x": 1 }));
        req.send_async().await.unwrap();

        let sent = transport.requests();
        assert_eq!(sent[1].method, http::Method::PUT);
        assert_eq!(sent[1].body_bytes(), br#"{"x":1}"#);
        assert_eq!(req.method(), Method::Put);
    }

    #[tokio::test]
    async fn file_redirect_is_refused() {
        let (agent, _) = scripted_agent(vec![Step::reply(302, &[("location", "file:///etc/passwd")], "")]);
        let err = agent.get("http://example.com/").send_async().await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidRedirectScheme(_)));
    }

    #[tokio::test]
    async fn error_status_is_not_a_failure() {
        let (agent, _) = scripted_agent(vec![Step::reply(404, &[], "missing")]);
        let res = agent.get("http://example.com/").send_async().await.unwrap();
        assert!(res.not_found());
        assert!(res.client_error());
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let (agent, _) = scripted_agent(vec![Step::Fail(TransportErrorCode::ConnectionRefused)]);
        let err = agent.get("http://example.com/").send_async().await.unwrap_err();
        assert_eq!(err.code(), Some(TransportErrorCode::ConnectionRefused));
        assert!(err.response().is_none());
        assert_eq!(agent.activity().count(), 0);
    }

    #[tokio::test]
    async fn cookies_flow_through_the_jar() {
        let (agent, transport) = scripted_agent(vec![
            Step::reply(302, &[("location", "/home"), ("set-cookie", "sid=abc; Path=/")], ""),
            Step::reply(200, &[], ""),
        ]);

        agent.get("http://example.com/login").send_async().await.unwrap();

        let sent = transport.requests();
        assert!(sent[0].headers.get("cookie").is_none());
        assert_eq!(sent[1].headers.get("cookie").unwrap(), "sid=abc");
    }

    #[tokio::test]
    async fn progress_and_secure_connect_are_forwarded() {
        let (agent, _) = scripted_agent(vec![Step::reply(200, &[], "abcd").with_signals()]);
        let (log, listener) = recorder();

        agent
            .get("https://example.com/")
            .on(EventKind::Progress, listener.clone())
            .on(EventKind::SecureConnect, listener.clone())
            .on(EventKind::End, listener)
            .send_async()
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["secureconnect", "progress", "progress", "end"]);
    }

    #[tokio::test]
    async fn abort_settles_once_and_restores_counter() {
        let (agent, _) = scripted_agent(vec![Step::Hang]);
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = calls.clone();
        let req = agent.get("http://example.com/slow").end(move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });

        tokio::task::yield_now().await;
        req.abort();
        let result = rx.await.unwrap();

        let err = result.unwrap_err();
        assert!(err.is_abort());
        assert!(!err.is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(req.state(), RequestState::Aborted);
        assert_eq!(agent.activity().count(), 0);

        // nothing in flight anymore
        req.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_the_leg() {
        let (agent, _) = scripted_agent(vec![Step::Hang]);
        let err = agent
            .get("http://example.com/slow")
            .timeout(50)
            .send_async()
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(matches!(err.kind, ErrorKind::Timeout(d) if d == Duration::from_millis(50)));
        assert_eq!(agent.activity().count(), 0);
    }

    #[tokio::test]
    async fn then_reuses_one_promise_and_dispatches_once() {
        let (agent, transport) = scripted_agent(vec![Step::reply(200, &[], "")]);
        let req = agent.get("http://example.com/");

        let a = req.then(
            Some(|res: Response| Reaction::Fulfill(res)),
            None::<fn(RequestError) -> Reaction<Response, RequestError>>,
        );
        let b = req.then(
            Some(|res: Response| Reaction::Fulfill(res)),
            None::<fn(RequestError) -> Reaction<Response, RequestError>>,
        );

        assert!(a.wait().await.is_ok());
        assert!(b.wait().await.is_ok());
        assert!(req.promise().ptr_eq(&req.promise()));
        assert_eq!(req.promise().state(), PromiseState::Fulfilled);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn then_map_chains_to_another_type() {
        let (agent, _) = scripted_agent(vec![Step::reply(204, &[], "")]);
        let req = agent.get("http://example.com/");

        let status = req.then_map(
            |res: Response| Reaction::Fulfill(res.status()),
            None::<fn(RequestError) -> Reaction<u16, RequestError>>,
        );
        assert_eq!(status.wait().await.unwrap(), 204);
    }

    #[tokio::test]
    async fn promise_after_end_reuses_the_outcome() {
        let (agent, transport) = scripted_agent(vec![Step::reply(200, &[], "")]);
        let (tx, rx) = oneshot::channel();
        let req = agent.get("http://example.com/").end(move |result| {
            let _ = tx.send(result.is_ok());
        });
        assert!(rx.await.unwrap());

        assert!(req.send_async().await.is_ok());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn second_end_is_ignored() {
        let (agent, _) = scripted_agent(vec![Step::reply(200, &[], "")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let first = calls.clone();
        let second = calls.clone();
        let req = agent
            .get("http://example.com/")
            .end(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            })
            .end(move |_| {
                second.fetch_add(10, Ordering::SeqCst);
            });

        rx.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(req.state(), RequestState::Completed);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_the_request() {
        let (agent, _) = scripted_agent(vec![Step::reply(200, &[], "")]);
        let res = agent
            .get("http://example.com/")
            .on(EventKind::Response, |_: &RequestEvent<'_>| panic!("listener"))
            .send_async()
            .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn invalid_url_fails_without_transport() {
        let (agent, transport) = scripted_agent(vec![]);
        let err = agent.get("::nope::").send_async().await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidUrl(_)));
        assert!(transport.requests().is_empty());
    }
}
