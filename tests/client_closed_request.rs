//! Behavior of the client-closed-request middleware under cancellation races.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{Method, StatusCode};
use kube_trivy_exporter::middleware::{ClientClosedRequest, Logger, Middleware};
use kube_trivy_exporter::{Cancellation, CancelError, Handler, Request, Response, trace};

/// Collects every message it is given.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn logs(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Logger for Recorder {
    fn info(&self, args: fmt::Arguments<'_>) {
        self.0.lock().unwrap().push(args.to_string());
    }
}

async fn noop(_req: Request) -> Response {
    Response::text("hello")
}

fn cancelled(cause: CancelError) -> Cancellation {
    let signal = Cancellation::new();
    signal.cancel_with(cause);
    signal
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_request_is_silent_and_untouched() {
    let recorder = Recorder::default();
    let handler = ClientClosedRequest::new(recorder.clone()).wrap(noop).into_boxed_handler();

    let res = handler.call(Request::new(Method::GET, "/")).await;

    assert_eq!(res.status_code(), StatusCode::OK);
    assert_eq!(res.body(), b"hello");
    assert_eq!(res.header("content-type"), Some("text/plain; charset=utf-8"));
    assert!(recorder.logs().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn precancelled_request_logs_once() {
    let recorder = Recorder::default();
    let (decorated, line) = (ClientClosedRequest::new(recorder.clone()).wrap(noop), line!());
    let handler = decorated.into_boxed_handler();

    let req = Request::new(Method::GET, "/").with_cancellation(cancelled(CancelError::Canceled));
    let res = handler.call(req).await;
    assert_eq!(res.body(), b"hello");

    let logs = recorder.logs();
    assert_eq!(logs.len(), 1);
    let lines: Vec<&str> = logs[0].lines().collect();
    assert_eq!(lines.first(), Some(&"client closed request in GET /:"));
    assert!(lines[1].starts_with("    ") && lines[1].ends_with("noop"), "{}", logs[0]);
    assert_eq!(lines[2], format!("        {}:{line}", file!()));
    assert_eq!(lines.last(), Some(&"  - context canceled"));
    assert!(logs[0].ends_with('\n'));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_cause_is_reported() {
    let recorder = Recorder::default();
    let handler = ClientClosedRequest::new(recorder.clone()).wrap(noop).into_boxed_handler();

    let req = Request::new(Method::POST, "/scan")
        .with_cancellation(cancelled(CancelError::DeadlineExceeded));
    handler.call(req).await;

    let logs = recorder.logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].starts_with("client closed request in POST /scan:\n"));
    assert!(logs[0].ends_with("  - context deadline exceeded\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_mid_flight_logs_live_trace_and_waits_for_handler() {
    let recorder = Recorder::default();
    let finished = Arc::new(AtomicBool::new(false));
    let finished_at_log = Arc::new(Mutex::new(None));

    let slow = {
        let finished = Arc::clone(&finished);
        move |_req: Request| {
            let finished = Arc::clone(&finished);
            async move {
                trace::scope("load_report", tokio::time::sleep(Duration::from_millis(200))).await;
                finished.store(true, Ordering::SeqCst);
                Response::text("late")
            }
        }
    };

    // Snapshot whether the handler had finished at the moment of logging.
    struct Probe {
        recorder: Recorder,
        finished: Arc<AtomicBool>,
        finished_at_log: Arc<Mutex<Option<bool>>>,
    }
    impl Logger for Probe {
        fn info(&self, args: fmt::Arguments<'_>) {
            *self.finished_at_log.lock().unwrap() = Some(self.finished.load(Ordering::SeqCst));
            self.recorder.info(args);
        }
    }

    let probe = Probe {
        recorder: recorder.clone(),
        finished: Arc::clone(&finished),
        finished_at_log: Arc::clone(&finished_at_log),
    };
    let handler = ClientClosedRequest::new(probe).wrap(slow).into_boxed_handler();

    let signal = Cancellation::new();
    let req = Request::new(Method::GET, "/report").with_cancellation(signal.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        signal.cancel();
    });

    let res = handler.call(req).await;
    canceller.await.unwrap();

    assert!(finished.load(Ordering::SeqCst), "returned before the handler finished");
    assert_eq!(res.body(), b"late");
    assert_eq!(*finished_at_log.lock().unwrap(), Some(false));

    let logs = recorder.logs();
    assert_eq!(logs.len(), 1);
    let lines: Vec<&str> = logs[0].lines().collect();
    assert_eq!(lines[0], "client closed request in GET /report:");
    assert_eq!(lines[1], "    load_report");
    assert!(lines[2].starts_with(&format!("        {}:", file!())), "{}", logs[0]);
    assert!(lines[3].starts_with("    ") && lines[3].contains("cancellation_mid_flight"), "{}", logs[0]);
    assert_eq!(lines.last(), Some(&"  - context canceled"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_trace_has_a_located_frame() {
    let recorder = Recorder::default();
    let handler = ClientClosedRequest::new(recorder.clone()).wrap(noop).into_boxed_handler();
    handler
        .call(Request::new(Method::GET, "/").with_cancellation(cancelled(CancelError::Canceled)))
        .await;

    let logs = recorder.logs();
    let located = logs[0].lines().filter_map(|l| l.trim().rsplit_once(':')).any(|(file, line)| {
        !file.is_empty() && line.parse::<u32>().is_ok_and(|n| n > 0)
    });
    assert!(located, "{}", logs[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn exactly_once_under_concurrency() {
    const REQUESTS: usize = 300;

    let mut running = Vec::with_capacity(REQUESTS);
    for i in 0..REQUESTS {
        let recorder = Recorder::default();
        let handler = ClientClosedRequest::new(recorder.clone()).wrap(move |_req: Request| async move {
            for _ in 0..(i % 4) {
                tokio::task::yield_now().await;
            }
            Response::text(i.to_string())
        });
        let handler = handler.into_boxed_handler();
        let signal = Cancellation::new();
        let req = Request::new(Method::GET, format!("/r/{i}")).with_cancellation(signal.clone());

        // A third never cancelled, a third cancelled up front, a third
        // cancelled while racing the handler.
        let mode = i % 3;
        if mode == 1 {
            signal.cancel();
        }
        running.push(tokio::spawn(async move {
            let racer = (mode == 2).then(|| {
                tokio::spawn(async move {
                    for _ in 0..(i % 5) {
                        tokio::task::yield_now().await;
                    }
                    signal.cancel();
                })
            });
            let res = handler.call(req).await;
            if let Some(racer) = racer {
                racer.await.unwrap();
            }
            (mode, res.body().to_vec(), recorder.logs())
        }));
    }

    for (i, task) in running.into_iter().enumerate() {
        let (mode, body, logs) = task.await.unwrap();
        assert_eq!(body, i.to_string().into_bytes());
        match mode {
            0 => assert!(logs.is_empty(), "request {i}: {logs:?}"),
            1 => assert_eq!(logs.len(), 1, "request {i}: {logs:?}"),
            _ => assert!(logs.len() <= 1, "request {i}: {logs:?}"),
        }
        for log in &logs {
            assert!(log.starts_with(&format!("client closed request in GET /r/{i}:\n")));
            assert!(log.ends_with("  - context canceled\n"));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrapping_twice_gives_independent_decorators() {
    let first = Recorder::default();
    let second = Recorder::default();
    let a = ClientClosedRequest::new(first.clone()).wrap(noop).into_boxed_handler();
    let b = ClientClosedRequest::new(second.clone()).wrap(noop).into_boxed_handler();

    a.call(Request::new(Method::GET, "/a").with_cancellation(cancelled(CancelError::Canceled))).await;
    b.call(Request::new(Method::GET, "/b")).await;
    b.call(Request::new(Method::GET, "/b")).await;

    assert_eq!(first.logs().len(), 1);
    assert!(second.logs().is_empty());

    // The same middleware applied twice to one handler.
    let shared = ClientClosedRequest::new(first.clone());
    let c = shared.apply(noop.into_boxed_handler());
    let d = shared.apply(noop.into_boxed_handler());
    c.call(Request::new(Method::GET, "/c").with_cancellation(cancelled(CancelError::Canceled))).await;
    d.call(Request::new(Method::GET, "/d")).await;

    let logs = first.logs();
    assert_eq!(logs.len(), 2);
    assert!(logs[1].starts_with("client closed request in GET /c:"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_panic_propagates_without_diagnostic() {
    let recorder = Recorder::default();
    let handler = ClientClosedRequest::new(recorder.clone())
        .wrap(|_req: Request| async move {
            if true {
                panic!("boom");
            }
            Response::text("unreachable")
        })
        .into_boxed_handler();

    let err = tokio::spawn(handler.call(Request::new(Method::GET, "/")))
        .await
        .unwrap_err();

    assert!(err.is_panic());
    let payload = err.into_panic();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    assert!(recorder.logs().is_empty());
}

/// A handler that returns only after its request was cancelled and `gate`
/// was opened.
fn gated(gate: Arc<tokio::sync::Notify>, outcome: Result<&'static str, &'static str>) -> impl Handler {
    move |req: Request| {
        let gate = Arc::clone(&gate);
        async move {
            req.cancellation().cancelled().await;
            gate.notified().await;
            match outcome {
                Ok(body) => Response::text(body),
                Err(msg) => panic!("{msg}"),
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_before_completion_always_logs() {
    for round in 0..50 {
        let recorder = Recorder::default();
        let gate = Arc::new(tokio::sync::Notify::new());
        let handler = ClientClosedRequest::new(recorder.clone())
            .wrap(gated(Arc::clone(&gate), Ok("finished")))
            .into_boxed_handler();

        let signal = Cancellation::new();
        let call = tokio::spawn(
            handler.call(Request::new(Method::GET, "/gated").with_cancellation(signal.clone())),
        );
        for _ in 0..(round % 3) {
            tokio::task::yield_now().await;
        }
        signal.cancel();
        gate.notify_one();

        let res = call.await.unwrap();
        assert_eq!(res.body(), b"finished");
        let logs = recorder.logs();
        assert_eq!(logs.len(), 1, "round {round}: {logs:?}");
        assert!(logs[0].ends_with("  - context canceled\n"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panic_after_reported_cancellation_is_resumed() {
    let recorder = Recorder::default();
    let gate = Arc::new(tokio::sync::Notify::new());
    let handler = ClientClosedRequest::new(recorder.clone())
        .wrap(gated(Arc::clone(&gate), Err("late boom")))
        .into_boxed_handler();

    let signal = Cancellation::new();
    let call = tokio::spawn(
        handler.call(Request::new(Method::GET, "/gated").with_cancellation(signal.clone())),
    );
    signal.cancel();

    tokio::time::timeout(Duration::from_secs(2), async {
        while recorder.logs().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cancellation was not reported");
    gate.notify_one();

    let err = call.await.unwrap_err();
    assert!(err.is_panic());
    let payload = err.into_panic();
    assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("late boom"));
    assert_eq!(recorder.logs().len(), 1);
}
