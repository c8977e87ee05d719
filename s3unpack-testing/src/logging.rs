//! Per-test log capture.
//!
//! Tests run in parallel within one process, so a global `tracing` subscriber would mix the log
//! output of every test together.  Instead each test gets its own dispatcher and its own tokio
//! runtime whose worker threads all use that dispatcher, and the captured output is printed when
//! the test ends, pass or fail.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Used when `RUST_LOG` isn't set
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,rustls=info,aws=info,s3unpack=trace,debug";

/// Collects the formatted log output of one test
#[derive(Clone, Default)]
struct CapturedLog {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLog {
    fn take(&self) -> String {
        let buffer = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<'a> Write for &'a CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn make_dispatch(log: CapturedLog) -> Result<tracing::Dispatch> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(log);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(format);

    Ok(tracing::Dispatch::new(subscriber))
}

/// Run an async test with its own multi-threaded tokio runtime and its own log capture.
///
/// Use it in place of `#[tokio::test]`:
///
/// ```ignore
/// #[test]
/// fn my_test() -> Result<()> {
///     test_with_logging(async move {
///         // ...
///         Ok(())
///     })
/// }
/// ```
///
/// Every log event from the test, including events from tasks on the runtime's worker threads
/// and from `spawn_blocking` threads, is printed once the test finishes.  A panic in the test is
/// re-raised after the log is printed.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let log = CapturedLog::default();
    let dispatch = make_dispatch(log.clone())?;

    std::thread_local! {
        static THREAD_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    tracing::dispatcher::with_default(&dispatch, || {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        {
            let dispatch = dispatch.clone();
            builder.on_thread_start(move || {
                let guard = tracing::dispatcher::set_default(&dispatch);
                THREAD_DISPATCH.with(|cell| cell.replace(Some(guard)));
            });
        }
        builder.on_thread_stop(|| {
            THREAD_DISPATCH.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test:\n{}", log.take());

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
