//! Control socket demo.
//!
//! ```text
//! cargo run --example control
//! curl --unix-socket ~/.browsermux/ctl.sock -d '{"x":1}' http://localhost/cmd
//! ```
//!
//! Logs every request and answers `Hello world!`. Ctrl-C stops it.

use ctlsock::{ControlSocketConfig, HandleResult, Listener, RequestBody, RequestHead};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn on_request(head: &RequestHead, body: &RequestBody) -> HandleResult {
    let body = match body.text() {
        Some(Ok(text)) => text.to_owned(),
        Some(Err(_)) => format!("<{} bytes, not utf-8>", body.len()),
        None => "[nil]".to_owned(),
    };
    info!(method = %head.method(), path = head.path(), headers = ?head.headers(), "head");
    info!(%body, "body");

    HandleResult::ok("Hello world!\r\n")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControlSocketConfig::browsermux()
        .ok_or("no home directory")?
        .with_app_name("BrowserMux");

    let (handle, completion) = match Listener::bind(config, on_request) {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("{}\n{}\n({})", e.summary(), e.explanation(), e.io_error());
            std::process::exit(1);
        }
    };
    tokio::pin!(completion);

    tokio::select! {
        res = &mut completion => return Ok(res?),
        () = ctlsock::shutdown_signal() => {
            info!("shutting down");
            handle.shutdown();
        }
    }

    completion.await?;
    Ok(())
}
