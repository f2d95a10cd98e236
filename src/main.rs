//! `rabtap` binary
//!
//! Taps every source configured under `taps`, prints what arrives and
//! optionally keeps it in the capture store and/or a capture file. Runs
//! until Ctrl-C.

use rabtap::config::{Settings, load_config};
use rabtap::engine::{Context, TaggedMessage, tap};
use rabtap::persistence::{CaptureFileSink, CaptureStore};
use rabtap::transport::{TlsConfig, Transport};
use rabtap::utils::logging;
use rabtap::{Error, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const OUTPUT_BUFFER: usize = 256;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(2);
        }
    };
    logging::init(&settings.log.level);

    if let Err(err) = run(settings).await {
        error!(error = %err, "rabtap failed");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<()> {
    let specs = settings.source_specs(&TlsConfig::default())?;
    if specs.is_empty() {
        warn!("no taps configured, nothing to do");
        return Ok(());
    }

    let store = match settings.capture.path.as_deref() {
        Some(path) => Some(CaptureStore::open(
            path,
            Some(settings.capture.ttl_secs),
            Some(settings.capture.max_messages_per_source),
        )?),
        None => None,
    };
    let mut file = match settings.capture.file.as_deref() {
        Some(path) => Some(CaptureFileSink::append(path)?),
        None => None,
    };

    let transport = Transport::amqp().with_connect_timeout(settings.connect_timeout());
    let ctx = Context::new();
    let (tx, mut rx) = mpsc::channel(OUTPUT_BUFFER);
    let tapping = tokio::spawn(tap(
        transport,
        specs,
        ctx.clone(),
        settings.retry_policy(),
        tx,
    ));

    let shutdown = ctx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received, stopping taps"),
            Err(err) => error!(error = %err, "cannot listen for shutdown signal"),
        }
        shutdown.cancel();
    });

    let mut failure = None;
    while let Some(tagged) = rx.recv().await {
        println!("{}", render(&tagged));
        if let Some(store) = &store {
            if let Err(err) = store.store(&tagged) {
                warn!(error = %err, "failed to store capture");
            }
        }
        if let Some(sink) = file.as_mut() {
            if let Err(err) = sink.write(&tagged.persistent()) {
                ctx.cancel();
                failure = Some(err);
                break;
            }
        }
    }
    // keep draining so no source blocks on a full channel while stopping
    while rx.recv().await.is_some() {}

    let reports = match tapping.await {
        Ok(reports) => reports,
        Err(err) => return Err(Error::Io(std::io::Error::other(err))),
    };
    if let Some(store) = &store {
        store.flush()?;
    }
    if let Some(err) = failure {
        return Err(err);
    }

    // sources end with an error only when they failed for good, even if
    // shutdown was requested afterwards
    match reports.into_iter().find_map(|report| report.result.err()) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn render(tagged: &TaggedMessage) -> String {
    let message = &tagged.message;
    format!(
        "{} {} exchange={} routing_key={} content_type={} {}",
        tagged.received_at.to_rfc3339(),
        tagged.source,
        message.exchange,
        message.routing_key,
        message.content_type.as_deref().unwrap_or("-"),
        String::from_utf8_lossy(&message.body),
    )
}
