use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{error, info, warn};

use finch_s3::S3Storage;
use finch_transfer::{ChannelSink, StorageClient, TransferEvent, TransferManager};

use crate::config::FinchConfig;
use crate::output::{Printer, Summary};
use crate::{Cli, Command};

/// Submits everything on the command line and waits for each item to finish.
pub async fn run(cli: Cli) -> anyhow::Result<Summary> {
    let mut config = FinchConfig::load(cli.config.as_deref())?;
    if let Some(concurrency) = cli.concurrency {
        config.transfer.concurrency = concurrency;
    }

    let storage: Arc<dyn StorageClient> = Arc::new(S3Storage::connect(&config.s3).await);
    let (sink, events) = ChannelSink::new();
    let concurrency = config.transfer.concurrency;
    let manager = TransferManager::new(storage, Arc::new(sink), config.transfer);

    let mut printer = Printer::new(cli.json);
    let mut summary = Summary::default();
    let mut queued = 0;

    match &cli.command {
        Command::Download(args) => {
            for key in &args.keys {
                match manager.submit(&args.bucket, key, &args.dest).await {
                    Ok(id) => {
                        printer.label(id, key.as_str());
                        queued += 1;
                    }
                    Err(e) => {
                        error!(bucket = %args.bucket, key = %key, error = %e, "cannot queue download");
                        summary.rejected += 1;
                    }
                }
            }
        }
        Command::Upload(args) => {
            for file in &args.files {
                match manager
                    .submit_upload(file, &args.bucket, args.folder.as_deref())
                    .await
                {
                    Ok(id) => {
                        printer.label(id, file.display().to_string());
                        queued += 1;
                    }
                    Err(e) => {
                        error!(file = %file.display(), error = %e, "cannot queue upload");
                        summary.rejected += 1;
                    }
                }
            }
        }
    }

    let mut finish = Finish::Drained;
    if queued > 0 {
        manager
            .start(concurrency)
            .context("failed to start transfers")?;
        let interrupts = forward_interrupts();
        finish = wait_for(&manager, events, queued, &printer, &mut summary, interrupts).await;
    }
    match finish {
        Finish::Drained => manager.shutdown().await,
        // Workers stuck in a storage call would never join; drop detaches them.
        Finish::Abandoned => drop(manager),
    }

    info!(%summary, "finished");
    Ok(summary)
}

/// How [`wait_for`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    /// Every item reached a terminal state, or the sink closed.
    Drained,
    /// A second interrupt arrived before that happened.
    Abandoned,
}

/// Forwards every Ctrl-C to a channel. The handler stays installed.
fn forward_interrupts() -> UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                break;
            }
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Prints events until `pending` items are terminal.
///
/// The first interrupt cancels everything; the second gives up waiting and
/// counts what is left as cancelled.
async fn wait_for(
    manager: &TransferManager,
    mut events: UnboundedReceiver<TransferEvent>,
    mut pending: usize,
    printer: &Printer,
    summary: &mut Summary,
    mut interrupts: UnboundedReceiver<()>,
) -> Finish {
    let mut interrupted = false;

    while pending > 0 {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.is_terminal() {
                    pending -= 1;
                    summary.record(&event);
                }
                println!("{}", printer.render(&event));
            }
            Some(()) = interrupts.recv() => {
                if interrupted {
                    warn!(pending, "interrupted again, abandoning unfinished transfers");
                    summary.cancelled += pending;
                    return Finish::Abandoned;
                }
                interrupted = true;
                warn!("interrupted, cancelling transfers (ctrl-c again to quit)");
                manager.cancel_all();
            }
        }
    }
    Finish::Drained
}
