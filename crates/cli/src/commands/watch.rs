//! Follow a CVM's state until interrupted

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use nexis_common::{CloudClient, StateWatcher, WatchUpdate};

use crate::output::{print_info, print_warning, status_label, OutputFormat};

fn render(update: &WatchUpdate, format: OutputFormat) {
    match (format, update) {
        (OutputFormat::Json, WatchUpdate::Status(status)) => println!("{}", json!({ "status": status })),
        (OutputFormat::Json, WatchUpdate::Notice(notice)) => println!("{}", json!({ "notice": notice })),
        (OutputFormat::Table, WatchUpdate::Status(status)) => println!("● {}", status_label(status)),
        (OutputFormat::Table, WatchUpdate::Notice(notice)) => print_warning(notice),
    }
}

pub async fn execute(client: &CloudClient, id: &str, format: OutputFormat) -> Result<()> {
    let detail = client.get_cvm(id).await?;
    let initial = detail.status.to_string();
    if format == OutputFormat::Table {
        print_info(&format!("Watching {} (Ctrl-C to stop)", detail.app_id));
    }
    render(&WatchUpdate::Status(initial.clone()), format);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted");
        }
        on_signal.cancel();
    });

    let last = StateWatcher::new(client.clone(), detail.app_id, initial)
        .run(cancel, |update| render(&update, format))
        .await;
    debug!(status = %last, "Watch finished");
    Ok(())
}
