//! Records command handler: list or remove completed downloads.

use anyhow::{Context, Result};
use streamfetch_core::records::{DownloadRecord, RecordStore};

use super::AppContext;
use crate::cli::RecordsArgs;

pub async fn run_records_command(ctx: &AppContext, args: &RecordsArgs) -> Result<()> {
    let path = args
        .file
        .clone()
        .unwrap_or_else(|| ctx.preferences.records_path.clone());
    let store = RecordStore::open(&path)
        .await
        .with_context(|| format!("Failed to open download records '{}'", path.display()))?;

    if let Some(id) = args.remove {
        match store.remove(id).await? {
            Some(record) => println!("Removed record {id} ({})", record.name),
            None => println!("No record with id {id}"),
        }
        return Ok(());
    }

    let records = store.all();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No downloads recorded in {}.", path.display());
        return Ok(());
    }
    for record in &records {
        println!("{}", render_record_row(record));
    }
    Ok(())
}

fn render_record_row(record: &DownloadRecord) -> String {
    let subtitle = if record.local_subtitle_url.is_some() {
        " [sub]"
    } else {
        ""
    };
    format!(
        "{}  {}  {}{}\n    {}",
        record.download_date.format("%Y-%m-%d %H:%M"),
        record.id,
        record.name,
        subtitle,
        record.local_url.display()
    )
}
