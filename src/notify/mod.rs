pub mod telegram;

use crate::models::ChangeRecord;
use crate::utils::fmt_number;
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

pub use self::telegram::TelegramNotifier;

/// Swappable alert sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Writes alerts to the log; used when Telegram is disabled.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        info!("Alert:\n{}", message);
        Ok(())
    }
}

/// New days only, and never the same payload twice in a row.
pub fn select_alerts(changes: &[ChangeRecord]) -> Vec<&ChangeRecord> {
    let mut selected: Vec<&ChangeRecord> = Vec::new();
    for change in changes.iter().filter(|c| c.is_new_day) {
        if selected.last().is_some_and(|prev| prev.payload == change.payload) {
            continue;
        }
        selected.push(change);
    }
    selected
}

pub fn format_alert(change: &ChangeRecord, trigger: &str, environment: &str) -> String {
    let mut lines = vec![
        "<u><b>New flows update</b></u>".to_string(),
        format!("Trigger: {} ({})", trigger, environment),
    ];
    if change.new_total != 0.0 {
        lines.push(format!("<pre>{}</pre>", change.payload));
    }
    lines.push(format!("Flows: {} m$", fmt_number(change.new_total.round() as i64)));
    lines.join("\n")
}

/// Send one alert per selected change. Returns how many went out.
pub async fn notify_changes(
    notifier: &dyn Notifier,
    changes: &[ChangeRecord],
    trigger: &str,
    environment: &str,
) -> Result<usize> {
    let alerts = select_alerts(changes);
    for change in &alerts {
        notifier.send(&format_alert(change, trigger, environment)).await?;
        info!("Notified {}", change.id);
    }
    Ok(alerts.len())
}
