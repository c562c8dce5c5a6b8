use std::borrow::Cow;
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use tracing::{debug, error, warn};

use crate::app::{App, Entrypoint};
use crate::AppState;

/// Drive cron entries: a single ticker aligned to minute boundaries scans
/// every app and fires the entries whose schedule lands exactly on the
/// tick. Missed minutes are skipped, never caught up.
pub fn spawn(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(state))
}

async fn run(state: Arc<AppState>) {
    loop {
        let now = Utc::now();
        let truncated = now.duration_trunc(Duration::minutes(1)).unwrap_or(now);
        let next_minute = truncated + Duration::minutes(1);
        let until = (next_minute - now)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));
        tokio::time::sleep(until).await;

        tick(&state, next_minute).await;
    }
}

/// One scheduler pass for the minute boundary `now`.
pub(crate) async fn tick(state: &Arc<AppState>, now: DateTime<Utc>) {
    let entries = match std::fs::read_dir(&state.config.root_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "Failed to enumerate apps for cron pass");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }

        let app = match App::load(&state.config.root_dir, name).await {
            Ok(app) => app,
            Err(e) => {
                debug!(app = %name, error = %e, "Skipping app in cron pass");
                continue;
            }
        };
        if app.config.crons.is_empty() {
            continue;
        }

        let entrypoint = match &app.entrypoint {
            Entrypoint::File(path) => path.clone(),
            Entrypoint::Reserved(_) => {
                warn!(app = %name, "Reserved entrypoints cannot run cron commands");
                continue;
            }
        };

        for cron_entry in &app.config.crons {
            if !due(&cron_entry.schedule, now) {
                continue;
            }

            debug!(app = %name, schedule = %cron_entry.schedule, "Firing cron entry");
            let state = state.clone();
            let entrypoint = entrypoint.clone();
            let args = cron_entry.args.clone();
            let app_name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = state.evaluator.command(&entrypoint, &args).await {
                    error!(app = %app_name, error = %e, "Cron invocation failed");
                }
            });
        }
    }
}

/// A schedule fires at minute boundary `now` iff its next occurrence after
/// `now - 1s` is exactly `now`: no double-fire, no catch-up.
pub(crate) fn due(schedule: &str, now: DateTime<Utc>) -> bool {
    let normalized = normalize(schedule);
    match normalized.parse::<cron::Schedule>() {
        Ok(parsed) => parsed.after(&(now - Duration::seconds(1))).next() == Some(now),
        Err(e) => {
            warn!(schedule = %schedule, error = %e, "Ignoring unparseable cron schedule");
            false
        }
    }
}

/// Accept the 5-field grammar by pinning the seconds field; descriptors
/// (`@hourly` and friends) pass through untouched.
fn normalize(schedule: &str) -> Cow<'_, str> {
    let trimmed = schedule.trim();
    if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        Cow::Owned(format!("0 {trimmed}"))
    } else {
        Cow::Borrowed(trimmed)
    }
}
