//! Per-connection state machine (spec.md §4.7): `Accepting →
//! AwaitingMode(≤2s) → { ConfigLoop | OneShotReply | Rejected } → Closed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::{info, warn};

use super::commands;
use super::selection::parse_selection;
use crate::runtime::SharedRuntime;

const MODE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SessionContext {
    pub shared: SharedRuntime,
    pub config_mode_active: Arc<AtomicBool>,
    pub shutdown_tx: watch::Sender<bool>,
    pub logs_path: std::path::PathBuf,
}

pub async fn handle_connection(stream: UnixStream, ctx: SessionContext) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let mode_line = match tokio::time::timeout(MODE_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        _ => {
            let _ = writer.write_all(b"no mode received within 2s, closing\n").await;
            return;
        }
    };

    match mode_line.trim() {
        "1" => run_config_mode(&mut lines, &mut writer, &ctx).await,
        "2" => {
            let reply = match crate::runtime::reload(&ctx.shared).await {
                Ok(summary) => format!("{summary}\n"),
                Err(e) => format!("reload failed: {e}\n"),
            };
            let _ = writer.write_all(reply.as_bytes()).await;
        }
        "3" => {
            let guard = ctx.shared.lock().await;
            let lines = commands::statistics_snapshot_lines(&guard.table);
            drop(guard);
            let _ = writer.write_all(lines.join("\n").as_bytes()).await;
            let _ = writer.write_all(b"\n").await;
        }
        other => {
            let _ = writer
                .write_all(format!("rejected: unknown mode code '{other}'\n").as_bytes())
                .await;
        }
    }
}

async fn run_config_mode(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    ctx: &SessionContext,
) {
    if ctx
        .config_mode_active
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        let _ = writer
            .write_all(b"warning: another operator already holds config mode\n")
            .await;
        return;
    }

    let _ = write_menu(writer).await;
    let mut consecutive_zero = 0u32;

    loop {
        let choice = match lines.next_line().await {
            Ok(Some(line)) => line.trim().to_string(),
            _ => break,
        };

        if choice == "0" {
            consecutive_zero += 1;
            if consecutive_zero >= 3 {
                info!("operator requested termination via config mode");
                let _ = writer.write_all(b"terminating supervisor\n").await;
                let _ = ctx.shutdown_tx.send(true);
                break;
            }
            let _ = writer
                .write_all(format!("press 0 {} more time(s) to terminate\n", 3 - consecutive_zero).as_bytes())
                .await;
            continue;
        }
        consecutive_zero = 0;

        let reply = dispatch(&choice, lines, ctx).await;
        let _ = writer.write_all(reply.join("\n").as_bytes()).await;
        let _ = writer.write_all(b"\n").await;
        let _ = write_menu(writer).await;
    }

    ctx.config_mode_active.store(false, Ordering::SeqCst);
}

async fn write_menu(writer: &mut tokio::net::unix::OwnedWriteHalf) -> std::io::Result<()> {
    writer
        .write_all(
            b"1 enable-all | 2 disable-all | 3 enable | 4 disable | 5 status | \
              6 full listing | 7 reload | 8 info | 9 show-logs | 0 0 0 terminate\n",
        )
        .await
}

async fn dispatch(
    choice: &str,
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    ctx: &SessionContext,
) -> Vec<String> {
    match choice {
        "1" => {
            let mut guard = ctx.shared.lock().await;
            commands::enable_all(&mut guard.table);
            vec!["all modules enabled".to_string()]
        }
        "2" => {
            let mut guard = ctx.shared.lock().await;
            commands::disable_all(&mut guard.table);
            vec!["all modules disabled".to_string()]
        }
        "3" | "4" => {
            let selection_line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => return vec!["rejected: expected a selection line".to_string()],
            };
            let mut guard = ctx.shared.lock().await;
            let total = commands::selection_space_size(&guard.table);
            match parse_selection(&selection_line, total) {
                Ok(selection) => {
                    commands::apply_selection(&mut guard.table, &selection, choice == "3");
                    vec![format!("applied selection to {} entries", selection.len())]
                }
                Err(e) => vec![format!("rejected: {e}")],
            }
        }
        "5" => {
            let guard = ctx.shared.lock().await;
            commands::status_lines(&guard.table)
        }
        "6" => {
            let guard = ctx.shared.lock().await;
            commands::full_listing_lines(&guard.table)
        }
        "7" => match crate::runtime::reload(&ctx.shared).await {
            Ok(summary) => vec![summary.to_string()],
            Err(e) => vec![format!("reload failed: {e}")],
        },
        "8" => {
            let guard = ctx.shared.lock().await;
            commands::info_lines(&guard.table, guard.started_at)
        }
        "9" => match commands::write_show_logs_sidecar(&ctx.logs_path.join("supervisor_log")) {
            Ok(()) => vec!["log path written to /tmp/tmp_sup_cli_file".to_string()],
            Err(e) => {
                warn!("could not write show-logs sidecar: {e}");
                vec![format!("rejected: {e}")]
            }
        },
        other => vec![format!("rejected: unknown menu item '{other}'")],
    }
}
