//! Control-plane accept loop (C8, spec.md §4.7): binds the operator
//! UNIX-domain socket and spawns one worker task per connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};

use super::session::{handle_connection, SessionContext};
use crate::runtime::SharedRuntime;

const SOCKET_MODE: u32 = 0o666;

pub async fn run(
    socket_path: PathBuf,
    logs_path: PathBuf,
    shared: SharedRuntime,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    set_socket_mode(&socket_path, SOCKET_MODE)?;
    info!("control-plane listening on {}", socket_path.display());

    let config_mode_active = Arc::new(AtomicBool::new(false));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("control-plane accept loop shutting down");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let ctx = SessionContext {
                            shared: shared.clone(),
                            config_mode_active: config_mode_active.clone(),
                            shutdown_tx: shutdown_tx.clone(),
                            logs_path: logs_path.clone(),
                        };
                        tokio::spawn(async move {
                            handle_connection(stream, ctx).await;
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

#[cfg(unix)]
fn set_socket_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}
