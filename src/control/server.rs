//! Unix socket control server
//!
//! Thin transport in front of [`ControlSurface`]: accepts connections on
//! the control socket, reads peer credentials once per connection, and
//! shuttles newline-delimited JSON requests through the surface.

use crate::control::protocol::{Request, Response};
use crate::control::{ControlSurface, Principal};
use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Maximum allowed line length for incoming requests.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Cap on total readable bytes per connection, so a line without a
/// newline cannot accumulate unbounded memory.
const MAX_CONNECTION_BYTES: u64 = 1024 * 1024;

/// Serve the control surface on a Unix socket until `shutdown` signals.
pub async fn serve(
    socket_path: &Path,
    surface: Arc<ControlSurface>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Remove a stale socket, tolerating NotFound
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "control socket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let surface = Arc::clone(&surface);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, surface).await {
                                debug!(error = %e, "control connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "control socket accept error"),
                }
            }
            _ = shutdown.wait_for(|&stop| stop) => {
                info!("control socket shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn handle_connection(stream: UnixStream, surface: Arc<ControlSurface>) -> Result<()> {
    let caller = principal_for(&stream);
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader.take(MAX_CONNECTION_BYTES)).lines();

    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_LINE_LENGTH {
            write_response(&mut writer, &Response::error(&Error::TooLarge)).await?;
            return Err(Error::TooLarge);
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => surface.handle(caller, request),
            Err(e) => Response::error(&Error::InvalidArgument(e.to_string())),
        };
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

/// Peer credentials are read once per connection. A peer without a
/// resolvable pid can still use the read endpoints but never
/// authenticates as the helper.
fn principal_for(stream: &UnixStream) -> Principal {
    match stream.peer_cred() {
        Ok(cred) => Principal {
            pid: cred.pid().unwrap_or(0),
            uid: cred.uid(),
        },
        Err(e) => {
            warn!(error = %e, "failed to read peer credentials");
            Principal {
                pid: 0,
                uid: u32::MAX,
            }
        }
    }
}

async fn write_response(
    writer: &mut (impl AsyncWriteExt + Unpin),
    response: &Response,
) -> Result<()> {
    let mut json =
        serde_json::to_string(response).map_err(|e| Error::Internal(e.to_string()))?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
