//! The daemon's transport endpoint: a Unix-domain socket serving
//! newline-framed JSON requests through the authentication pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::crypto::PublicKey;
use crate::envelope::{verify, CommandEnvelope};
use crate::error::Error;
use crate::policy::PolicyState;
use crate::replay::ReplayGuard;

/// Everything a running connection handler needs, shared across tasks.
pub struct Daemon {
    state: Arc<PolicyState>,
    replay_guard: Arc<ReplayGuard>,
    verify_key: PublicKey,
    socket_path: PathBuf,
    max_frame_bytes: usize,
    request_timeout: Duration,
    shutdown_grace: Duration,
    freshness_window_secs: i64,
    nonce_cache_capacity: usize,
}

impl Daemon {
    /// Construct a daemon endpoint. Does not bind the socket yet.
    #[must_use]
    pub fn new(
        state: Arc<PolicyState>,
        replay_guard: Arc<ReplayGuard>,
        verify_key: PublicKey,
        socket_path: PathBuf,
        max_frame_bytes: usize,
        request_timeout: Duration,
        shutdown_grace: Duration,
        freshness_window_secs: i64,
        nonce_cache_capacity: usize,
    ) -> Self {
        Self {
            state,
            replay_guard,
            verify_key,
            socket_path,
            max_frame_bytes,
            request_timeout,
            shutdown_grace,
            freshness_window_secs,
            nonce_cache_capacity,
        }
    }

    /// Bind the socket and serve connections until `shutdown` fires.
    ///
    /// On bind, any stale socket file left by a previous run is removed
    /// first: the runtime directory is not a shared mutable resource, so
    /// a leftover path here means a prior instance exited uncleanly.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the socket cannot be bound or its
    /// permissions cannot be set.
    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> crate::error::Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750))?;
            }
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;
        }

        info!(socket = %self.socket_path.display(), "listening");

        let mut inflight = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("shutdown requested, closing listener");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let this = Arc::clone(&self);
                            inflight.spawn(async move {
                                if let Err(e) = this.handle_connection(stream).await {
                                    debug!(error = %e, "connection handler exited with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        let drain = tokio::time::timeout(self.shutdown_grace, async {
            while inflight.join_next().await.is_some() {}
        });
        if drain.await.is_err() {
            warn!("shutdown grace period elapsed with handlers still in flight");
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> crate::error::Result<()> {
        let mut reader = BufReader::new(stream);
        let frame = tokio::time::timeout(
            self.request_timeout,
            read_framed(&mut reader, self.max_frame_bytes),
        )
        .await;

        let reply = match frame {
            Ok(Ok(line)) => self.process_request(&line).await,
            Ok(Err(e)) => Reply::error(&e),
            Err(_) => Reply::error(&Error::Timeout),
        };

        let bytes = serde_json::to_vec(&reply).unwrap_or_else(|_| b"{}".to_vec());
        let stream = reader.into_inner();
        write_reply(stream, &bytes).await
    }

    async fn process_request(&self, line: &[u8]) -> Reply {
        let envelope: CommandEnvelope = match serde_json::from_slice(line) {
            Ok(e) => e,
            Err(e) => return Reply::error(&Error::MalformedMessage(e.to_string())),
        };

        let signature = match crate::crypto::Signature::from_base64(&envelope.signature) {
            Ok(s) => s,
            Err(e) => return Reply::error(&e),
        };

        if let Err(e) = verify(&self.verify_key, &envelope.msg, &signature) {
            warn!(key = %self.verify_key.fingerprint(), "signature verification failed");
            return Reply::error(&e);
        }

        if let Err(e) = self
            .replay_guard
            .check(&envelope.msg.nonce, envelope.msg.timestamp)
        {
            return Reply::error(&e);
        }

        match envelope.msg.command.as_str() {
            "set_policy" => match self.state.set_policy(&envelope.msg.args) {
                Ok(outcome) => Reply::set_policy(outcome),
                Err(e) => Reply::error(&e),
            },
            "get_status" => Reply::status(
                self.state
                    .status(self.freshness_window_secs, self.nonce_cache_capacity),
            ),
            other => Reply::error(&Error::UnknownCommand(other.to_string())),
        }
    }
}

/// Read a single newline-terminated frame, rejecting input that exceeds
/// `limit` before the full line is necessarily read.
async fn read_framed<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    limit: usize,
) -> crate::error::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let filled = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            let take = available.len().min(chunk.len());
            chunk[..take].copy_from_slice(&available[..take]);
            take
        };
        if let Some(pos) = chunk[..filled].iter().position(|&b| b == b'\n') {
            if buf.len() + pos > limit {
                reader.consume(pos + 1);
                return Err(Error::FrameTooLarge {
                    size: buf.len() + pos,
                    limit,
                });
            }
            buf.extend_from_slice(&chunk[..pos]);
            reader.consume(pos + 1);
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..filled]);
        reader.consume(filled);
        if buf.len() > limit {
            return Err(Error::FrameTooLarge {
                size: buf.len(),
                limit,
            });
        }
    }
    if buf.is_empty() {
        return Err(Error::MalformedMessage("connection closed before a frame was sent".into()));
    }
    Ok(buf)
}

async fn write_reply(mut stream: UnixStream, bytes: &[u8]) -> crate::error::Result<()> {
    stream.write_all(bytes).await?;
    stream.write_all(b"\n").await?;
    Ok(())
}

/// The daemon's on-wire reply.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Reply {
    Ok {
        #[serde(flatten)]
        body: ReplyBody,
    },
    Error {
        kind: String,
        message: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ReplyBody {
    SetPolicy(crate::policy::SetPolicyOutcome),
    Status(crate::policy::StatusDocument),
}

impl Reply {
    fn error(err: &Error) -> Self {
        Reply::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    fn set_policy(outcome: crate::policy::SetPolicyOutcome) -> Self {
        Reply::Ok {
            body: ReplyBody::SetPolicy(outcome),
        }
    }

    fn status(doc: crate::policy::StatusDocument) -> Self {
        Reply::Ok {
            body: ReplyBody::Status(doc),
        }
    }
}

/// Remove the socket path if present, without complaint if it's already
/// gone. Used by tests and the daemon's own shutdown path.
pub fn cleanup_socket(path: &Path) {
    let _ = std::fs::remove_file(path);
}
