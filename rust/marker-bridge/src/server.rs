// marker-bridge: request socket
//
// Newline-delimited JSON over TCP: one request object per line, one reply
// object per line, strictly alternating per connection. Replies always
// carry the request's messageId as CorrelationId, even when the request
// itself failed to decode.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::service::{BridgeService, Envelope, Reply};

/// Accept request connections until the shutdown flag flips.
pub async fn serve(
    service: Arc<BridgeService>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> BridgeResult<()> {
    let local = listener
        .local_addr()
        .map_err(|e| BridgeError::Os(e.to_string()))?;
    info!(%local, "request server listening");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "request connection opened");
                        let service = Arc::clone(&service);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(service, stream, shutdown).await {
                                warn!(%peer, error = %e, "request connection error");
                            }
                            debug!(%peer, "request connection closed");
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
    info!("request server stopped");
    Ok(())
}

async fn handle_connection(
    service: Arc<BridgeService>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = dispatch_line(&service, &line).await;
                let mut out = serde_json::to_string(&reply).unwrap_or_else(|e| {
                    // a reply that cannot serialize is a programming error;
                    // still answer the client
                    format!(
                        r#"{{"CorrelationId":"{}","IsError":true,"ErrorMessage":"reply serialization: {e}","Message":{{}}}}"#,
                        reply.correlation_id
                    )
                });
                out.push('\n');
                writer.write_all(out.as_bytes()).await?;
            }
        }
    }
    Ok(())
}

/// Decode one request line and dispatch it. Undecodable requests still get
/// a correlated error reply when a messageId can be salvaged.
pub async fn dispatch_line(service: &BridgeService, line: &str) -> Reply {
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => service.handle(envelope).await,
        Err(e) => {
            let corr = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v.get("messageId")?.as_str().map(str::to_string))
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            warn!(error = %e, "request decode failed");
            Reply::err(&corr, format!("invalid request: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_envelope_field_names() {
        let reply = Reply::ok("abc", serde_json::json!({"x": 1}));
        let text = serde_json::to_string(&reply).expect("serialize");
        assert!(text.contains("\"CorrelationId\":\"abc\""));
        assert!(text.contains("\"IsError\":false"));
        assert!(text.contains("\"ErrorMessage\":\"\""));
        assert!(text.contains("\"Message\":{\"x\":1}"));
    }

    #[test]
    fn envelope_accepts_minimal_request() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"messageId":"m1","command":"GET_READY_STATUS"}"#)
                .expect("parse");
        assert_eq!(envelope.message_id.as_deref(), Some("m1"));
        assert_eq!(envelope.command.as_deref(), Some("GET_READY_STATUS"));
        assert!(envelope.payload.is_null());
    }
}
