//! Per-connection handler.
//!
//! Each accepted stream gets one task running [`serve_connection`]. It turns
//! inbound frames into [`ActorEvent::Request`]s and writes whatever the actor
//! queues on the connection's outbound channel, replies and pushed events
//! alike.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{decode_request, encode_response, read_frame, write_frame, CodecError};
use crate::error::RelayError;
use crate::protocol::Response;
use crate::server::{ActorEvent, ConnectionId};

/// Serve one client stream until either side goes away.
pub async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    id: ConnectionId,
    actor: mpsc::Sender<ActorEvent>,
    outbound_queue: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Response>(outbound_queue);
    actor
        .send(ActorEvent::Opened {
            id,
            addr,
            outbound: outbound_tx,
        })
        .await
        .context("server actor stopped")?;

    // read_frame is not cancel safe, so frames are pulled on their own task.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Result<Vec<u8>, CodecError>>(16);
    let read_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader).await;
            let failed = frame.is_err();
            if frame_tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(response) = outbound else {
                    debug!(conn = id, "Actor dropped connection");
                    break;
                };
                if let Err(e) = send_response(&mut writer, &response).await {
                    warn!(conn = id, %addr, "Failed to send response: {}", e);
                    break;
                }
            }

            frame = frame_rx.recv() => {
                match frame {
                    Some(Ok(bytes)) => match decode_request(&bytes) {
                        Ok(request) => {
                            let event = ActorEvent::Request { id, request };
                            if actor.send(event).await.is_err() {
                                warn!(conn = id, "Server actor stopped");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(conn = id, %addr, "Invalid request: {}", e);
                            let response = malformed_reply(&bytes, &e);
                            if let Err(e) = send_response(&mut writer, &response).await {
                                warn!(conn = id, "Failed to send response: {}", e);
                                break;
                            }
                        }
                    },
                    Some(Err(e)) if e.is_eof() => {
                        debug!(conn = id, %addr, "Connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn = id, %addr, "Read error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    read_task.abort();
    let _ = actor.send(ActorEvent::Closed { id }).await;
    info!(conn = id, %addr, "Connection handler finished");

    Ok(())
}

async fn send_response<S>(writer: &mut WriteHalf<S>, response: &Response) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite,
{
    let bytes = encode_response(response)?;
    write_frame(writer, &bytes).await
}

/// Error reply for a frame that did not decode; echoes the sequence when
/// one can still be found so the sender's waiter is released.
fn malformed_reply(bytes: &[u8], err: &CodecError) -> Response {
    let sequence = serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("sequence")?.as_str().map(str::to_string))
        .unwrap_or_default();
    Response {
        sequence,
        error: RelayError::InvalidParameters(format!("malformed request: {}", err)).to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_response, encode_request};
    use crate::protocol::{Action, Request};
    use tokio::io::AsyncWriteExt;

    fn test_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 45000))
    }

    #[tokio::test]
    async fn test_frames_flow_through_actor_channel() {
        let (client, server) = tokio::io::duplex(4096);
        let (actor_tx, mut actor_rx) = mpsc::channel(8);
        let task = tokio::spawn(serve_connection(server, test_addr(), 7, actor_tx, 8));

        let outbound = match actor_rx.recv().await.unwrap() {
            ActorEvent::Opened { id, outbound, .. } => {
                assert_eq!(id, 7);
                outbound
            }
            other => panic!("unexpected event {:?}", other),
        };

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let mut req = Request::new(Action::Services);
        req.sequence = "abc".to_string();
        write_frame(&mut client_wr, &encode_request(&req).unwrap())
            .await
            .unwrap();

        match actor_rx.recv().await.unwrap() {
            ActorEvent::Request { id, request } => {
                assert_eq!(id, 7);
                assert_eq!(request, req);
            }
            other => panic!("unexpected event {:?}", other),
        }

        outbound.send(Response::reply("abc")).await.unwrap();
        let frame = read_frame(&mut client_rd).await.unwrap();
        assert_eq!(decode_response(&frame).unwrap().sequence, "abc");

        client_wr.shutdown().await.unwrap();
        drop(client_wr);
        drop(client_rd);
        match actor_rx.recv().await.unwrap() {
            ActorEvent::Closed { id } => assert_eq!(id, 7),
            other => panic!("unexpected event {:?}", other),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_reply() {
        let (client, server) = tokio::io::duplex(4096);
        let (actor_tx, mut actor_rx) = mpsc::channel(8);
        let _task = tokio::spawn(serve_connection(server, test_addr(), 1, actor_tx, 8));
        let _outbound = actor_rx.recv().await.unwrap();

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        write_frame(&mut client_wr, br#"{"sequence":"s1","action":42}"#)
            .await
            .unwrap();

        let frame = read_frame(&mut client_rd).await.unwrap();
        let resp = decode_response(&frame).unwrap();
        assert_eq!(resp.sequence, "s1");
        assert!(resp.error.starts_with("invalid parameters"));

        // The connection survives a bad frame.
        let req = Request::new(Action::Logout);
        write_frame(&mut client_wr, &encode_request(&req).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            actor_rx.recv().await.unwrap(),
            ActorEvent::Request { .. }
        ));
    }

    #[test]
    fn test_malformed_reply_without_sequence() {
        let err = decode_request(b"garbage").unwrap_err();
        let resp = malformed_reply(b"garbage", &err);
        assert!(resp.sequence.is_empty());
        assert!(!resp.is_ok());
    }
}
