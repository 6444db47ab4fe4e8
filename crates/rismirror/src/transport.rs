//! Newline-delimited JSON RIB feed over TCP.
//!
//! The client sends one [`ObserveRequest`] as a JSON line, then reads one
//! message per line until the peer closes:
//!
//! ```text
//! {"type":"add","prefix":"10.0.0.0/8","attributes":{"next_hop":"192.0.2.1"}}
//! {"type":"withdraw","prefix":"10.0.0.0/8"}
//! {"type":"end_of_sync"}
//! ```

use crate::error::FeedError;
use crate::feed::{FeedEvent, FeedSource, FeedStream, ObserveRequest, RibSubscriber};
use async_trait::async_trait;
use futures::StreamExt;
use ris_types::{IpPrefix, RouteAttributes, RouteKey};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::debug;

/// Bound on one feed message, so a broken peer cannot grow the buffer
const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Add {
        prefix: IpPrefix,
        #[serde(default)]
        path_id: u32,
        attributes: RouteAttributes,
    },
    Withdraw {
        prefix: IpPrefix,
        #[serde(default)]
        path_id: u32,
    },
    EndOfSync,
}

impl From<WireMessage> for FeedEvent {
    fn from(message: WireMessage) -> Self {
        match message {
            WireMessage::Add {
                prefix,
                path_id,
                attributes,
            } => FeedEvent::Add {
                key: RouteKey::with_path_id(prefix, path_id),
                attributes,
            },
            WireMessage::Withdraw { prefix, path_id } => FeedEvent::Withdraw {
                key: RouteKey::with_path_id(prefix, path_id),
            },
            WireMessage::EndOfSync => FeedEvent::EndOfSync,
        }
    }
}

fn decode_line(line: Result<String, LinesCodecError>) -> Option<Result<FeedEvent, FeedError>> {
    let line = match line {
        Ok(line) => line,
        Err(LinesCodecError::Io(e)) => return Some(Err(FeedError::Io(e))),
        Err(LinesCodecError::MaxLineLengthExceeded) => {
            return Some(Err(FeedError::Malformed(format!(
                "line exceeds {MAX_LINE_LENGTH} bytes"
            ))));
        }
    };

    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    Some(
        serde_json::from_str::<WireMessage>(line)
            .map(FeedEvent::from)
            .map_err(|e| FeedError::Malformed(e.to_string())),
    )
}

/// [`RibSubscriber`] speaking the JSON-lines protocol to one endpoint.
#[derive(Debug, Clone)]
pub struct JsonLinesSubscriber {
    endpoint: String,
}

impl JsonLinesSubscriber {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// A [`FeedSource`] named after the endpoint.
    pub fn source(endpoint: &str) -> FeedSource {
        FeedSource::new(endpoint, Arc::new(Self::new(endpoint)))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RibSubscriber for JsonLinesSubscriber {
    async fn observe(&self, request: ObserveRequest) -> Result<FeedStream, FeedError> {
        let mut stream =
            TcpStream::connect(&self.endpoint)
                .await
                .map_err(|e| FeedError::Connect {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                })?;
        stream.set_nodelay(true)?;

        let mut line =
            serde_json::to_vec(&request).map_err(|e| FeedError::Malformed(e.to_string()))?;
        line.push(b'\n');
        stream.write_all(&line).await?;

        debug!(
            endpoint = %self.endpoint,
            afi = %request.afi,
            vrf_id = request.vrf_id,
            "Subscribed to feed"
        );

        let lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        Ok(lines
            .filter_map(|line| futures::future::ready(decode_line(line)))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ris_types::AddressFamily;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn decode(line: &str) -> Option<Result<FeedEvent, FeedError>> {
        decode_line(Ok(line.to_string()))
    }

    #[test]
    fn test_decode_add_with_path_id() {
        let event = decode(
            r#"{"type":"add","prefix":"10.0.0.0/8","path_id":3,"attributes":{"next_hop":"192.0.2.1"}}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            event,
            FeedEvent::Add {
                key: RouteKey::with_path_id("10.0.0.0/8".parse().unwrap(), 3),
                attributes: RouteAttributes::with_next_hop("192.0.2.1".parse().unwrap()),
            }
        );
    }

    #[test]
    fn test_decode_withdraw_and_end_of_sync() {
        assert_eq!(
            decode(r#"{"type":"withdraw","prefix":"2001:db8::/32"}"#)
                .unwrap()
                .unwrap(),
            FeedEvent::Withdraw {
                key: RouteKey::new("2001:db8::/32".parse().unwrap())
            }
        );
        assert_eq!(
            decode(r#"{"type":"end_of_sync"}"#).unwrap().unwrap(),
            FeedEvent::EndOfSync
        );
    }

    #[test]
    fn test_decode_skips_blank_lines() {
        assert!(decode("   ").is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(r#"{"type":"teleport"}"#),
            Some(Err(FeedError::Malformed(_)))
        ));
        assert!(matches!(
            decode(r#"{"type":"add","prefix":"10.0.0.0/33","attributes":{"next_hop":"192.0.2.1"}}"#),
            Some(Err(FeedError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn test_observe_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut request = String::new();
            reader.read_line(&mut request).await.unwrap();

            let mut socket = reader.into_inner();
            socket
                .write_all(
                    b"{\"type\":\"add\",\"prefix\":\"10.0.0.0/8\",\"attributes\":{\"next_hop\":\"192.0.2.1\"}}\n\
                      {\"type\":\"end_of_sync\"}\n",
                )
                .await
                .unwrap();
            request
        });

        let subscriber = JsonLinesSubscriber::new(endpoint);
        let request = ObserveRequest {
            router: "core01".to_string(),
            address: "192.0.2.254".parse().unwrap(),
            vrf_id: 0,
            afi: AddressFamily::Ipv4Unicast,
            allow_unready_rib: true,
        };
        let events: Vec<_> = subscriber
            .observe(request.clone())
            .await
            .unwrap()
            .collect()
            .await;

        let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent, serde_json::to_value(&request).unwrap());

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(FeedEvent::Add { .. })));
        assert!(matches!(events[1], Ok(FeedEvent::EndOfSync)));
    }

    #[tokio::test]
    async fn test_observe_unreachable_endpoint() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = JsonLinesSubscriber::new(endpoint)
            .observe(ObserveRequest {
                router: "core01".to_string(),
                address: "192.0.2.254".parse().unwrap(),
                vrf_id: 0,
                afi: AddressFamily::Ipv4Unicast,
                allow_unready_rib: false,
            })
            .await;
        assert!(matches!(result, Err(FeedError::Connect { .. })));
    }
}
