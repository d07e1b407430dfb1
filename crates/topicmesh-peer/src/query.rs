use std::net::SocketAddr;
use std::time::Duration;

use topicmesh_frame::{Envelope, FrameConfig, PeerSummary, TopicSummary};
use topicmesh_transport::RetryPolicy;
use tracing::warn;

use crate::connection::Connection;
use crate::error::{PeerError, Result};

/// Read-only inspection client for the registry.
///
/// Does not register; it only asks for the current peer and topic tables.
#[derive(Debug)]
pub struct RegistryClient {
    conn: Connection,
    timeout: Duration,
}

impl RegistryClient {
    pub async fn connect(addr: SocketAddr, policy: RetryPolicy, timeout: Duration) -> Result<Self> {
        let conn = Connection::open(addr, policy, FrameConfig::default(), None).await?;
        Ok(Self { conn, timeout })
    }

    pub async fn list_peers(&mut self) -> Result<Vec<PeerSummary>> {
        match self.query(Envelope::ListPeers).await? {
            Envelope::PeerList { peers } => Ok(peers),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn list_topics(&mut self) -> Result<Vec<TopicSummary>> {
        match self.query(Envelope::ListTopics).await? {
            Envelope::TopicList { topics } => Ok(topics),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close(mut self) {
        self.conn.close().await;
    }

    /// A late reply would answer the next query, so a timeout closes the
    /// connection.
    async fn query(&mut self, request: Envelope) -> Result<Envelope> {
        self.conn.send(request).await?;
        match tokio::time::timeout(self.timeout, self.conn.recv()).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(addr = %self.conn.remote_addr(), timeout = ?self.timeout, "registry query timed out");
                self.conn.close().await;
                Err(PeerError::QueryTimeout(self.timeout))
            }
        }
    }
}

fn unexpected(envelope: &Envelope) -> PeerError {
    PeerError::MalformedEnvelope(format!("unexpected reply {}", envelope.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use topicmesh_frame::EnvelopeReader;

    #[tokio::test]
    async fn unanswered_query_times_out_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = EnvelopeReader::new(stream);
            let request = reader.recv().await.unwrap();
            // Hold the connection open without answering.
            tokio::time::sleep(Duration::from_millis(500)).await;
            request
        });

        let mut client =
            RegistryClient::connect(addr, RetryPolicy::none(), Duration::from_millis(50))
                .await
                .unwrap();
        let err = client.list_peers().await.unwrap_err();
        assert!(matches!(err, PeerError::QueryTimeout(_)));

        let err = client.list_topics().await.unwrap_err();
        assert!(matches!(err, PeerError::Closed));
        assert_eq!(server.await.unwrap(), Envelope::ListPeers);
    }
}
