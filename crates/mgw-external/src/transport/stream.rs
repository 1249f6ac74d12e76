//! Stream channel
//!
//! Connects to the fleet server over TCP, optionally wrapped in TLS, and
//! exchanges JSON messages in u32 length-delimited frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mgw_core::{ExternalClientMessage, ExternalServerMessage};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info};

use super::{ExternalChannel, TransportError};
use crate::config::{StreamConfig, TlsConfig};

trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

type BoxedIo = Box<dyn StreamIo>;
type Reader = FramedRead<ReadHalf<BoxedIo>, LengthDelimitedCodec>;
type Writer = FramedWrite<WriteHalf<BoxedIo>, LengthDelimitedCodec>;

/// Stream channel over TCP or TLS
pub struct StreamChannel {
    config: StreamConfig,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
}

impl StreamChannel {
    pub fn new(config: &StreamConfig) -> Result<Self, TransportError> {
        let tls = match &config.tls {
            Some(tls) => Some(build_tls(tls, &config.host)?),
            None => None,
        };

        Ok(Self {
            config: config.clone(),
            tls,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        })
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

fn build_tls(
    tls: &TlsConfig,
    host: &str,
) -> Result<(TlsConnector, ServerName<'static>), TransportError> {
    let pem = std::fs::read(&tls.ca_file).map_err(|e| {
        TransportError::InvalidConfig(format!("{}: {}", tls.ca_file.display(), e))
    })?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert =
            cert.map_err(|e| TransportError::InvalidConfig(format!("CA certificate: {}", e)))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::InvalidConfig(format!("CA certificate: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(TransportError::InvalidConfig(format!(
            "No certificates found in {}",
            tls.ca_file.display()
        )));
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = tls.server_name.clone().unwrap_or_else(|| host.to_string());
    let server_name = ServerName::try_from(name.clone())
        .map_err(|e| TransportError::InvalidConfig(format!("Server name '{}': {}", name, e)))?;

    Ok((TlsConnector::from(Arc::new(client_config)), server_name))
}

#[async_trait]
impl ExternalChannel for StreamChannel {
    async fn open(&self) -> Result<(), TransportError> {
        let addr = self.address();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        info!(%addr, tls = self.tls.is_some(), "Connecting to fleet server");

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout("Connection timeout".into()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(%e, "Failed to set TCP_NODELAY");
        }

        let io: BoxedIo = match &self.tls {
            Some((connector, server_name)) => {
                let stream = tokio::time::timeout(timeout, connector.connect(server_name.clone(), tcp))
                    .await
                    .map_err(|_| TransportError::Timeout("TLS handshake timeout".into()))?
                    .map_err(|e| TransportError::ConnectionFailed(format!("TLS: {}", e)))?;
                Box::new(stream)
            }
            None => Box::new(tcp),
        };

        let (read, write) = tokio::io::split(io);
        *self.reader.lock().await = Some(FramedRead::new(read, LengthDelimitedCodec::new()));
        *self.writer.lock().await = Some(FramedWrite::new(write, LengthDelimitedCodec::new()));
        Ok(())
    }

    async fn send(&self, message: &ExternalClientMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        writer
            .send(Bytes::from(payload))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(
        &self,
        timeout: Duration,
    ) -> Result<Option<ExternalServerMessage>, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        match tokio::time::timeout(timeout, reader.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Ok(Some(Err(e))) => Err(TransportError::ReceiveFailed(e.to_string())),
            Ok(Some(Ok(frame))) => Ok(Some(serde_json::from_slice(&frame)?)),
        }
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = SinkExt::<Bytes>::close(&mut writer).await {
                debug!(%e, "Error while closing stream");
            }
        }
        self.reader.lock().await.take();
    }

    fn describe(&self) -> String {
        let scheme = if self.tls.is_some() { "tls" } else { "tcp" };
        format!("{}://{}", scheme, self.address())
    }
}
