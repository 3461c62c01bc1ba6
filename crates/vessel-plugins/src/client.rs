//! HTTP client for the plugin wire protocol.
//!
//! Every call opens a fresh connection to the plugin endpoint, performs a
//! single `POST /<Service>.<Method>` exchange with JSON request and response
//! bodies, and closes the connection once the response has been collected.

use crate::error::{PluginError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;
use vessel_error::CommonError;

/// Mime type the plugin protocol speaks.
pub const VERSION_MIME_TYPE: &str = "application/vnd.docker.plugins.v1+json";

/// Connect timeout for plugin endpoints.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Parsed plugin endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginAddr {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// TCP `host:port` endpoint.
    Tcp(String),
}

impl PluginAddr {
    /// Parses an address of the form `<scheme>://<endpoint>`.
    ///
    /// # Errors
    ///
    /// `UnknownProtocol` when the scheme is missing or not `unix`/`tcp`.
    pub fn parse(addr: &str) -> Result<Self> {
        let (scheme, rest) = addr
            .split_once("://")
            .ok_or_else(|| PluginError::UnknownProtocol(addr.to_string()))?;
        match scheme {
            "unix" => Ok(Self::Unix(PathBuf::from(rest))),
            "tcp" => Ok(Self::Tcp(rest.to_string())),
            _ => Err(PluginError::UnknownProtocol(addr.to_string())),
        }
    }
}

impl fmt::Display for PluginAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(endpoint) => write!(f, "tcp://{endpoint}"),
        }
    }
}

enum PluginStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for PluginStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PluginStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Client for one plugin endpoint.
#[derive(Debug, Clone)]
pub struct PluginClient {
    addr: PluginAddr,
}

impl PluginClient {
    /// Creates a client for the given address string.
    ///
    /// # Errors
    ///
    /// `UnknownProtocol` when the address cannot be parsed.
    pub fn new(addr: &str) -> Result<Self> {
        Ok(Self {
            addr: PluginAddr::parse(addr)?,
        })
    }

    /// Returns the endpoint address.
    #[must_use]
    pub const fn addr(&self) -> &PluginAddr {
        &self.addr
    }

    /// Performs one RPC, serializing `args` and decoding the JSON response.
    ///
    /// # Errors
    ///
    /// Transport failures, a response status >= 400, or an undecodable body.
    pub async fn call<Req, Res>(&self, method: &str, args: &Req) -> Result<Res>
    where
        Req: Serialize + Sync + ?Sized,
        Res: DeserializeOwned,
    {
        let body = serde_json::to_vec(args)?;
        let bytes = self.post(method, Bytes::from(body)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Performs one RPC with an empty request body.
    ///
    /// # Errors
    ///
    /// Transport failures, a response status >= 400, or an undecodable body.
    pub async fn call_empty<Res>(&self, method: &str) -> Result<Res>
    where
        Res: DeserializeOwned,
    {
        let bytes = self.post(method, Bytes::new()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn dial(&self) -> Result<PluginStream> {
        let connect = async {
            match &self.addr {
                PluginAddr::Unix(path) => {
                    UnixStream::connect(path).await.map(PluginStream::Unix)
                }
                PluginAddr::Tcp(endpoint) => {
                    TcpStream::connect(endpoint.as_str()).await.map(PluginStream::Tcp)
                }
            }
        };
        tokio::time::timeout(DIAL_TIMEOUT, connect)
            .await
            .map_err(|_| CommonError::timeout(format!("dialing plugin at {}", self.addr)))?
            .map_err(PluginError::from)
    }

    async fn post(&self, method: &str, body: Bytes) -> Result<Bytes> {
        let stream = self.dial().await?;
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| PluginError::Http(format!("handshake with {} failed: {e}", self.addr)))?;

        // The connection task ends once the response body has been collected.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("plugin connection ended: {e}");
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/{method}"))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, VERSION_MIME_TYPE)
            .header(HOST, "localhost")
            .body(Full::new(body))
            .map_err(|e| PluginError::Http(format!("failed to build request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| PluginError::Http(format!("request to /{method} failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PluginError::Http(format!("reading response from /{method} failed: {e}")))?
            .to_bytes();

        if status.as_u16() >= 400 {
            return Err(PluginError::Remote {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }
}
