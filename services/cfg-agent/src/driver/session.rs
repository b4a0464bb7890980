//! Management sessions to hosting devices.
//!
//! Devices are configured over NETCONF 1.0 framing (`]]>]]>` delimited XML
//! messages). A session is opened with a hello exchange and then carries one
//! RPC at a time; every RPC is bounded by the push timeout.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::DriverError;

/// End-of-message marker of NETCONF 1.0 framing.
pub const MESSAGE_DELIMITER: &str = "]]>]]>";

const NETCONF_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

const CLIENT_HELLO: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\
<capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities>\
</hello>";

/// An open management session on one device.
#[async_trait]
pub trait ManagementSession: Send {
    /// Push a configuration fragment to the running datastore. Returns the raw reply.
    async fn edit_config(&mut self, config: &str) -> Result<String, DriverError>;

    /// Fetch the running configuration as CLI text.
    async fn running_config(&mut self) -> Result<String, DriverError>;

    /// Issue a `<get>` with the given filter. Used for exec commands.
    async fn get(&mut self, filter: &str) -> Result<String, DriverError>;

    /// Take the running datastore lock. Returns the raw reply.
    async fn lock(&mut self) -> Result<String, DriverError>;

    /// Release the running datastore lock. Returns the raw reply.
    async fn unlock(&mut self) -> Result<String, DriverError>;
}

/// Where and how to reach a device's management endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTarget {
    pub address: SocketAddr,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
}

/// Opens management sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &SessionTarget)
        -> Result<Box<dyn ManagementSession>, DriverError>;
}

/// Connects NETCONF sessions over plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl SessionConnector for TcpConnector {
    async fn connect(
        &self,
        target: &SessionTarget,
    ) -> Result<Box<dyn ManagementSession>, DriverError> {
        let address = target.address.to_string();
        debug!(address = %address, "Connecting management session");

        let stream = tokio::time::timeout(target.connect_timeout, TcpStream::connect(target.address))
            .await
            .map_err(|_| DriverError::Connect {
                address: address.clone(),
                reason: format!("timed out after {:?}", target.connect_timeout),
            })?
            .map_err(|e| DriverError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        let session = tokio::time::timeout(
            target.connect_timeout,
            NetconfSession::establish(stream, target.rpc_timeout),
        )
        .await
        .map_err(|_| DriverError::Connect {
            address: address.clone(),
            reason: "hello exchange timed out".to_string(),
        })??;

        info!(address = %address, "Management session established");
        Ok(Box::new(session))
    }
}

/// NETCONF 1.0 session over any byte stream.
pub struct NetconfSession<S> {
    stream: S,
    buffer: Vec<u8>,
    message_id: u64,
    rpc_timeout: Duration,
}

impl<S> NetconfSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Exchange hellos and return a session ready for RPCs.
    pub async fn establish(stream: S, rpc_timeout: Duration) -> Result<Self, DriverError> {
        let mut session = Self {
            stream,
            buffer: Vec::new(),
            message_id: 0,
            rpc_timeout,
        };

        session.write_message(CLIENT_HELLO).await?;
        let hello = session.read_message().await?;
        if !hello.contains("<hello") {
            return Err(DriverError::Protocol(
                "device did not answer with a hello".to_string(),
            ));
        }

        Ok(session)
    }

    async fn write_message(&mut self, body: &str) -> Result<(), DriverError> {
        self.stream.write_all(body.as_bytes()).await?;
        self.stream.write_all(MESSAGE_DELIMITER.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<String, DriverError> {
        let delimiter = MESSAGE_DELIMITER.as_bytes();
        let mut chunk = [0u8; 4096];

        loop {
            if let Some(end) = find_subslice(&self.buffer, delimiter) {
                let message: Vec<u8> = self.buffer.drain(..end + delimiter.len()).collect();
                let body = &message[..end];
                return String::from_utf8(body.to_vec())
                    .map_err(|_| DriverError::Protocol("reply is not valid UTF-8".to_string()));
            }

            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(DriverError::Protocol(
                    "session closed by device".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    async fn rpc(&mut self, operation: &'static str, body: &str) -> Result<String, DriverError> {
        self.message_id += 1;
        let request = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <rpc message-id=\"{}\" xmlns=\"{}\">{}</rpc>",
            self.message_id, NETCONF_NS, body
        );

        let timeout = self.rpc_timeout;
        let reply = tokio::time::timeout(timeout, async {
            self.write_message(&request).await?;
            self.read_message().await
        })
        .await
        .map_err(|_| DriverError::Timeout { operation, timeout })??;

        if !reply.contains("<rpc-reply") {
            return Err(DriverError::Protocol(format!(
                "{} answered without rpc-reply",
                operation
            )));
        }

        Ok(reply)
    }
}

#[async_trait]
impl<S> ManagementSession for NetconfSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn edit_config(&mut self, config: &str) -> Result<String, DriverError> {
        let body = format!(
            "<edit-config><target><running/></target>{}</edit-config>",
            config
        );
        self.rpc("edit-config", &body).await
    }

    async fn running_config(&mut self) -> Result<String, DriverError> {
        let reply = self
            .rpc(
                "get-config",
                "<get-config><source><running/></source></get-config>",
            )
            .await?;

        extract_element(&reply, "cli-config-data-block")
            .map(|text| xml_unescape(&text))
            .ok_or_else(|| {
                DriverError::Protocol("get-config reply has no cli-config-data-block".to_string())
            })
    }

    async fn get(&mut self, filter: &str) -> Result<String, DriverError> {
        self.rpc("get", &format!("<get>{}</get>", filter)).await
    }

    async fn lock(&mut self) -> Result<String, DriverError> {
        self.rpc("lock", "<lock><target><running/></target></lock>")
            .await
    }

    async fn unlock(&mut self) -> Result<String, DriverError> {
        self.rpc("unlock", "<unlock><target><running/></target></unlock>")
            .await
    }
}

/// Verify the `<ok/>` success marker of a reply.
pub fn check_reply(snippet: &'static str, reply: &str) -> Result<(), DriverError> {
    if reply.contains("<ok/>") || reply.contains("<ok />") {
        return Ok(());
    }

    Err(DriverError::PushFailed {
        snippet,
        error_type: extract_element(reply, "error-type").unwrap_or_else(|| "unknown".to_string()),
        error_tag: extract_element(reply, "error-tag").unwrap_or_else(|| "unknown".to_string()),
    })
}

/// Text content of the first `<tag>` element, ignoring attributes.
pub fn extract_element(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let mut search_from = 0;

    while let Some(offset) = xml[search_from..].find(&open) {
        let start = search_from + offset;
        let after_name = start + open.len();
        let rest = &xml[after_name..];

        // Skip longer names sharing the prefix, e.g. <error-type-x>.
        match rest.chars().next() {
            Some('>') | Some(' ') | Some('/') => {}
            _ => {
                search_from = after_name;
                continue;
            }
        }

        let tag_end = after_name + rest.find('>')?;
        if xml[..tag_end].ends_with('/') {
            return Some(String::new());
        }

        let content_start = tag_end + 1;
        let close = format!("</{}>", tag);
        let content_end = content_start + xml[content_start..].find(&close)?;
        return Some(xml[content_start..content_end].trim().to_string());
    }

    None
}

pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

pub fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
