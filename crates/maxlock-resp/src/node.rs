use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use maxlock_common::{NodeError, NodeId};
use maxlock_dsync::Node;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    codec::{RespValue, encode_command, parse_reply},
    endpoint::Endpoint,
    errors::{RespError, Result},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const QUIT_TIMEOUT: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 4096;

struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    async fn request<I, T>(&mut self, parts: I) -> Result<RespValue>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
        T: AsRef<[u8]>,
    {
        let mut out = BytesMut::new();
        encode_command(parts, &mut out);
        self.stream.write_all(&out).await?;

        loop {
            if let Some((value, consumed)) = parse_reply(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(value);
            }
            self.buffer.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(RespError::ConnectionReset);
            }
        }
    }

    async fn expect_ok<I, T>(&mut self, parts: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
        T: AsRef<[u8]>,
    {
        match self.request(parts).await? {
            RespValue::SimpleString(_) => Ok(()),
            RespValue::Error { kind, message } => Err(RespError::Server { kind, message }),
            other => Err(RespError::Protocol(format!(
                "expected status reply, got {}",
                other.describe()
            ))),
        }
    }
}

/// [`Node`] backed by a single RESP connection.
///
/// The connection is opened on first use and re-opened after any transport
/// failure. Calls on one node are serialized over that connection.
pub struct RespNode {
    id: NodeId,
    endpoint: Endpoint,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    closed: watch::Sender<bool>,
}

impl RespNode {
    pub fn new(endpoint: Endpoint) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: endpoint.node_id(),
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection: Mutex::new(None),
            closed,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn connect(&self) -> Result<Connection> {
        let addr = self.endpoint.addr();
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RespError::ConnectTimeout { addr: addr.clone() })??;
        stream.set_nodelay(true)?;

        let mut connection = Connection {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
        };
        if let Some(password) = &self.endpoint.password {
            match &self.endpoint.username {
                Some(username) => {
                    connection
                        .expect_ok(["AUTH", username.as_str(), password.as_str()])
                        .await?
                }
                None => connection.expect_ok(["AUTH", password.as_str()]).await?,
            }
        }
        if self.endpoint.db != 0 {
            let db = self.endpoint.db.to_string();
            connection.expect_ok(["SELECT", db.as_str()]).await?;
        }

        debug!(node = %self.id, "connected");
        Ok(connection)
    }

    async fn call(&self, parts: Vec<&str>) -> std::result::Result<RespValue, NodeError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(NodeError::Closed);
        }

        tokio::select! {
            result = self.call_connected(parts) => result.map_err(NodeError::from),
            _ = closed.wait_for(|closed| *closed) => Err(NodeError::Closed),
        }
    }

    async fn call_connected(&self, parts: Vec<&str>) -> Result<RespValue> {
        let mut guard = self.connection.lock().await;
        let mut connection = match guard.take() {
            Some(connection) => connection,
            None => self.connect().await?,
        };

        let value = connection.request(parts).await?;
        *guard = Some(connection);
        Ok(value)
    }

    async fn eval_command(
        &self,
        command: &str,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<i64, NodeError> {
        let key_count = keys.len().to_string();
        let mut parts = Vec::with_capacity(3 + keys.len() + args.len());
        parts.push(command);
        parts.push(script);
        parts.push(key_count.as_str());
        parts.extend(keys.iter().map(String::as_str));
        parts.extend(args.iter().map(String::as_str));

        match self.call(parts).await? {
            RespValue::Integer(count) => Ok(count),
            RespValue::Error { kind, message } => Err(RespError::Server { kind, message }.into()),
            other => Err(NodeError::Protocol(format!(
                "expected integer reply, got {}",
                other.describe()
            ))),
        }
    }
}

#[async_trait]
impl Node for RespNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<i64, NodeError> {
        self.eval_command("EVALSHA", sha, keys, args).await
    }

    async fn eval(
        &self,
        body: &str,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<i64, NodeError> {
        self.eval_command("EVAL", body, keys, args).await
    }

    async fn close(&self) -> std::result::Result<(), NodeError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        let connection = self.connection.lock().await.take();
        if let Some(mut connection) = connection {
            match timeout(QUIT_TIMEOUT, connection.request(["QUIT"])).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(node = %self.id, error = %err, "quit failed"),
                Err(_) => warn!(node = %self.id, "quit timed out"),
            }
        }
        Ok(())
    }
}
