use std::{error::Error, fmt, net::SocketAddr, sync::Arc, time::Duration};

use futures::{FutureExt, SinkExt, StreamExt};
use quick_cache::sync::Cache;
use sled::Db;
use tokio::{
    fs::File,
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::codec::Framed;

use crate::shared::{
    config::{ServerConfig, CACHE_SIZE},
    crypto::{deserialize_private_key_from_pem, deserialize_pubkey, Hash, PrivateKey, PublicKey},
    request::{FailReason, InitRequest, Request, Response, ServerCodec},
};

use self::{
    chain::CapsuleRegistry, manager::process_manager, reader::process_reader,
    storage::MetaStorage, subscriber::process_subscriber, writer::process_writer,
};

pub mod chain;
mod manager;
mod reader;
pub mod storage;
mod subscriber;
mod writer;

#[derive(Debug)]
pub enum DCServerError {
    NotFound(String),
    SequenceConflict { tip: u64 },
    SignatureInvalid,
    PayloadHashMismatch,
    BadRequest(String),
    OpenSSL(openssl::error::ErrorStack),
    IO(std::io::Error),
    Storage(sled::Error),
    Encoding(postcard::Error),
    Other(String),
}

impl DCServerError {
    /// What the client gets told. Internal details stay in the server log.
    pub fn fail_reason(&self) -> FailReason {
        match self {
            Self::NotFound(_) => FailReason::NotFound,
            Self::SequenceConflict { tip } => FailReason::SequenceConflict { tip: *tip },
            Self::SignatureInvalid => FailReason::SignatureInvalid,
            Self::PayloadHashMismatch => FailReason::PayloadHashMismatch,
            Self::BadRequest(_) => FailReason::BadRequest,
            _ => FailReason::Internal,
        }
    }
}

impl fmt::Display for DCServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(s) => write!(f, "not found: {}", s),
            Self::SequenceConflict { tip } => write!(f, "sequence conflict, tip is {}", tip),
            Self::SignatureInvalid => write!(f, "invalid signature"),
            Self::PayloadHashMismatch => write!(f, "payload does not match its hash"),
            Self::BadRequest(s) => write!(f, "bad request: {}", s),
            Self::OpenSSL(e) => write!(f, "openssl: {}", e),
            Self::IO(e) => write!(f, "io: {}", e),
            Self::Storage(e) => write!(f, "storage: {}", e),
            Self::Encoding(e) => write!(f, "encoding: {}", e),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

impl Error for DCServerError {}

impl From<std::io::Error> for DCServerError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<openssl::error::ErrorStack> for DCServerError {
    fn from(value: openssl::error::ErrorStack) -> Self {
        Self::OpenSSL(value)
    }
}

impl From<sled::Error> for DCServerError {
    fn from(value: sled::Error) -> Self {
        Self::Storage(value)
    }
}

impl From<postcard::Error> for DCServerError {
    fn from(value: postcard::Error) -> Self {
        Self::Encoding(value)
    }
}

/// State shared by every connection the server accepts.
#[derive(Clone)]
pub struct ServerContext {
    pub signing_key: PrivateKey,
    pub db: Db,
    pub registry: CapsuleRegistry,
    writer_keys: Arc<Cache<Hash, PublicKey>>,
    pub wait_timeout: Duration,
}

impl ServerContext {
    pub fn new(signing_key: PrivateKey, db: Db, wait_timeout: Duration) -> Self {
        Self {
            signing_key,
            db,
            registry: CapsuleRegistry::new(),
            writer_keys: Arc::new(Cache::new(CACHE_SIZE)),
            wait_timeout,
        }
    }

    /// Writer key of a capsule, from the cache or its stored metadata.
    pub fn writer_key(&self, dc_name: &Hash) -> Result<PublicKey, DCServerError> {
        if let Some(k) = self.writer_keys.get(dc_name) {
            return Ok(k);
        }
        let meta = MetaStorage::new(&self.db)?
            .get(dc_name)?
            .ok_or_else(|| DCServerError::NotFound("datacapsule".into()))?;
        let key = deserialize_pubkey(&meta.writer_pub_key)?;
        self.writer_keys.insert(*dc_name, key.clone());
        Ok(key)
    }
}

pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    // Bind a TCP listener to the socket address.
    // Note that this is the Tokio TcpListener, which is fully async.
    let listener = TcpListener::bind(&config.addr).await?;
    let db = sled::open(&config.db_path)?;

    let mut pk_file = File::open(&config.key_path).await?;
    let mut pk = Vec::new();
    pk_file.read_to_end(&mut pk).await?;
    let pk = deserialize_private_key_from_pem(&pk)?;

    tracing::info!("server running on {}", config.addr);
    serve(listener, ServerContext::new(pk, db, config.wait_timeout())).await?;
    Ok(())
}

/// Accepts connections forever, one task per connection.
pub async fn serve(listener: TcpListener, ctx: ServerContext) -> Result<(), DCServerError> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tracing::debug!("accepted connection {}", addr);
            if let Err(e) = process(ctx, stream, addr).await {
                tracing::info!("an error occurred; error = {:?}", e);
            }
        });
    }
}

/// Process an individual client
async fn process(
    ctx: ServerContext,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), DCServerError> {
    let mut framed = Framed::new(stream, ServerCodec::new());

    let init_req = match framed.next().await {
        Some(Ok(Request::Init(i))) => i,
        r => {
            tracing::error!("Failed to init {}: {:?}", addr, r);
            return Ok(());
        }
    };

    let dc_name = match init_req {
        InitRequest::Manage => return process_manager(ctx, framed, addr).await,
        InitRequest::Read(dc) | InitRequest::Write(dc) | InitRequest::Subscribe(dc) => dc,
    };
    if !MetaStorage::new(&ctx.db)?.contains(&dc_name)? {
        tracing::warn!("{} asked for unknown datacapsule {:02x?}", addr, &dc_name[..4]);
        framed.send(Response::Failed(FailReason::NotFound)).await?;
        return Ok(());
    }

    match init_req {
        InitRequest::Read(_) => process_reader(ctx, dc_name, framed, addr).await,
        InitRequest::Write(_) => process_writer(ctx, dc_name, framed, addr).await,
        InitRequest::Subscribe(_) => process_subscriber(ctx, dc_name, framed, addr).await,
        InitRequest::Manage => Ok(()),
    }
}

// Waits for a request, flushing the previous request if it needs to wait
// Flushing does not happen if next request is already ready
async fn wait_for_request(stream: &mut Framed<TcpStream, ServerCodec>) -> Option<Request> {
    let req = match stream.next().now_or_never() {
        Some(r) => r,
        None => {
            if let Err(e) = stream.flush().await {
                tracing::error!("flushing error {:?}", e);
                return None;
            }
            stream.next().await
        }
    };
    log_request(req)
}

fn log_request(req: Option<Result<Request, std::io::Error>>) -> Option<Request> {
    match req {
        Some(Ok(r)) => Some(r),
        Some(Err(e)) => {
            tracing::error!("connection error: {:?}", e);
            None
        }
        None => {
            tracing::info!("connection ended peacefully");
            None
        }
    }
}

// Maps a handler result onto the wire, logging failures
fn respond<T>(
    addr: SocketAddr,
    what: &str,
    r: Result<T, DCServerError>,
    ok: impl FnOnce(T) -> Response,
) -> Response {
    match r {
        Ok(v) => ok(v),
        Err(e) => {
            match e.fail_reason() {
                FailReason::Internal => tracing::error!("{} on {}: {}", what, addr, e),
                _ => tracing::debug!("{} on {}: {}", what, addr, e),
            }
            Response::Failed(e.fail_reason())
        }
    }
}
