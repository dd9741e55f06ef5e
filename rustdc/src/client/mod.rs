pub mod manager;
pub mod reader;
pub mod subscriber;
pub mod verifier;
pub mod writer;

use std::{error::Error, fmt, io, net::SocketAddr};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use openssl::error::ErrorStack;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::shared::crypto::CipherError;
use crate::shared::request::{ClientCodec, FailReason, InitRequest, Request, Response};

type Connection = Framed<TcpStream, ClientCodec>;
type ConnectionW = SplitSink<Connection, Request>;
type ConnectionR = SplitStream<Connection>;

#[derive(Debug)]
pub enum DCClientError {
    NotFound,
    SequenceConflict { tip: u64 },
    SignatureInvalid,
    ChainVerificationFailed,
    CommitUnconfirmed,
    PayloadHashMismatch,
    TimedOut,
    ServerError(String),
    OpenSSL(ErrorStack),
    IO(io::Error),
    Cipher(CipherError),
    StreamEnded,
    Other(String),
}

impl DCClientError {
    /// True for failures that mean the server (or session) can no longer be
    /// trusted without re-anchoring at a fresh signed root.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid | Self::ChainVerificationFailed | Self::PayloadHashMismatch
        )
    }

    /// Transient failures worth retrying on a new connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IO(_) | Self::StreamEnded | Self::CommitUnconfirmed | Self::TimedOut
        )
    }
}

impl fmt::Display for DCClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::SequenceConflict { tip } => write!(f, "sequence conflict, server tip is {}", tip),
            Self::SignatureInvalid => write!(f, "invalid signature"),
            Self::ChainVerificationFailed => write!(f, "hash chain verification failed"),
            Self::CommitUnconfirmed => write!(f, "commit not confirmed by server"),
            Self::PayloadHashMismatch => write!(f, "payload does not match its hash"),
            Self::TimedOut => write!(f, "timed out"),
            Self::ServerError(s) => write!(f, "server error: {}", s),
            Self::OpenSSL(e) => write!(f, "openssl: {}", e),
            Self::IO(e) => write!(f, "io: {}", e),
            Self::Cipher(e) => write!(f, "cipher: {}", e),
            Self::StreamEnded => write!(f, "stream ended"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

impl Error for DCClientError {}

impl From<io::Error> for DCClientError {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<ErrorStack> for DCClientError {
    fn from(value: ErrorStack) -> Self {
        Self::OpenSSL(value)
    }
}

impl From<CipherError> for DCClientError {
    fn from(value: CipherError) -> Self {
        Self::Cipher(value)
    }
}

impl From<FailReason> for DCClientError {
    fn from(value: FailReason) -> Self {
        match value {
            FailReason::NotFound => Self::NotFound,
            FailReason::SequenceConflict { tip } => Self::SequenceConflict { tip },
            FailReason::SignatureInvalid => Self::SignatureInvalid,
            FailReason::PayloadHashMismatch => Self::PayloadHashMismatch,
            FailReason::TimedOut => Self::TimedOut,
            FailReason::BadRequest => Self::ServerError("bad request".into()),
            FailReason::Internal => Self::ServerError("internal error".into()),
        }
    }
}

fn mismatched() -> DCClientError {
    DCClientError::ServerError("mismatched response".into())
}

async fn next_response(connection_r: &mut ConnectionR) -> Result<Response, DCClientError> {
    match connection_r.next().await {
        Some(r) => Ok(r?),
        None => Err(DCClientError::StreamEnded),
    }
}

async fn request(connection: &mut Connection, req: Request) -> Result<Response, DCClientError> {
    connection.send(req).await?;
    match connection.next().await {
        Some(r) => Ok(r?),
        None => Err(DCClientError::StreamEnded),
    }
}

async fn initialize_connection(
    server_address: SocketAddr,
    req: InitRequest,
) -> Result<Connection, DCClientError> {
    let tt = TcpStream::connect(server_address).await?;
    tt.set_nodelay(true)?;
    let mut stream = Framed::new(tt, ClientCodec::new());
    match request(&mut stream, Request::Init(req)).await? {
        Response::Init => Ok(stream),
        Response::Failed(r) => Err(r.into()),
        _ => Err(DCClientError::ServerError("bad init".into())),
    }
}
