use std::io;

use bytes::{Buf, BufMut, BytesMut};
use postcard::{from_bytes, to_stdvec};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::shared::config::MAX_MESSAGE_LEN;
use crate::shared::crypto::{CommitRoot, Hash, Signature};
use crate::shared::dc_repr::{Metadata, ProofElement};

#[derive(Serialize, Deserialize, Debug)]
pub enum Request {
    Init(InitRequest),
    Manage(ManageRequest),
    Write(WriteRequest),
    Read(ReadRequest),
    Subscribe(SubscribeRequest),
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Response {
    Init, // successful init
    ManageCreate(Signature), // server's sig of the created datacapsule's name
    ManageRead(Metadata),
    WriteData(Hash),
    WriteCommit(Signature), // server co-signature over the commit root's hash
    WriteTip(Option<CommitRoot>),
    WriteRoot(Option<CommitRoot>), // commit at a given sequence number
    ReadData(Vec<ProofElement>),
    ReadProof(Vec<ProofElement>),
    SubscribeRoot(CommitRoot), // name_from_num, wait_after
    SubscribeTip(Option<CommitRoot>), // last_num
    SubscribeNum(u64), // num_from_name
    SubscribeRecords(Vec<Hash>), // bottom row of one commit's tree
    Failed(FailReason),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    NotFound,
    SequenceConflict { tip: u64 },
    SignatureInvalid,
    PayloadHashMismatch,
    TimedOut,
    BadRequest,
    Internal,
}

/// Selects the mode of a connection. Every mode but `Manage` is bound to
/// one datacapsule.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub enum InitRequest {
    Manage,
    Read(Hash),
    Write(Hash),
    Subscribe(Hash),
}

#[derive(Serialize, Deserialize, Debug)]
pub enum ManageRequest {
    Create(Metadata),
    Read(Hash),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum WriteRequest {
    Data {
        hash: Hash,
        data: Vec<u8>,
    },
    Commit {
        root: CommitRoot,
        hashes: Vec<Hash>, // records sealed under root, in order
    },
    Tip,
    CommitAt(u64),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub enum ReadRequest {
    Data(Hash),
    Proof(Hash),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub enum SubscribeRequest {
    LastNum,
    NameFromNum(u64),
    NumFromName(Hash),
    WaitAfter(u64),
    Records(u64),
}

fn io_err<T>(s: &str) -> Result<T, io::Error> {
    Err(io::Error::new(io::ErrorKind::Other, s))
}

// 8 byte little-endian length, then the postcard body
fn encode<T: Serialize>(item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
    let cheese = match to_stdvec(&item) {
        Ok(v) => v,
        Err(_) => return io_err("postcard serialization"),
    };
    if cheese.len() > MAX_MESSAGE_LEN {
        return io_err("message too long");
    }
    let message_len = (cheese.len() as u64).to_le_bytes();
    dst.reserve(8 + cheese.len());
    dst.put_slice(&message_len);
    dst.put_slice(&cheese);
    Ok(())
}

fn decode<T: DeserializeOwned>(src: &mut BytesMut) -> Result<Option<T>, io::Error> {
    if src.len() < 8 {
        return Ok(None);
    }
    let mut len_bytes = [0; 8];
    len_bytes.copy_from_slice(&src[0..8]);
    let message_len = match usize::try_from(u64::from_le_bytes(len_bytes)) {
        Ok(x) if x <= MAX_MESSAGE_LEN => x,
        _ => return io_err("message len"),
    };
    if src.len() < 8 + message_len {
        src.reserve(8 + message_len - src.len());
        return Ok(None);
    }

    src.advance(8);
    match from_bytes(&src.split_to(message_len)) {
        Ok(item) => Ok(Some(item)),
        Err(_) => io_err("postcard deserialization"),
    }
}

pub struct ClientCodec(());

impl ClientCodec {
    pub fn new() -> Self {
        Self(())
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(item, dst)
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode(src)
    }
}

pub struct ServerCodec(());

impl ServerCodec {
    pub fn new() -> Self {
        Self(())
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(item, dst)
    }
}

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode(src)
    }
}
