use std::net::SocketAddr;

use crate::shared::{
    crypto::{serialize_pubkey, sign, verify_signature, Hash, PrivateKey, PublicKey},
    dc_repr::Metadata,
    request::{InitRequest, ManageRequest, Request, Response},
};

use super::{initialize_connection, mismatched, request, Connection, DCClientError};

/// Creates datacapsules and looks up their metadata.
pub struct ManagerConnection {
    connection: Connection,
    server_pub_key: PublicKey,
}

impl ManagerConnection {
    pub async fn new(
        server_address: SocketAddr,
        server_pub_key: PublicKey,
    ) -> Result<Self, DCClientError> {
        let connection = initialize_connection(server_address, InitRequest::Manage).await?;
        Ok(Self {
            connection,
            server_pub_key,
        })
    }

    /// Registers a new datacapsule and returns its name once the server has
    /// co-signed it. Creating the same capsule twice is harmless.
    pub async fn create(
        &mut self,
        creator_pub_key: &PublicKey,
        creator_private_key: &PrivateKey,
        writer_pub_key: &PublicKey,
        description: String,
    ) -> Result<Hash, DCClientError> {
        let mut dc = Metadata {
            creator_pub_key: serialize_pubkey(creator_pub_key)?,
            writer_pub_key: serialize_pubkey(writer_pub_key)?,
            description,
            signature: Vec::new(),
        };
        let dc_name = dc.name();
        dc.signature = sign(&dc_name, creator_private_key)?;

        let req = Request::Manage(ManageRequest::Create(dc));
        match request(&mut self.connection, req).await? {
            Response::ManageCreate(s) => {
                if verify_signature(&s, &dc_name, &self.server_pub_key) {
                    Ok(dc_name)
                } else {
                    Err(DCClientError::SignatureInvalid)
                }
            }
            Response::Failed(r) => Err(r.into()),
            _ => Err(mismatched()),
        }
    }

    /// Fetches a capsule's metadata, checking that it really names `dc_name`.
    pub async fn metadata(&mut self, dc_name: Hash) -> Result<Metadata, DCClientError> {
        let req = Request::Manage(ManageRequest::Read(dc_name));
        match request(&mut self.connection, req).await? {
            Response::ManageRead(dc) => {
                if dc.name() == dc_name {
                    Ok(dc)
                } else {
                    Err(DCClientError::PayloadHashMismatch)
                }
            }
            Response::Failed(r) => Err(r.into()),
            _ => Err(mismatched()),
        }
    }
}
