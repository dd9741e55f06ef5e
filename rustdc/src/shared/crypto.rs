use std::fmt;

use openssl::{
    ec::{EcGroup, EcKey},
    ecdsa::EcdsaSig,
    error::ErrorStack,
    nid::Nid,
    pkey::{Private, Public},
    rand::rand_bytes,
    sha::Sha256,
    symm::{Cipher, Crypter, Mode},
};
use serde::{Deserialize, Serialize};

use crate::shared::config::FANOUT;

// AES-128 encryption key
pub type SymmetricKey = [u8; 16];

// ECDSA signatures
// NIST P-256 (secp256r1) elliptic curve
pub type PublicKey = EcKey<Public>;
pub type PrivateKey = EcKey<Private>;

// SHA-256 hash
pub type Hash = [u8; 32];
pub type HashBlock = [Hash; FANOUT];
pub const NULL_HASH: Hash = [0; 32];
pub const NULL_BLOCK: HashBlock = [NULL_HASH; FANOUT];

// DER-encoded ECDSA signature
pub type Signature = Vec<u8>;

/// A hash together with a signature over it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedHash {
    pub hash: Hash,
    pub signature: Signature,
}

impl SignedHash {
    pub fn sign(hash: Hash, key: &PrivateKey) -> Result<Self, ErrorStack> {
        Ok(Self {
            hash,
            signature: sign(&hash, key)?,
        })
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        verify_signature(&self.signature, &self.hash, key)
    }
}

/// The writer's signature over `(sequence_number, blockhash)`. Nothing a
/// reader receives is trusted until it chains back to one of these.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommitRoot {
    pub sequence_number: u64,
    pub blockhash: Hash,
    pub signed: SignedHash,
}

impl CommitRoot {
    pub fn new(sequence_number: u64, blockhash: Hash, key: &PrivateKey) -> Result<Self, ErrorStack> {
        let signed = SignedHash::sign(hash_commit(sequence_number, &blockhash), key)?;
        Ok(Self {
            sequence_number,
            blockhash,
            signed,
        })
    }

    /// Checks both that the signed hash really covers this sequence number
    /// and blockhash, and that the signature is the writer's.
    pub fn verify(&self, writer_key: &PublicKey) -> bool {
        self.signed.hash == hash_commit(self.sequence_number, &self.blockhash)
            && self.signed.verify(writer_key)
    }
}

pub fn generate_signing_key() -> Result<(PrivateKey, PublicKey), ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let private = EcKey::generate(&group)?;
    let public = EcKey::from_public_key(&group, private.public_key())?;
    Ok((private, public))
}

pub fn public_key_of(key: &PrivateKey) -> Result<PublicKey, ErrorStack> {
    EcKey::from_public_key(key.group(), key.public_key())
}

pub fn serialize_pubkey(key: &PublicKey) -> Result<Vec<u8>, ErrorStack> {
    key.public_key_to_der()
}

pub fn deserialize_pubkey(key: &[u8]) -> Result<PublicKey, ErrorStack> {
    EcKey::<Public>::public_key_from_der(key)
}

pub fn deserialize_private_key_from_pem(pem: &[u8]) -> Result<PrivateKey, ErrorStack> {
    EcKey::<Private>::private_key_from_pem(pem)
}

pub fn hash_dc_metadata(c_pk: &[u8], w_pk: &[u8], desc: &str) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(c_pk);
    hasher.update(w_pk);
    hasher.update(desc.as_bytes());
    hasher.finish()
}

pub fn hash_data(encrypted_data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(encrypted_data);
    hasher.finish()
}

/// Hash of a block: SHA-256 over its FANOUT entries, concatenated.
pub fn hash_block(block: &HashBlock) -> Hash {
    let mut hasher = Sha256::new();
    for h in block {
        hasher.update(h);
    }
    hasher.finish()
}

pub fn hash_commit(sequence_number: u64, blockhash: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(&sequence_number.to_le_bytes());
    hasher.update(blockhash);
    hasher.finish()
}

pub fn sign(hash: &Hash, key: &PrivateKey) -> Result<Signature, ErrorStack> {
    EcdsaSig::sign(hash, key)?.to_der()
}

/// A malformed signature is reported as invalid, not as an error: it comes
/// from the server or the network, neither of which is trusted.
pub fn verify_signature(signature: &[u8], hash: &Hash, key: &PublicKey) -> bool {
    match EcdsaSig::from_der(signature) {
        Ok(sig) => sig.verify(hash, key).unwrap_or(false),
        Err(_) => false,
    }
}

#[derive(Debug)]
pub enum CipherError {
    OpenSSL(ErrorStack),
    Truncated,
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherError::OpenSSL(e) => write!(f, "cipher failure: {}", e),
            CipherError::Truncated => write!(f, "ciphertext shorter than its iv"),
        }
    }
}

impl std::error::Error for CipherError {}

impl From<ErrorStack> for CipherError {
    fn from(value: ErrorStack) -> Self {
        Self::OpenSSL(value)
    }
}

/// Encryption applied to record payloads before they leave the writer and
/// after a reader has verified them. The server only ever sees ciphertext.
pub trait PayloadCipher {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// AES-128-CBC. Output format: [16 bytes iv, n bytes encrypted data]
impl PayloadCipher for SymmetricKey {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let block_size = Cipher::aes_128_cbc().block_size();
        // 16 for iv, dlen + bsize for data
        let mut result = vec![0; 16 + data.len() + block_size];
        let (iv, body) = result.split_at_mut(16);
        rand_bytes(iv)?;

        let mut encrypter = Crypter::new(Cipher::aes_128_cbc(), Mode::Encrypt, self, Some(&*iv))?;
        let mut count = encrypter.update(data, body)?;
        count += encrypter.finalize(&mut body[count..])?;
        result.truncate(16 + count);
        Ok(result)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < 16 {
            return Err(CipherError::Truncated);
        }
        let (iv, ciphertext) = data.split_at(16);

        let mut decrypter = Crypter::new(Cipher::aes_128_cbc(), Mode::Decrypt, self, Some(iv))?;
        let block_size = Cipher::aes_128_cbc().block_size();
        let mut plaintext = vec![0; ciphertext.len() + block_size];
        let mut count = decrypter.update(ciphertext, &mut plaintext)?;
        count += decrypter.finalize(&mut plaintext[count..])?;
        plaintext.truncate(count);
        Ok(plaintext)
    }
}
