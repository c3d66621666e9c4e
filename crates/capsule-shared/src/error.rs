use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext, nonce or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Recipient is required")]
    MissingRecipient,

    #[error("Either a file or a message must be provided")]
    EmptyCapsule,

    #[error("Unlock date must be in the future")]
    UnlockNotInFuture,

    #[error("File type not allowed: {0}")]
    FileTypeNotAllowed(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("No update data provided")]
    EmptyUpdate,
}
