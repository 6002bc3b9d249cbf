//! Backend credential retrieval.
//!
//! Credentials are stored as a single encrypted record in a blob store. Once
//! decrypted the record holds three fields separated by a single space:
//! `<endpoint> <username> <password>`.

use std::collections::HashMap;
use std::str::FromStr;

use log::debug;
use parking_lot::RwLock;

use crate::config::CredentialLocation;
use crate::error::{Result, TransactionError};

/// Decrypted backend credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    endpoint: String,
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl FromStr for Credentials {
    type Err = TransactionError;

    fn from_str(record: &str) -> Result<Self> {
        let fields: Vec<&str> = record.split(' ').collect();
        if fields.len() != 3 || fields.iter().any(|f| f.is_empty()) {
            return Err(TransactionError::configuration(
                "Number of fields in the credential record is not correct",
            ));
        }
        Ok(Self::new(fields[0], fields[1], fields[2]))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Object storage holding encrypted credential records.
pub trait BlobStore: Send + Sync {
    fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>>;
}

/// Key-management service able to decrypt a ciphertext with a named key.
pub trait KeyDecrypter: Send + Sync {
    fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Reads, decrypts and parses the credential record at `location`.
pub fn load_credentials(
    location: &CredentialLocation,
    store: &dyn BlobStore,
    decrypter: &dyn KeyDecrypter,
) -> Result<Credentials> {
    if location.bucket.is_empty() || location.object.is_empty() || location.key_name.is_empty() {
        return Err(TransactionError::configuration(
            "credential location is incomplete",
        ));
    }

    let ciphertext = store.read(&location.bucket, &location.object)?;
    let plaintext = decrypter.decrypt(&location.key_name, &ciphertext)?;
    let record = String::from_utf8(plaintext).map_err(|_| {
        TransactionError::configuration("credential record is not valid UTF-8")
    })?;

    let credentials: Credentials = record.trim_end_matches('\n').parse()?;
    debug!(
        "Loaded credentials for {} from {}/{}",
        credentials.endpoint, location.bucket, location.object
    );
    Ok(credentials)
}

/// Blob store kept in process memory.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, object: &str, data: impl Into<Vec<u8>>) {
        self.blobs
            .write()
            .insert((bucket.to_string(), object.to_string()), data.into());
    }
}

impl BlobStore for InMemoryBlobStore {
    fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(&(bucket.to_string(), object.to_string()))
            .cloned()
            .ok_or_else(|| {
                TransactionError::configuration(format!(
                    "credential object {}/{} not found",
                    bucket, object
                ))
            })
    }
}

/// Decrypter for records stored in plaintext, as in local setups.
pub struct PassthroughDecrypter;

impl KeyDecrypter for PassthroughDecrypter {
    fn decrypt(&self, _key_name: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> CredentialLocation {
        CredentialLocation {
            bucket: "secrets".to_string(),
            object: "db-credential".to_string(),
            key_name: "db-key".to_string(),
        }
    }

    struct XorDecrypter(u8);

    impl KeyDecrypter for XorDecrypter {
        fn decrypt(&self, key_name: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
            assert_eq!(key_name, "db-key");
            Ok(ciphertext.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[test]
    fn test_parse_record() {
        let creds: Credentials = "project:region:instance admin hunter2".parse().unwrap();
        assert_eq!(creds.endpoint(), "project:region:instance");
        assert_eq!(creds.username(), "admin");
        assert_eq!(creds.password(), "hunter2");
    }

    #[test]
    fn test_parse_wrong_field_count() {
        for record in ["only two", "one two three four", "", "a  b"] {
            let err = record.parse::<Credentials>().unwrap_err();
            assert!(err.is_configuration(), "{:?} should be rejected", record);
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("endpoint", "user", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_load_credentials_decrypts() {
        let store = InMemoryBlobStore::new();
        let ciphertext: Vec<u8> = b"instance-1 svc pw\n".iter().map(|b| b ^ 0x5a).collect();
        store.put("secrets", "db-credential", ciphertext);

        let creds = load_credentials(&location(), &store, &XorDecrypter(0x5a)).unwrap();
        assert_eq!(creds, Credentials::new("instance-1", "svc", "pw"));
    }

    #[test]
    fn test_load_credentials_malformed_record() {
        let store = InMemoryBlobStore::new();
        store.put("secrets", "db-credential", "instance-1 svc");

        let err = load_credentials(&location(), &store, &PassthroughDecrypter).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_load_credentials_missing_object() {
        let store = InMemoryBlobStore::new();
        let err = load_credentials(&location(), &store, &PassthroughDecrypter).unwrap_err();
        assert!(err.to_string().contains("not found"));

        let err = load_credentials(&CredentialLocation::default(), &store, &PassthroughDecrypter)
            .unwrap_err();
        assert!(err.to_string().contains("incomplete"));
    }
}
