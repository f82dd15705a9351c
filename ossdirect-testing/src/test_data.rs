//! Generate random test data and check that data survived a round trip
use rand::prelude::*;
use sha2::Digest;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// A test object with random contents
#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub data: Vec<u8>,
    pub hash: [u8; 32],
}

impl TestObject {
    /// Make a new test object of random data with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();
        let data = random_data(size.get_bytes() as usize);
        let hash = sha256(&data);

        Self {
            key: key.into(),
            data,
            hash,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Assert that some data are the same as this object's data, without dumping megabytes of
    /// bytes in the failure message
    #[track_caller]
    pub fn assert_matches(&self, data: &[u8]) {
        assert_eq!(
            self.data.len(),
            data.len(),
            "Object '{}' length doesn't match",
            self.key
        );
        assert_eq!(
            self.hash,
            sha256(data),
            "Object '{}' hash doesn't match expected value",
            self.key
        );
    }

    /// Assert that a file on the local filesystem contains exactly this object's data
    pub async fn assert_matches_file(&self, path: &Path) -> crate::Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        self.assert_matches(&data);

        Ok(())
    }
}

pub fn random_data(size: usize) -> Vec<u8> {
    let mut rand = rand::thread_rng();
    let mut data = vec![0u8; size];

    rand.fill(&mut data[..]);

    data
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());

    hash
}
