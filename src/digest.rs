// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use prost::Message;
use sha2::digest::DynDigest;
use sha2::Digest as _;

use crate::errors::*;
use crate::protos::re::Digest;

/// The hash function used to address blobs in CAS. Every digest in a single
/// invocation uses the same function; the server and client must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestFunction {
    Md5,
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

pub const SUPPORTED_DIGEST_FUNCTIONS: &[&str] = &["MD5", "SHA1", "SHA256", "SHA384", "SHA512"];

impl FromStr for DigestFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "MD5" => Ok(DigestFunction::Md5),
            "SHA1" => Ok(DigestFunction::Sha1),
            "SHA256" => Ok(DigestFunction::Sha256),
            "SHA384" => Ok(DigestFunction::Sha384),
            "SHA512" => Ok(DigestFunction::Sha512),
            other => bail!(
                "unknown digest function \"{}\" (supported: {})",
                other,
                SUPPORTED_DIGEST_FUNCTIONS.join(", ")
            ),
        }
    }
}

impl fmt::Display for DigestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DigestFunction::Md5 => "MD5",
            DigestFunction::Sha1 => "SHA1",
            DigestFunction::Sha256 => "SHA256",
            DigestFunction::Sha384 => "SHA384",
            DigestFunction::Sha512 => "SHA512",
        };
        f.write_str(name)
    }
}

impl DigestFunction {
    fn new_hasher(&self) -> Box<dyn DynDigest> {
        match self {
            DigestFunction::Md5 => Box::new(md5::Md5::new()),
            DigestFunction::Sha1 => Box::new(sha1::Sha1::new()),
            DigestFunction::Sha256 => Box::new(sha2::Sha256::new()),
            DigestFunction::Sha384 => Box::new(sha2::Sha384::new()),
            DigestFunction::Sha512 => Box::new(sha2::Sha512::new()),
        }
    }

    /// Digest an in-memory byte sequence. Identical bytes always produce
    /// identical digests; this is the content-addressing invariant
    /// everything else is built on.
    pub fn digest_of_bytes(&self, data: &[u8]) -> Digest {
        let mut hasher = self.new_hasher();
        hasher.update(data);
        Digest {
            hash: hex::encode(hasher.finalize()),
            size_bytes: data.len() as i64,
        }
    }

    pub fn digest_of_string(&self, data: &str) -> Digest {
        self.digest_of_bytes(data.as_bytes())
    }

    /// Serialize a protobuf message and digest the canonical bytes. The
    /// returned pair is the digest and the serialization it names, which
    /// callers typically insert into the blob map for upload.
    pub fn digest_of_message<M: Message>(&self, message: &M) -> (Digest, Vec<u8>) {
        let encoded = message.encode_to_vec();
        (self.digest_of_bytes(&encoded), encoded)
    }

    /// Digest a file's contents by streaming from disk.
    pub fn digest_of_file(&self, path: &str) -> Result<Digest> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("failed to open \"{}\" for hashing", path))?;
        let mut hasher = self.new_hasher();
        let mut buffer = [0u8; 64 * 1024];
        let mut size: i64 = 0;
        loop {
            let n = file
                .read(&mut buffer)
                .with_context(|| format!("failed to read \"{}\"", path))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as i64;
        }
        Ok(Digest {
            hash: hex::encode(hasher.finalize()),
            size_bytes: size,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_digest_of_empty_bytes() {
        let digest = DigestFunction::Sha256.digest_of_bytes(b"");
        assert_eq!(
            digest.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.size_bytes, 0);
    }

    #[test]
    fn test_digest_of_bytes() {
        let digest = DigestFunction::Sha256.digest_of_bytes(b"abc");
        assert_eq!(
            digest.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest.size_bytes, 3);
    }

    #[test]
    fn test_digest_functions_disagree() {
        let data = b"recc";
        let sha256 = DigestFunction::Sha256.digest_of_bytes(data);
        let md5 = DigestFunction::Md5.digest_of_bytes(data);
        let sha512 = DigestFunction::Sha512.digest_of_bytes(data);
        assert_ne!(sha256.hash, md5.hash);
        assert_ne!(sha256.hash, sha512.hash);
        assert_eq!(md5.hash.len(), 32);
        assert_eq!(sha256.hash.len(), 64);
        assert_eq!(sha512.hash.len(), 128);
    }

    #[test]
    fn test_digest_function_from_str() {
        assert_eq!(
            "sha256".parse::<DigestFunction>().unwrap(),
            DigestFunction::Sha256
        );
        assert_eq!("MD5".parse::<DigestFunction>().unwrap(), DigestFunction::Md5);
        assert!("blake3".parse::<DigestFunction>().is_err());
    }

    #[test]
    fn test_digest_of_file_matches_bytes() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"some file contents").unwrap();
        drop(f);

        let from_file = DigestFunction::Sha256
            .digest_of_file(path.to_str().unwrap())
            .unwrap();
        let from_bytes = DigestFunction::Sha256.digest_of_bytes(b"some file contents");
        assert_eq!(from_file, from_bytes);
    }
}
