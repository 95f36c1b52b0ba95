//! Checksum plumbing: the CRC-64 the service uses for whole-object integrity
//! and the MD5 that goes into local source fingerprints.
use crc::{Crc, CRC_64_XZ};
use md5::{Digest, Md5};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// CRC-64 with the ECMA-182 polynomial in its reflected form, which is what
/// the service reports in its `crc64ecma` hash header.
pub(crate) static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Both digests of a local file, computed in a single streaming pass.
pub(crate) struct FileSums {
    /// Standard-alphabet base64 of the MD5 digest, the form stored in the
    /// checkpoint fingerprint.
    pub md5: String,
    pub crc64: u64,
}

/// Stream a file once, feeding every byte to both MD5 and CRC-64.
///
/// The MD5 fingerprints the upload source for resume validation; the CRC is
/// held until after commit and compared against what the service computed.
pub(crate) async fn file_sums(path: &Path) -> std::io::Result<FileSums> {
    let mut file = File::open(path).await?;
    let mut md5 = Md5::new();
    let mut crc = CRC64.digest();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let count = file.read(&mut buffer).await?;
        if count == 0 {
            break;
        }

        md5.update(&buffer[..count]);
        crc.update(&buffer[..count]);
    }

    Ok(FileSums {
        md5: base64::encode(md5.finalize()),
        crc64: crc.finalize(),
    })
}

/// CRC-64 of a file's entire contents.
///
/// Used to verify a fully assembled download target before it is renamed
/// into place.
pub(crate) async fn file_crc64(path: &Path) -> std::io::Result<u64> {
    let mut file = File::open(path).await?;
    let mut crc = CRC64.digest();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let count = file.read(&mut buffer).await?;
        if count == 0 {
            break;
        }

        crc.update(&buffer[..count]);
    }

    Ok(crc.finalize())
}
