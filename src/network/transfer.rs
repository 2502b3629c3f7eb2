//! Chunked file transfer over the line protocol.
//!
//! A transfer is a `put` header, any number of base64 `chunk` frames and the
//! bare `/EOF` line. The receiver checks the SHA-256 announced in the header.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FleetError, Result};
use crate::job::JobId;
use crate::protocol::{FileHeader, Outbound, EOF_MARKER};

/// Raw bytes per chunk frame.
pub const CHUNK_SIZE: usize = 48 * 1024;

async fn write_frame<W>(writer: &mut W, frame: &Outbound) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = frame.to_line()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Stream `path` to the peer as the file of `job_id`.
pub async fn send_file<W>(writer: &mut W, job_id: JobId, path: &Path) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let owned = path.to_path_buf();
    let checksum = tokio::task::spawn_blocking(move || crate::archive::checksum(&owned))
        .await
        .map_err(|e| FleetError::Internal(e.to_string()))??;
    let size = tokio::fs::metadata(path).await?.len();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.tar", job_id));

    write_frame(
        writer,
        &Outbound::Put(FileHeader {
            job_id,
            filename,
            checksum,
            size,
        }),
    )
    .await?;

    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_frame(
            writer,
            &Outbound::Chunk {
                data: STANDARD.encode(&buf[..n]),
            },
        )
        .await?;
    }

    writer.write_all(EOF_MARKER.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    tracing::debug!(job_id, size, path = %path.display(), "File sent");
    Ok(size)
}

/// A file that finished arriving.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub header: FileHeader,
    pub path: PathBuf,
    pub verified: bool,
}

/// Collects the chunks of one inbound transfer into the spool directory.
pub struct FileReceiver {
    header: FileHeader,
    path: PathBuf,
    file: File,
    hasher: Sha256,
    received: u64,
}

impl FileReceiver {
    pub async fn create(spool_dir: &Path, header: FileHeader) -> Result<Self> {
        tokio::fs::create_dir_all(spool_dir).await?;
        // Only the final path component of the announced name is used.
        let base = Path::new(&header.filename)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.tar", header.job_id));
        let path = spool_dir.join(format!("{}-{}", uuid::Uuid::new_v4(), base));
        let file = File::create(&path).await?;
        Ok(Self {
            header,
            path,
            file,
            hasher: Sha256::new(),
            received: 0,
        })
    }

    pub async fn push_chunk(&mut self, data: &str) -> Result<()> {
        let bytes = STANDARD
            .decode(data)
            .map_err(|e| FleetError::Protocol(format!("bad chunk encoding: {}", e)))?;
        self.hasher.update(&bytes);
        self.file.write_all(&bytes).await?;
        self.received += bytes.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<ReceivedFile> {
        self.file.flush().await?;
        let digest = hex::encode(self.hasher.finalize());
        let verified = digest.eq_ignore_ascii_case(&self.header.checksum)
            && self.received == self.header.size;
        if !verified {
            tracing::warn!(
                job_id = self.header.job_id,
                expected = %self.header.checksum,
                actual = %digest,
                received = self.received,
                "Checksum mismatch on received file"
            );
        }
        Ok(ReceivedFile {
            header: self.header,
            path: self.path,
            verified,
        })
    }

    /// Drop a half-received file.
    pub async fn abandon(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove partial file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Inbound;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn sent_file_is_received_and_verified() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("7.tar");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &payload).unwrap();

        let mut wire = Vec::new();
        send_file(&mut wire, 7, &source).await.unwrap();

        let mut lines = tokio::io::BufReader::new(wire.as_slice()).lines();
        let header = match Inbound::parse(&lines.next_line().await.unwrap().unwrap()).unwrap() {
            Inbound::Put(header) => header,
            other => panic!("expected put header, got {:?}", other),
        };
        assert_eq!(header.job_id, 7);
        assert_eq!(header.size, payload.len() as u64);

        let mut receiver = FileReceiver::create(&dir.path().join("spool"), header)
            .await
            .unwrap();
        while let Some(line) = lines.next_line().await.unwrap() {
            if line == EOF_MARKER {
                break;
            }
            match Inbound::parse(&line).unwrap() {
                Inbound::Chunk { data } => receiver.push_chunk(&data).await.unwrap(),
                other => panic!("expected chunk, got {:?}", other),
            }
        }
        let received = receiver.finish().await.unwrap();
        assert!(received.verified);
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let header = FileHeader {
            job_id: 1,
            filename: "../../etc/1.tar".to_string(),
            checksum: "00".repeat(32),
            size: 3,
        };
        let mut receiver = FileReceiver::create(dir.path(), header).await.unwrap();
        receiver.push_chunk(&STANDARD.encode(b"abc")).await.unwrap();
        let received = receiver.finish().await.unwrap();
        assert!(!received.verified);
        assert!(received.path.starts_with(dir.path()));
    }
}
