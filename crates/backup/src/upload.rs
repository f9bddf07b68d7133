//! Uploading file content as sealed blocks.

use crate::blocks::block_name;
use crate::error::{ErrorKind, Result, io};
use cumulus_codec::{BlockCodec, Payload, SharedPacker};
use cumulus_storage::{Backoff, Handle, ServiceHandle};
use exn::ResultExt;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const READ_SIZE: usize = 1024 * 1024;

/// Where a file's content ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub block_number: u64,
    pub shared: bool,
    /// Bytes actually read from the file.
    pub real_size: u64,
}

/// Seals and uploads content into the staging folder of the current run.
///
/// Block numbers are handed out from a counter seeded with the first number
/// neither the catalog nor any remote snapshot has used. One number is always held back for the shared block
/// being filled; it is replaced as soon as that block is uploaded.
pub struct Uploader {
    service: ServiceHandle,
    folder: Handle,
    codec: BlockCodec,
    backoff: Backoff,
    packer: SharedPacker,
    next_block: u64,
    shared_block: u64,
    bytes_sent: u64,
    parts_sent: usize,
}

impl Uploader {
    pub fn new(service: ServiceHandle, folder: Handle, codec: BlockCodec, backoff: Backoff, next_block: u64) -> Self {
        let packer = SharedPacker::new(codec.geometry());
        Self {
            service,
            folder,
            codec,
            backoff,
            packer,
            next_block: next_block + 1,
            shared_block: next_block,
            bytes_sent: 0,
            parts_sent: 0,
        }
    }

    /// Encoded bytes uploaded so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Block parts uploaded so far.
    pub fn parts_sent(&self) -> usize {
        self.parts_sent
    }

    /// Whether a non-zero upload limit has been used up.
    pub fn limit_reached(&self, limit: u64) -> bool {
        limit > 0 && self.bytes_sent >= limit
    }

    /// Upload the content of file `id`.
    ///
    /// Small content is packed into the current shared block under `id`;
    /// anything else gets a block of its own. Empty files upload nothing.
    /// Returns `None` if the file could not be opened.
    pub async fn upload_file(&mut self, id: u64, path: &Path) -> Result<Option<Placement>> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), "Unable to open file for upload: {err}");
                return Ok(None);
            },
        };
        let block = self.next_block;
        let mut encoder = self.codec.encoder(true);
        let mut part = 0;
        let mut buffer = vec![0u8; READ_SIZE];
        loop {
            let read = file.read(&mut buffer).await.or_raise(io(path.display()))?;
            if read == 0 {
                break;
            }
            for chunk in encoder.write(&buffer[..read]).or_raise(|| ErrorKind::Codec)? {
                self.put_owned(block, part, &chunk).await?;
                part += 1;
            }
        }
        let real_size = encoder.consumed();
        if real_size == 0 {
            return Ok(Some(Placement { block_number: 0, shared: true, real_size }));
        }
        match encoder.finish().or_raise(|| ErrorKind::Codec)? {
            Payload::Shared(payload) => {
                debug!(id, size = payload.len(), "Storing file data in shared block");
                if let Some(body) = self.packer.push(id, &payload).or_raise(|| ErrorKind::Codec)? {
                    self.rotate_shared(body).await?;
                }
                Ok(Some(Placement { block_number: self.shared_block, shared: true, real_size }))
            },
            Payload::Chunks(chunks) => {
                for chunk in chunks {
                    self.put_owned(block, part, &chunk).await?;
                    part += 1;
                }
                Ok(Some(Placement { block_number: block, shared: false, real_size }))
            },
        }
    }

    /// Upload the current shared block, if anything was packed into it.
    pub async fn flush_shared(&mut self) -> Result<()> {
        match self.packer.take() {
            Some(body) => self.rotate_shared(body).await,
            None => Ok(()),
        }
    }

    /// Upload a local file under a reserved block number.
    pub async fn upload_reserved(&mut self, block: u64, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path).await.or_raise(io(path.display()))?;
        let mut encoder = self.codec.encoder(false);
        let mut chunks = encoder.write(&data).or_raise(|| ErrorKind::Codec)?;
        match encoder.finish().or_raise(|| ErrorKind::Codec)? {
            Payload::Chunks(rest) => chunks.extend(rest),
            Payload::Shared(payload) => chunks.push(payload),
        }
        info!(block, path = %path.display(), parts = chunks.len(), "Uploading reserved block");
        for (part, chunk) in (0..).zip(&chunks) {
            self.put(block, part, chunk).await?;
        }
        Ok(())
    }

    async fn rotate_shared(&mut self, body: Vec<u8>) -> Result<()> {
        let block = self.shared_block;
        info!(block, size = body.len(), "Uploading shared block");
        self.put(block, 0, &body).await?;
        self.shared_block = self.next_block;
        self.next_block += 1;
        Ok(())
    }

    /// Upload a part of a block owned by a single file. The block number is
    /// claimed by its first part, so a file that fails part-way never leaves
    /// parts behind under a number that is handed out again.
    async fn put_owned(&mut self, block: u64, part: u64, payload: &[u8]) -> Result<()> {
        if part == 0 {
            self.next_block = block + 1;
        }
        self.put(block, part, payload).await
    }

    async fn put(&mut self, block: u64, part: u64, payload: &[u8]) -> Result<()> {
        let sealed = self.codec.seal(payload).or_raise(|| ErrorKind::Codec)?;
        let name = block_name(block, part);
        debug!(block, part, size = sealed.len(), "Uploading block part");
        let (service, folder) = (&self.service, &self.folder);
        self.backoff
            .run("upload block", || service.upload(folder, &name, &sealed))
            .await
            .or_raise(|| ErrorKind::Storage)?;
        self.bytes_sent += sealed.len() as u64;
        self.parts_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockList, block_list};
    use cumulus_codec::{Geometry, Keys, SharedIndex};
    use cumulus_storage::StorageService;
    use cumulus_storage::backend::MockService;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        mock: Arc<MockService>,
        folder: Handle,
        codec: BlockCodec,
        uploader: Uploader,
        dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let mock = Arc::new(MockService::default());
        let root = mock.root().await.unwrap();
        let folder = mock.create_folder(&root, "TEMP").await.unwrap();
        let codec = BlockCodec::new(Keys::generate(), Geometry::new(8192, 1024).unwrap());
        let service: ServiceHandle = mock.clone();
        let uploader = Uploader::new(service, folder.clone(), codec.clone(), Backoff::default(), 10);
        Fixture { mock, folder, codec, uploader, dir: tempfile::tempdir().unwrap() }
    }

    impl Fixture {
        fn write(&self, name: &str, data: &[u8]) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, data).unwrap();
            path
        }

        async fn blocks(&self) -> BlockList {
            block_list(&self.mock.list(&self.folder).await.unwrap())
        }

        async fn download(&self, blocks: &BlockList, block: u64) -> Vec<Vec<u8>> {
            let mut parts = Vec::new();
            for handle in blocks[&block].values() {
                parts.push(self.mock.download(handle).await.unwrap());
            }
            parts
        }
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn test_small_files_share_a_block() {
        let mut f = fixture().await;
        let a = f.write("a", b"hello");
        let b = f.write("b", b"world");
        let placed_a = f.uploader.upload_file(100, &a).await.unwrap().unwrap();
        let placed_b = f.uploader.upload_file(101, &b).await.unwrap().unwrap();
        assert_eq!(placed_a, Placement { block_number: 10, shared: true, real_size: 5 });
        assert_eq!(placed_b.block_number, 10);
        assert_eq!(f.mock.uploads(), 0);

        f.uploader.flush_shared().await.unwrap();
        let blocks = f.blocks().await;
        let body = f.codec.decode(&f.download(&blocks, 10).await[0], true).unwrap();
        let index = SharedIndex::parse(&body).unwrap();
        assert_eq!(index.extract(&body, 101).unwrap().unwrap(), b"world");
        assert_eq!(f.uploader.parts_sent(), 1);
        assert_eq!(f.uploader.bytes_sent(), 4096);
    }

    #[tokio::test]
    async fn test_large_file_gets_its_own_block() {
        let mut f = fixture().await;
        let data = noise(20_000);
        let path = f.write("big", &data);
        let placed = f.uploader.upload_file(7, &path).await.unwrap().unwrap();
        assert_eq!(placed, Placement { block_number: 11, shared: false, real_size: 20_000 });

        let blocks = f.blocks().await;
        assert_eq!(blocks[&11].len(), 3);
        assert_eq!(f.codec.decode_parts(&f.download(&blocks, 11).await).unwrap(), data);

        // The next file continues after it.
        let other = f.write("other", &noise(5_000));
        assert_eq!(f.uploader.upload_file(8, &other).await.unwrap().unwrap().block_number, 12);
    }

    #[tokio::test]
    async fn test_empty_and_missing_files() {
        let mut f = fixture().await;
        let empty = f.write("empty", b"");
        assert_eq!(
            f.uploader.upload_file(1, &empty).await.unwrap(),
            Some(Placement { block_number: 0, shared: true, real_size: 0 })
        );
        assert_eq!(f.uploader.upload_file(2, &f.dir.path().join("gone")).await.unwrap(), None);
        f.uploader.flush_shared().await.unwrap();
        assert_eq!(f.mock.upload_attempts(), 0);
    }

    #[tokio::test]
    async fn test_full_shared_block_is_uploaded_and_replaced() {
        let mut f = fixture().await;
        let mut blocks_used = Vec::new();
        for id in 0..20 {
            // Incompressible, so each entry takes most of the small-file limit.
            let path = f.write(&format!("f{id}"), &noise(900 + id as usize));
            blocks_used.push(f.uploader.upload_file(id, &path).await.unwrap().unwrap().block_number);
        }
        f.uploader.flush_shared().await.unwrap();
        assert!(blocks_used.windows(2).all(|pair| pair[0] <= pair[1]));
        let blocks = f.blocks().await;
        assert_eq!(blocks.keys().copied().collect::<Vec<_>>(), {
            let mut expected = blocks_used.clone();
            expected.dedup();
            expected
        });
        for (block, parts) in &blocks {
            let body = f.codec.decode(&f.mock.download(&parts[&0]).await.unwrap(), true).unwrap();
            assert!(body.len() <= 8192 - 32);
            let index = SharedIndex::parse(&body).unwrap();
            let expected: Vec<u64> = (0..20).filter(|id| blocks_used[*id as usize] == *block).collect();
            assert_eq!(index.ids().collect::<Vec<_>>(), expected);
        }
    }

    #[tokio::test]
    async fn test_reserved_blocks() {
        let mut f = fixture().await;
        let log = f.write("deleted.dat", b"");
        f.uploader.upload_reserved(1, &log).await.unwrap();
        let blocks = f.blocks().await;
        assert_eq!(f.codec.decode_parts(&f.download(&blocks, 1).await).unwrap(), b"");
        // Reserved uploads never consume data block numbers.
        let path = f.write("big", &noise(9_000));
        assert_eq!(f.uploader.upload_file(3, &path).await.unwrap().unwrap().block_number, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_gives_up_after_the_deadline() {
        let mut f = fixture().await;
        f.mock.set_failing(true);
        let path = f.write("big", &noise(9_000));
        let started = tokio::time::Instant::now();
        let err = f.uploader.upload_file(1, &path).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Storage));
        assert_eq!(f.mock.upload_attempts(), 10);
        assert_eq!(started.elapsed(), Duration::from_secs(30 * 60));
        assert_eq!(f.uploader.bytes_sent(), 0);
    }
}
