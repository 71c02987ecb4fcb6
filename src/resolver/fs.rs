//! Resolver over the sharded filesystem mirror.
//!
//! Layout: `root/<id[0..2]>/<id[2..4]>/<id>`, one regular file per object.
//! Only two-character lowercase hex shard directories and files named by
//! their canonical identifier (and sitting in the matching shard) count as
//! entries. Staging `.part` files, the transfer marker and anything else are
//! invisible to counting and iteration.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{BlobStore, BlobWriter, ByteStream, IdStream};
use crate::blob_id::{BlobId, BLOB_ID_HEX_LEN};
use crate::error::SyncError;
use crate::grid::ObjectMetadata;
use crate::types::StoreKind;

const PART_SUFFIX: &str = ".part";

pub struct FsResolver {
    root: PathBuf,
    fast_count: bool,
}

impl FsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fast_count: false,
        }
    }

    /// Count with `find(1)` first, falling back to a directory walk.
    pub fn with_fast_count(mut self, fast_count: bool) -> Self {
        self.fast_count = fast_count;
        self
    }

    pub fn directory_for(&self, id: &BlobId) -> PathBuf {
        let (outer, inner) = id.shard_path();
        self.root.join(outer).join(inner)
    }

    pub fn path_for(&self, id: &BlobId) -> PathBuf {
        self.directory_for(id).join(id.to_hex())
    }

    /// Staging path a transfer writes to before the checksum verifies.
    pub fn part_path_for(&self, id: &BlobId) -> PathBuf {
        self.directory_for(id)
            .join(format!("{}{PART_SUFFIX}", id.to_hex()))
    }

    pub async fn count_files(&self) -> Result<u64, SyncError> {
        if self.fast_count {
            match self.count_with_find().await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    tracing::debug!(error = %e, "Fast file count unavailable, walking the tree");
                }
            }
        }
        self.ids(None)
            .try_fold(0u64, |count, _| async move { Ok(count + 1) })
            .await
    }

    async fn count_with_find(&self) -> io::Result<u64> {
        if !fs::try_exists(&self.root).await? {
            return Ok(0);
        }

        let name_pattern = "[0-9a-f]".repeat(BLOB_ID_HEX_LEN);
        let output = tokio::process::Command::new("find")
            .arg(&self.root)
            .args(["-mindepth", "3", "-maxdepth", "3", "-type", "f", "-name"])
            .arg(&name_pattern)
            .output()
            .await?;

        if !output.status.success() {
            return Err(io::Error::other(format!(
                "find exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let count = output
            .stdout
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl BlobStore for FsResolver {
    fn kind(&self) -> StoreKind {
        StoreKind::Filesystem
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    async fn count(&self) -> Result<u64, SyncError> {
        self.count_files().await
    }

    async fn exists(&self, id: &BlobId) -> Result<bool, SyncError> {
        match fs::symlink_metadata(self.path_for(id)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ids(&self, start: Option<BlobId>) -> IdStream<'_> {
        ShardWalk::new(self.root.clone(), start, false).into_stream()
    }

    async fn last_id(&self) -> Result<Option<BlobId>, SyncError> {
        let mut walk = ShardWalk::new(self.root.clone(), None, true);
        walk.next().await
    }

    async fn authoritative_checksum(&self, _id: &BlobId) -> Result<Option<String>, SyncError> {
        Ok(None)
    }

    async fn open_read(&self, id: &BlobId) -> Result<ByteStream, SyncError> {
        let file = File::open(self.path_for(id)).await?;
        Ok(ReaderStream::new(file).map_err(SyncError::from).boxed())
    }

    fn staging_location(&self, id: &BlobId) -> String {
        self.part_path_for(id).display().to_string()
    }

    async fn create_writer(&self, id: &BlobId) -> Result<Box<dyn BlobWriter>, SyncError> {
        fs::create_dir_all(self.directory_for(id)).await?;

        let part_path = self.part_path_for(id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part_path)
            .await?;

        Ok(Box::new(FsWriter {
            file: Some(file),
            part_path,
            final_path: self.path_for(id),
            written: 0,
        }))
    }

    async fn discard_partial(&self, id: &BlobId) -> Result<bool, SyncError> {
        match fs::remove_file(self.part_path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes to `<id>.part` and renames onto `<id>` on commit.
struct FsWriter {
    file: Option<File>,
    part_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

impl FsWriter {
    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("write after finish"))
    }
}

#[async_trait]
impl BlobWriter for FsWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), SyncError> {
        self.file()?.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn finish(&mut self, _metadata: &ObjectMetadata) -> Result<u64, SyncError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(self.written)
    }

    async fn commit(self: Box<Self>) -> Result<(), SyncError> {
        let FsWriter {
            file,
            part_path,
            final_path,
            ..
        } = *self;
        drop(file);
        if let Err(e) = fs::rename(&part_path, &final_path).await {
            let _ = fs::remove_file(&part_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn discard(self: Box<Self>) -> bool {
        let FsWriter {
            file, part_path, ..
        } = *self;
        drop(file);
        match fs::remove_file(&part_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(path = %part_path.display(), error = %e, "Failed to remove partial file");
                false
            }
        }
    }
}

fn is_shard_name(name: &str) -> bool {
    name.len() == 2
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Sorted names of shard subdirectories of `dir`. A missing directory is empty.
async fn list_shards(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if is_shard_name(&name) && entry.file_type().await?.is_dir() {
            names.push(name);
        }
    }
    names.sort_unstable();
    Ok(names)
}

/// Sorted identifiers of regular files in the shard directory `dir`, whose
/// canonical names start with `prefix`.
async fn list_entries(dir: &Path, prefix: &str) -> io::Result<Vec<BlobId>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Ok(id) = BlobId::parse(name) else {
            continue;
        };
        if name != id.to_hex() || !name.starts_with(prefix) {
            continue;
        }
        if entry.file_type().await?.is_file() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Lazy ordered traversal of the shard tree: outer directories, then inner
/// directories, then files, each sorted by name. Directories are only read
/// when the walk reaches them.
struct ShardWalk {
    root: PathBuf,
    start: Option<BlobId>,
    descending: bool,
    outers: Option<VecDeque<String>>,
    inners: VecDeque<(PathBuf, String)>,
    files: VecDeque<BlobId>,
}

impl ShardWalk {
    fn new(root: PathBuf, start: Option<BlobId>, descending: bool) -> Self {
        Self {
            root,
            start,
            descending,
            outers: None,
            inners: VecDeque::new(),
            files: VecDeque::new(),
        }
    }

    /// The direction the walk moves in, expressed as the ordering an
    /// element must have relative to `start` to be visited.
    fn forward(&self) -> Ordering {
        if self.descending {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Whether a shard whose names spell `prefix` can hold entries past `start`.
    fn shard_in_range(&self, prefix: &str) -> bool {
        let Some(start) = self.start else {
            return true;
        };
        let start_hex = start.to_hex();
        let bound = &start_hex[..prefix.len()];
        prefix.cmp(bound) != self.forward().reverse()
    }

    fn id_in_range(&self, id: &BlobId) -> bool {
        match self.start {
            Some(start) => id.cmp(&start) == self.forward(),
            None => true,
        }
    }

    fn ordered<T>(&self, mut items: Vec<T>) -> VecDeque<T> {
        if self.descending {
            items.reverse();
        }
        items.into()
    }

    async fn next(&mut self) -> Result<Option<BlobId>, SyncError> {
        loop {
            if let Some(id) = self.files.pop_front() {
                return Ok(Some(id));
            }

            if let Some((dir, prefix)) = self.inners.pop_front() {
                let ids = list_entries(&dir, &prefix).await?;
                let ids = ids.into_iter().filter(|id| self.id_in_range(id)).collect();
                self.files = self.ordered(ids);
                continue;
            }

            if self.outers.is_none() {
                let outers = list_shards(&self.root).await?;
                let outers = outers
                    .into_iter()
                    .filter(|outer| self.shard_in_range(outer))
                    .collect();
                self.outers = Some(self.ordered(outers));
            }

            let Some(outer) = self.outers.as_mut().and_then(VecDeque::pop_front) else {
                return Ok(None);
            };
            let outer_dir = self.root.join(&outer);
            let inners = list_shards(&outer_dir).await?;
            let inners = inners
                .into_iter()
                .map(|inner| format!("{outer}{inner}"))
                .filter(|prefix| self.shard_in_range(prefix))
                .map(|prefix| (outer_dir.join(&prefix[2..]), prefix))
                .collect();
            self.inners = self.ordered(inners);
        }
    }

    fn into_stream(self) -> IdStream<'static> {
        stream::try_unfold(self, |mut walk| async move {
            let next = walk.next().await?;
            Ok(next.map(|id| (id, walk)))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> BlobId {
        BlobId::parse(s).unwrap()
    }

    fn place(root: &Path, id: &BlobId, contents: &[u8]) {
        let resolver = FsResolver::new(root);
        std::fs::create_dir_all(resolver.directory_for(id)).unwrap();
        std::fs::write(resolver.path_for(id), contents).unwrap();
    }

    async fn collect(resolver: &FsResolver, start: Option<BlobId>) -> Vec<BlobId> {
        resolver.ids(start).try_collect().await.unwrap()
    }

    fn sample_ids() -> Vec<BlobId> {
        vec![
            id("0a0b00000000000000000001"),
            id("0a0b00000000000000000002"),
            id("0a0c00000000000000000000"),
            id("1f0000000000000000000000"),
            id("ff0100000000000000000000"),
        ]
    }

    #[test]
    fn test_path_for_is_sharded() {
        let resolver = FsResolver::new("/mirror");
        let id = id("5f1d7a2b9c8e7d6f5a4b3c2d");
        assert_eq!(
            resolver.path_for(&id),
            PathBuf::from("/mirror/5f/1d/5f1d7a2b9c8e7d6f5a4b3c2d")
        );
        assert_eq!(
            resolver.part_path_for(&id),
            PathBuf::from("/mirror/5f/1d/5f1d7a2b9c8e7d6f5a4b3c2d.part")
        );
    }

    #[tokio::test]
    async fn test_walk_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let ids = sample_ids();
        for id in ids.iter().rev() {
            place(dir.path(), id, b"x");
        }
        let resolver = FsResolver::new(dir.path());
        assert_eq!(collect(&resolver, None).await, ids);
        assert_eq!(resolver.count_files().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_walk_resumes_after_start() {
        let dir = tempfile::tempdir().unwrap();
        let ids = sample_ids();
        for id in &ids {
            place(dir.path(), id, b"x");
        }
        let resolver = FsResolver::new(dir.path());

        assert_eq!(collect(&resolver, Some(ids[1])).await, ids[2..].to_vec());
        assert_eq!(collect(&resolver, Some(ids[4])).await, Vec::<BlobId>::new());

        // A start that is not itself present still bounds the walk.
        let between = id("0b0000000000000000000000");
        assert_eq!(collect(&resolver, Some(between)).await, ids[3..].to_vec());
    }

    #[tokio::test]
    async fn test_last_id_descends() {
        let dir = tempfile::tempdir().unwrap();
        let ids = sample_ids();
        for id in &ids {
            place(dir.path(), id, b"x");
        }
        // Empty shard directories above the highest entry are skipped.
        std::fs::create_dir_all(dir.path().join("ff").join("ff")).unwrap();

        let resolver = FsResolver::new(dir.path());
        assert_eq!(resolver.last_id().await.unwrap(), Some(ids[4]));
    }

    #[tokio::test]
    async fn test_empty_and_missing_roots() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new(dir.path());
        assert_eq!(resolver.last_id().await.unwrap(), None);
        assert_eq!(resolver.count_files().await.unwrap(), 0);

        let missing = FsResolver::new(dir.path().join("nope"));
        assert_eq!(missing.last_id().await.unwrap(), None);
        assert_eq!(missing.count_files().await.unwrap(), 0);
        assert!(collect(&missing, None).await.is_empty());
    }

    #[tokio::test]
    async fn test_strays_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let good = id("0a0b00000000000000000001");
        place(dir.path(), &good, b"x");

        let shard = dir.path().join("0a").join("0b");
        std::fs::write(shard.join("0a0b00000000000000000009.part"), b"partial").unwrap();
        std::fs::write(shard.join("notes.txt"), b"hi").unwrap();
        // Canonical name in the wrong shard.
        std::fs::write(shard.join("1f0000000000000000000000"), b"misplaced").unwrap();
        // Upper-case names are not canonical.
        std::fs::write(shard.join("0A0B00000000000000000002"), b"shouty").unwrap();
        // Directory named like an entry.
        std::fs::create_dir(shard.join("0a0b00000000000000000003")).unwrap();
        std::fs::create_dir_all(dir.path().join("zz").join("0b")).unwrap();
        std::fs::write(dir.path().join(".gridmirror-transfer.json"), b"{}").unwrap();

        let resolver = FsResolver::new(dir.path());
        assert_eq!(collect(&resolver, None).await, vec![good]);
        assert_eq!(resolver.count_files().await.unwrap(), 1);
        assert!(!resolver
            .exists(&id("0a0b00000000000000000003"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fast_count_matches_walk() {
        let dir = tempfile::tempdir().unwrap();
        for id in sample_ids() {
            place(dir.path(), &id, b"x");
        }
        std::fs::write(
            dir.path().join("0a").join("0b").join("0a0b00000000000000000009.part"),
            b"partial",
        )
        .unwrap();

        let resolver = FsResolver::new(dir.path()).with_fast_count(true);
        assert_eq!(resolver.count_files().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_exists() {
        let dir = tempfile::tempdir().unwrap();
        let present = id("5f1d7a2b9c8e7d6f5a4b3c2d");
        place(dir.path(), &present, b"x");
        let resolver = FsResolver::new(dir.path());

        assert!(resolver.exists(&present).await.unwrap());
        assert!(!resolver
            .exists(&id("5f1d7a2b9c8e7d6f5a4b3c2e"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_writer_stages_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new(dir.path());
        let id = id("5f1d7a2b9c8e7d6f5a4b3c2d");

        let mut writer = resolver.create_writer(&id).await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"mirror").await.unwrap();
        assert_eq!(writer.finish(&ObjectMetadata::default()).await.unwrap(), 12);

        assert!(resolver.part_path_for(&id).exists());
        assert!(!resolver.exists(&id).await.unwrap());

        writer.commit().await.unwrap();
        assert!(!resolver.part_path_for(&id).exists());
        assert_eq!(std::fs::read(resolver.path_for(&id)).unwrap(), b"hello mirror");
    }

    #[tokio::test]
    async fn test_writer_discard_removes_part() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new(dir.path());
        let id = id("5f1d7a2b9c8e7d6f5a4b3c2d");

        let mut writer = resolver.create_writer(&id).await.unwrap();
        writer.write(b"half").await.unwrap();
        assert!(writer.discard().await);

        assert!(!resolver.part_path_for(&id).exists());
        assert!(!resolver.exists(&id).await.unwrap());
        assert!(!resolver.discard_partial(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_read() {
        let dir = tempfile::tempdir().unwrap();
        let id = id("5f1d7a2b9c8e7d6f5a4b3c2d");
        place(dir.path(), &id, b"stored bytes");
        let resolver = FsResolver::new(dir.path());

        let chunks: Vec<bytes::Bytes> = resolver
            .open_read(&id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"stored bytes");
        assert!(resolver.authoritative_checksum(&id).await.unwrap().is_none());
    }
}
