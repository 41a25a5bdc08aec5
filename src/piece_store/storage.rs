use crate::metainfo::FileEntry;
use crate::prelude::*;
use std::io::SeekFrom;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// finds the file holding byte `offset` of the piece-indexed stream, and where in that file it is.
pub fn locate(files: &[FileEntry], offset: u64) -> Option<(usize, u64)> {
    // zero length files never contain a byte, so they are skipped naturally.
    files
        .iter()
        .position(|file| offset >= file.start && offset < file.start + file.length)
        .map(|index| (index, offset - files[index].start))
}

/// the open, pre-sized backing files of one torrent, in metadata order.
#[derive(Debug)]
pub struct TorrentFiles {
    entries: Vec<FileEntry>,
    handles: Vec<File>,
}

impl TorrentFiles {
    /// opens every file for random access, creating missing files (and their directories) at
    /// their declared length.
    pub async fn open(entries: &[FileEntry]) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(entries.len());

        for entry in entries {
            if let Some(parent) = entry.path.parent() {
                fs::create_dir_all(parent).await?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&entry.path)
                .await
                .inspect_err(|err| error!(path = %entry.path.display(), %err, "failed to open file"))?;

            if file.metadata().await?.len() != entry.length {
                debug!(path = %entry.path.display(), length = entry.length, "sizing file");
                file.set_len(entry.length).await?;
            }
            handles.push(file);
        }

        Ok(Self {
            entries: entries.to_vec(),
            handles,
        })
    }

    /// reads `length` bytes starting at `offset`, continuing into later files as needed.
    pub async fn read_at(&mut self, offset: u64, length: usize) -> std::io::Result<Vec<u8>> {
        let mut buffer = vec![0; length];
        let mut filled = 0;
        let (mut index, mut file_offset) = self.locate_or_eof(offset, length)?;

        while filled < length {
            let available = (self.entries[index].length - file_offset) as usize;
            let chunk = available.min(length - filled);

            let file = &mut self.handles[index];
            file.seek(SeekFrom::Start(file_offset)).await?;
            file.read_exact(&mut buffer[filled..filled + chunk]).await?;

            filled += chunk;
            index += 1;
            file_offset = 0;
            if filled < length && index >= self.entries.len() {
                return Err(past_end());
            }
        }

        Ok(buffer)
    }

    /// writes `data` starting at `offset`, splitting it over every file it straddles.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        let (mut index, mut file_offset) = self.locate_or_eof(offset, data.len())?;

        while written < data.len() {
            let available = (self.entries[index].length - file_offset) as usize;
            let chunk = available.min(data.len() - written);

            let file = &mut self.handles[index];
            file.seek(SeekFrom::Start(file_offset)).await?;
            file.write_all(&data[written..written + chunk]).await?;
            // tokio files write in the background, flush to surface errors here.
            file.flush().await?;

            written += chunk;
            index += 1;
            file_offset = 0;
            if written < data.len() && index >= self.entries.len() {
                return Err(past_end());
            }
        }

        Ok(())
    }

    pub async fn close(self) -> std::io::Result<()> {
        for mut handle in self.handles {
            handle.flush().await?;
            handle.sync_all().await?;
        }
        Ok(())
    }

    fn locate_or_eof(&self, offset: u64, length: usize) -> std::io::Result<(usize, u64)> {
        if length == 0 {
            return Ok((0, 0));
        }
        locate(&self.entries, offset).ok_or_else(past_end)
    }
}

fn past_end() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "range extends past the end of the torrent",
    )
}
