/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Append-only block containers.
//!
//! A [`BlockPile`] stores serialized blocks by height, starting at height 1. The chain store appends to
//! the pile *before* it commits the matching key-value batch, so after a crash the pile may be ahead
//! of the key-value store but never behind it.
//!
//! ## File layout
//!
//! [`FilePile`] keeps one chunk file per `chunk_unit` consecutive heights. A chunk starts with a
//! fixed header, followed by an offset table with one 8-byte slot per height, followed by the block
//! payloads:
//!
//! ```text
//!  0          4           8         12                44              44 + 8·chunk_unit
//!  +----------+-----------+----------+----------------+------------------+-----------------
//!  | head u32 | begin u32 | end u32  | genesis hash   | end offsets u64  | block payloads
//!  +----------+-----------+----------+----------------+------------------+-----------------
//! ```
//!
//! All integers are little-endian. An offset slot holds the absolute end offset of its block in the
//! file; zero means the height has not been written.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::types::data_types::Hash256;

pub trait BlockPile: Send + Sync + 'static {
    /// Record the genesis hash. Fails if the pile already belongs to a different genesis.
    fn init(&self, genesis_hash: &Hash256) -> Result<(), PileError>;

    /// Append the serialized block at `height`, which must be exactly one above the pile's height.
    fn append(&self, height: u32, block: &[u8]) -> Result<(), PileError>;

    fn get(&self, height: u32) -> Result<Option<Vec<u8>>, PileError>;

    /// Height of the highest stored block. Zero if empty.
    fn height(&self) -> u32;
}

#[derive(Debug, thiserror::Error)]
pub enum PileError {
    #[error("pile I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("pile is corrupted: {0}")]
    Corrupted(String),
    #[error("cannot append height {found} to a pile at height {head}")]
    HeightOutOfRange { head: u32, found: u32 },
    #[error("pile belongs to a different genesis")]
    GenesisMismatch,
}

/// A volatile pile, for tests and for nodes that keep blocks elsewhere.
pub struct MemPile {
    inner: Mutex<MemPileInner>,
}

struct MemPileInner {
    genesis: Option<Hash256>,
    blocks: Vec<Vec<u8>>,
}

impl MemPile {
    pub fn new() -> MemPile {
        MemPile {
            inner: Mutex::new(MemPileInner {
                genesis: None,
                blocks: Vec::new(),
            }),
        }
    }
}

impl Default for MemPile {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockPile for MemPile {
    fn init(&self, genesis_hash: &Hash256) -> Result<(), PileError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.genesis {
            Some(existing) if existing != *genesis_hash => Err(PileError::GenesisMismatch),
            _ => {
                inner.genesis = Some(*genesis_hash);
                Ok(())
            }
        }
    }

    fn append(&self, height: u32, block: &[u8]) -> Result<(), PileError> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.blocks.len() as u32;
        if height != head + 1 {
            return Err(PileError::HeightOutOfRange { head, found: height });
        }
        inner.blocks.push(block.to_vec());
        Ok(())
    }

    fn get(&self, height: u32) -> Result<Option<Vec<u8>>, PileError> {
        if height == 0 {
            return Ok(None);
        }
        Ok(self.inner.lock().unwrap().blocks.get(height as usize - 1).cloned())
    }

    fn height(&self) -> u32 {
        self.inner.lock().unwrap().blocks.len() as u32
    }
}

const HEADER_LEN: u64 = 44;
const OFFSET_STRIDE: u64 = 8;

/// A pile of chunk files in a directory.
pub struct FilePile {
    dir: PathBuf,
    chunk_unit: u32,
    state: Mutex<FilePileState>,
}

struct FilePileState {
    genesis: Option<Hash256>,
    head: u32,
}

impl FilePile {
    /// Open (or create) the pile in `dir`, recovering its head height from the newest chunk.
    pub fn open(dir: impl AsRef<Path>, chunk_unit: u32) -> Result<FilePile, PileError> {
        if chunk_unit == 0 {
            return Err(PileError::Corrupted("chunk unit must be positive".to_string()));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut newest: Option<u32> = None;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let Some(begin) = name
                .to_str()
                .and_then(|name| name.strip_prefix("chunk_"))
                .and_then(|name| name.strip_suffix(".pile"))
                .and_then(|begin| begin.parse::<u32>().ok())
            else {
                continue;
            };
            newest = Some(newest.map_or(begin, |newest| newest.max(begin)));
        }

        let mut state = FilePileState {
            genesis: None,
            head: 0,
        };
        if let Some(begin) = newest {
            let mut file = File::open(chunk_path(&dir, begin))?;
            let header = read_chunk_header(&mut file)?;
            if header.begin != begin {
                return Err(PileError::Corrupted(format!(
                    "chunk {} declares begin height {}",
                    begin, header.begin
                )));
            }
            state.genesis = Some(header.genesis);
            // A chunk created right before a crash has no blocks yet.
            state.head = header.head.max(begin - 1);
        }

        Ok(FilePile {
            dir,
            chunk_unit,
            state: Mutex::new(state),
        })
    }

    fn chunk_begin(&self, height: u32) -> u32 {
        ((height - 1) / self.chunk_unit) * self.chunk_unit + 1
    }

    fn data_start(&self) -> u64 {
        HEADER_LEN + OFFSET_STRIDE * self.chunk_unit as u64
    }

    fn create_chunk(&self, begin: u32, genesis: &Hash256) -> Result<File, PileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(chunk_path(&self.dir, begin))?;
        let mut header = Vec::with_capacity(self.data_start() as usize);
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&begin.to_le_bytes());
        header.extend_from_slice(&(begin + self.chunk_unit - 1).to_le_bytes());
        header.extend_from_slice(genesis.bytes());
        header.resize(self.data_start() as usize, 0);
        file.write_all(&header)?;
        Ok(file)
    }
}

impl BlockPile for FilePile {
    fn init(&self, genesis_hash: &Hash256) -> Result<(), PileError> {
        let mut state = self.state.lock().unwrap();
        match state.genesis {
            Some(existing) if existing != *genesis_hash => Err(PileError::GenesisMismatch),
            _ => {
                state.genesis = Some(*genesis_hash);
                Ok(())
            }
        }
    }

    fn append(&self, height: u32, block: &[u8]) -> Result<(), PileError> {
        let mut state = self.state.lock().unwrap();
        if height != state.head + 1 {
            return Err(PileError::HeightOutOfRange {
                head: state.head,
                found: height,
            });
        }
        let genesis = state.genesis.ok_or_else(|| {
            PileError::Corrupted("append before the genesis hash is known".to_string())
        })?;

        let begin = self.chunk_begin(height);
        let mut file = if height == begin {
            self.create_chunk(begin, &genesis)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(chunk_path(&self.dir, begin))?
        };

        let start = file.seek(SeekFrom::End(0))?;
        file.write_all(block)?;
        let end = start + block.len() as u64;

        file.seek(SeekFrom::Start(
            HEADER_LEN + OFFSET_STRIDE * (height - begin) as u64,
        ))?;
        file.write_all(&end.to_le_bytes())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&height.to_le_bytes())?;
        file.sync_data()?;

        state.head = height;
        Ok(())
    }

    fn get(&self, height: u32) -> Result<Option<Vec<u8>>, PileError> {
        if height == 0 || height > self.height() {
            return Ok(None);
        }
        let begin = self.chunk_begin(height);
        let mut file = File::open(chunk_path(&self.dir, begin))?;
        let index = (height - begin) as u64;

        let start = if index == 0 {
            self.data_start()
        } else {
            read_offset(&mut file, index - 1)?
        };
        let end = read_offset(&mut file, index)?;
        if end < start {
            return Err(PileError::Corrupted(format!(
                "offsets of height {} are out of order",
                height
            )));
        }

        let mut block = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut block)?;
        Ok(Some(block))
    }

    fn height(&self) -> u32 {
        self.state.lock().unwrap().head
    }
}

struct ChunkHeader {
    head: u32,
    begin: u32,
    genesis: Hash256,
}

fn chunk_path(dir: &Path, begin: u32) -> PathBuf {
    dir.join(format!("chunk_{:010}.pile", begin))
}

fn read_chunk_header(file: &mut File) -> Result<ChunkHeader, PileError> {
    let mut bytes = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut bytes)?;
    let mut genesis = [0u8; 32];
    genesis.copy_from_slice(&bytes[12..44]);
    Ok(ChunkHeader {
        head: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        begin: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        genesis: Hash256::new(genesis),
    })
}

fn read_offset(file: &mut File, index: u64) -> Result<u64, PileError> {
    let mut bytes = [0u8; 8];
    file.seek(SeekFrom::Start(HEADER_LEN + OFFSET_STRIDE * index))?;
    file.read_exact(&mut bytes)?;
    match u64::from_le_bytes(bytes) {
        0 => Err(PileError::Corrupted(format!(
            "missing offset at index {}",
            index
        ))),
        offset => Ok(offset),
    }
}
