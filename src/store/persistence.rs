//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailstore.
//
// Mailstore is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailstore is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Mailstore. If not, see <http://www.gnu.org/licenses/>.

//! The interface through which folder stores load and save their data, and
//! two implementations of it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::block::DirtyBlocks;
use super::model::*;
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::safe_name::is_safe_name;

/// Everything a folder store needs written out in one save.
#[derive(Clone, Debug)]
pub struct PersistenceInfo {
    pub folder: FolderId,
    pub state: FolderState,
    pub header_blocks: DirtyBlocks<HeaderInfo>,
    pub body_blocks: DirtyBlocks<BodyInfo>,
}

/// Storage for folder states and blocks.
///
/// Loads which cannot find the requested block return `Ok(None)`. The store
/// treats that, as well as errors, as a permanent miss; retrying is up to
/// the implementation.
#[async_trait(?Send)]
pub trait Persistence {
    async fn load_header_block(
        &self,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<HeaderInfo>>, Error>;

    async fn load_body_block(
        &self,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<BodyInfo>>, Error>;

    /// Write the given folder states and blocks as a single transaction.
    async fn save_folder_states(
        &self,
        batch: Vec<PersistenceInfo>,
    ) -> Result<(), Error>;
}

/// Keeps everything in memory, CBOR-encoded so that every load produces a
/// fresh copy.
///
/// Each load suspends once before completing, so callers observe the same
/// interleavings as with real storage.
#[derive(Default)]
pub struct MemoryPersistence {
    blocks: RefCell<HashMap<(FolderId, BlockKind, BlockId), Vec<u8>>>,
    states: RefCell<HashMap<FolderId, Vec<u8>>>,
    loads: Cell<usize>,
    saves: Cell<usize>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_folder_state(
        &self,
        folder: &FolderId,
    ) -> Result<Option<FolderState>, Error> {
        match self.states.borrow().get(folder) {
            None => Ok(None),
            Some(data) => Ok(Some(serde_cbor::from_slice(data)?)),
        }
    }

    /// The number of block loads requested so far.
    pub fn load_count(&self) -> usize {
        self.loads.get()
    }

    /// The number of save transactions so far.
    pub fn save_count(&self) -> usize {
        self.saves.get()
    }

    /// Whether the given block is currently stored.
    pub fn has_block(
        &self,
        folder: &FolderId,
        kind: BlockKind,
        block_id: BlockId,
    ) -> bool {
        self.blocks
            .borrow()
            .contains_key(&(folder.clone(), kind, block_id))
    }

    /// Lose the given block, as if storage had been damaged.
    pub fn forget_block(
        &self,
        folder: &FolderId,
        kind: BlockKind,
        block_id: BlockId,
    ) -> bool {
        self.blocks
            .borrow_mut()
            .remove(&(folder.clone(), kind, block_id))
            .is_some()
    }

    async fn load<E: DeserializeOwned>(
        &self,
        folder: &FolderId,
        kind: BlockKind,
        block_id: BlockId,
    ) -> Result<Option<Block<E>>, Error> {
        self.loads.set(self.loads.get() + 1);
        tokio::task::yield_now().await;

        let blocks = self.blocks.borrow();
        match blocks.get(&(folder.clone(), kind, block_id)) {
            None => Ok(None),
            Some(data) => Ok(Some(serde_cbor::from_slice(data)?)),
        }
    }

    fn store<E: Serialize>(
        &self,
        folder: &FolderId,
        kind: BlockKind,
        blocks: &DirtyBlocks<E>,
    ) -> Result<(), Error> {
        let mut stored = self.blocks.borrow_mut();
        for (&block_id, block) in blocks {
            let key = (folder.clone(), kind, block_id);
            match *block {
                Some(ref block) => {
                    stored.insert(key, serde_cbor::to_vec(block)?);
                },
                None => {
                    stored.remove(&key);
                },
            }
        }

        Ok(())
    }
}

#[async_trait(?Send)]
impl Persistence for MemoryPersistence {
    async fn load_header_block(
        &self,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<HeaderInfo>>, Error> {
        self.load(folder, BlockKind::Header, block_id).await
    }

    async fn load_body_block(
        &self,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<BodyInfo>>, Error> {
        self.load(folder, BlockKind::Body, block_id).await
    }

    async fn save_folder_states(
        &self,
        batch: Vec<PersistenceInfo>,
    ) -> Result<(), Error> {
        self.saves.set(self.saves.get() + 1);
        for info in &batch {
            self.store(&info.folder, BlockKind::Header, &info.header_blocks)?;
            self.store(&info.folder, BlockKind::Body, &info.body_blocks)?;
            self.states
                .borrow_mut()
                .insert(info.folder.clone(), serde_cbor::to_vec(&info.state)?);
        }

        Ok(())
    }
}

/// Stores each folder in its own directory beneath a root directory.
///
/// The layout is `<root>/<account>/<folder>/`, containing `folder.cbor` for
/// the folder state and `h<id>.cbor` or `b<id>.cbor` for each block. Every
/// file is replaced atomically. Blocks are written before the folder state,
/// so an interrupted save leaves the previous state pointing at blocks which
/// still exist or have been replaced by newer versions.
pub struct DirPersistence {
    root: PathBuf,
    tmp: PathBuf,
}

impl DirPersistence {
    /// Open the store rooted at `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let tmp = root.join(".tmp");
        fs::create_dir_all(&tmp)?;
        Ok(Self { root, tmp })
    }

    fn folder_dir(&self, folder: &FolderId) -> Result<PathBuf, Error> {
        let account = folder.account();
        let name = folder.folder();
        if !is_safe_name(account) || !is_safe_name(name) {
            return Err(Error::UnsafeName);
        }

        Ok(self.root.join(account).join(name))
    }

    fn block_path(
        &self,
        folder: &FolderId,
        kind: BlockKind,
        block_id: BlockId,
    ) -> Result<PathBuf, Error> {
        let prefix = match kind {
            BlockKind::Header => 'h',
            BlockKind::Body => 'b',
        };
        Ok(self
            .folder_dir(folder)?
            .join(format!("{}{}.cbor", prefix, block_id)))
    }

    /// Read the last saved state of `folder`, if it has ever been saved.
    pub fn load_folder_state(
        &self,
        folder: &FolderId,
    ) -> Result<Option<FolderState>, Error> {
        let path = self.folder_dir(folder)?.join("folder.cbor");
        read_cbor(path)
    }

    fn load<E: DeserializeOwned>(
        &self,
        folder: &FolderId,
        kind: BlockKind,
        block_id: BlockId,
    ) -> Result<Option<Block<E>>, Error> {
        read_cbor(self.block_path(folder, kind, block_id)?)
    }

    fn store<E: Serialize>(
        &self,
        folder: &FolderId,
        kind: BlockKind,
        blocks: &DirtyBlocks<E>,
    ) -> Result<(), Error> {
        for (&block_id, block) in blocks {
            let path = self.block_path(folder, kind, block_id)?;
            match *block {
                Some(ref block) => file_ops::spit(
                    &self.tmp,
                    path,
                    &serde_cbor::to_vec(block)?,
                )?,
                None => file_ops::remove_if_exists(path)?,
            }
        }

        Ok(())
    }
}

fn read_cbor<T: DeserializeOwned>(path: PathBuf) -> Result<Option<T>, Error> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_cbor::from_slice(&data)?)),
        Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait(?Send)]
impl Persistence for DirPersistence {
    async fn load_header_block(
        &self,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<HeaderInfo>>, Error> {
        self.load(folder, BlockKind::Header, block_id)
    }

    async fn load_body_block(
        &self,
        folder: &FolderId,
        block_id: BlockId,
    ) -> Result<Option<Block<BodyInfo>>, Error> {
        self.load(folder, BlockKind::Body, block_id)
    }

    async fn save_folder_states(
        &self,
        batch: Vec<PersistenceInfo>,
    ) -> Result<(), Error> {
        for info in &batch {
            fs::create_dir_all(self.folder_dir(&info.folder)?)?;
            self.store(&info.folder, BlockKind::Header, &info.header_blocks)?;
            self.store(&info.folder, BlockKind::Body, &info.body_blocks)?;
        }

        for info in &batch {
            let path = self.folder_dir(&info.folder)?.join("folder.cbor");
            file_ops::spit(&self.tmp, path, &serde_cbor::to_vec(&info.state)?)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::*;
    use crate::store::test_support::*;

    fn sample_info(folder: &FolderId) -> PersistenceInfo {
        let mut state = FolderState::new(
            FolderMeta::new(folder.clone(), "Inbox", FolderType::Inbox),
            false,
        );
        state.next_id = 7;

        let mut header_blocks = BTreeMap::new();
        header_blocks.insert(
            BlockId(0),
            Some(Block {
                entries: vec![header(folder, 1000, 3)],
            }),
        );
        let mut body_blocks = BTreeMap::new();
        body_blocks.insert(BlockId(4), None);

        PersistenceInfo {
            folder: folder.clone(),
            state,
            header_blocks,
            body_blocks,
        }
    }

    #[test]
    fn memory_round_trip() {
        run(async {
            let persistence = MemoryPersistence::new();
            let folder = FolderId::new("acct", "0");
            let info = sample_info(&folder);
            let expected_header = info.header_blocks[&BlockId(0)].clone();
            let expected_state = info.state.clone();

            persistence.save_folder_states(vec![info]).await.unwrap();
            assert_eq!(1, persistence.save_count());
            assert_eq!(
                Some(expected_state),
                persistence.load_folder_state(&folder).unwrap()
            );
            assert_eq!(
                expected_header,
                persistence
                    .load_header_block(&folder, BlockId(0))
                    .await
                    .unwrap()
            );
            assert!(persistence
                .load_body_block(&folder, BlockId(4))
                .await
                .unwrap()
                .is_none());
            assert_eq!(2, persistence.load_count());

            assert!(persistence.forget_block(
                &folder,
                BlockKind::Header,
                BlockId(0)
            ));
            assert!(!persistence.has_block(
                &folder,
                BlockKind::Header,
                BlockId(0)
            ));
        });
    }

    #[test]
    fn dir_round_trip() {
        run(async {
            let root = TempDir::new().unwrap();
            let persistence = DirPersistence::new(root.path()).unwrap();
            let folder = FolderId::new("acct", "0");
            let mut info = sample_info(&folder);
            let expected_header = info.header_blocks[&BlockId(0)].clone();
            let expected_state = info.state.clone();

            // Stage a body block so that the deletion has something to do
            info.body_blocks.insert(
                BlockId(4),
                Some(Block {
                    entries: vec![BodyInfo::new(
                        expected_header.as_ref().unwrap().entries[0].date,
                        MessageId(3),
                    )],
                }),
            );
            persistence
                .save_folder_states(vec![info.clone()])
                .await
                .unwrap();
            assert!(persistence
                .load_body_block(&folder, BlockId(4))
                .await
                .unwrap()
                .is_some());

            info.body_blocks.insert(BlockId(4), None);
            persistence.save_folder_states(vec![info]).await.unwrap();

            assert!(root.path().join("acct/0/folder.cbor").is_file());
            assert!(root.path().join("acct/0/h0.cbor").is_file());
            assert!(!root.path().join("acct/0/b4.cbor").exists());

            assert_eq!(
                Some(expected_state),
                persistence.load_folder_state(&folder).unwrap()
            );
            assert_eq!(
                expected_header,
                persistence
                    .load_header_block(&folder, BlockId(0))
                    .await
                    .unwrap()
            );
            assert!(persistence
                .load_body_block(&folder, BlockId(4))
                .await
                .unwrap()
                .is_none());
            assert_eq!(
                None,
                persistence
                    .load_folder_state(&FolderId::new("acct", "1"))
                    .unwrap()
            );
        });
    }

    #[test]
    fn dir_rejects_unsafe_names() {
        let root = TempDir::new().unwrap();
        let persistence = DirPersistence::new(root.path()).unwrap();
        assert_matches!(
            Err(Error::UnsafeName),
            persistence.load_folder_state(&FolderId::new("acct", ".."))
        );
        assert_matches!(
            Err(Error::UnsafeName),
            persistence.load_folder_state(&FolderId("nofolder".to_owned()))
        );
    }
}
