//! Read-only access to an APFS container: checkpoint selection, the object
//! map, one or more volumes, their file-system trees, and (when a volume is
//! encrypted) the password/recovery-password unlock path.
//!
//! The entry point is [`Container::open`], which accepts anything
//! implementing [`BlockDevice`] — or, for the common case of a single
//! `Read + Seek` handle, [`Container::open_reader`]. From there,
//! [`Container::volume`] hands out a [`Volume`], and [`Volume::root`] /
//! [`Volume::lookup`] / [`Volume::by_identifier`] hand out [`FileEntry`]
//! handles for reading file data and metadata.

pub mod block;
pub mod btree;
pub mod catalog;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod extents;
pub mod fletcher;
pub mod keybag;
pub mod name;
pub mod object;
pub mod omap;
pub mod snapshot;
pub mod superblock;

pub use error::{ApfsError, Result};
pub use block::{BlockDevice, ReaderDevice, TraceSink};
pub use keybag::SecretBytes;
pub use snapshot::SnapshotInfo;

use std::io::{Read, Seek};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use btree::OidResolver;
use catalog::{DstreamAttr, InodeVal, XattrStreamRef, XattrVal};
use compress::{CompressedReader, DecmpfsHeader};
use crypto::XtsContext;
use extents::ExtentMap;
use keybag::{CredentialKind, Keybag};
use omap::{ObjectMap, Omap};
use superblock::{ApfsSuperblock, NxSuperblock};

/// A password or recovery-password credential for unlocking an encrypted
/// volume. Wraps [`SecretBytes`] so the plaintext zeroizes on drop either
/// way, whether the caller builds one directly or via the convenience
/// constructors.
pub enum Credential {
    Password(SecretBytes),
    RecoveryPassword(SecretBytes),
}

impl Credential {
    pub fn password(bytes: impl Into<Vec<u8>>) -> Self {
        Credential::Password(SecretBytes::new(bytes.into()))
    }

    pub fn recovery_password(bytes: impl Into<Vec<u8>>) -> Self {
        Credential::RecoveryPassword(SecretBytes::new(bytes.into()))
    }
}

/// An open APFS container: the selected checkpoint's superblock, the
/// container object map, and (lazily) the container keybag. Cheap to keep
/// around — `Volume` handles borrow it rather than duplicating any of this
/// state.
pub struct Container<D: BlockDevice> {
    device: Arc<D>,
    nxsb: NxSuperblock,
    omap: ObjectMap,
    container_uuid: Uuid,
    keybag_location: Option<(u64, u32)>,
    keybag_cache: RwLock<Option<Arc<Keybag>>>,
    trace: Option<Box<dyn TraceSink>>,
}

impl<D: BlockDevice> Container<D> {
    /// Open a container: read block 0's superblock, scan the checkpoint
    /// descriptor area for the highest-XID valid checkpoint, and read the
    /// container object map it names.
    pub fn open(device: D) -> Result<Self> {
        Self::open_inner(device, None)
    }

    /// As [`Container::open`], but every internal decision point (checkpoint
    /// candidate selection, unlock attempts) is reported to `trace`.
    pub fn open_traced(device: D, trace: Box<dyn TraceSink>) -> Result<Self> {
        Self::open_inner(device, Some(trace))
    }

    fn open_inner(device: D, trace: Option<Box<dyn TraceSink>>) -> Result<Self> {
        let device = Arc::new(device);
        let nxsb0 = superblock::read_nxsb(device.as_ref())?;
        let (nxsb, _checkpoint_map) = superblock::scan_checkpoint(device.as_ref(), &nxsb0)?;
        if let Some(sink) = &trace {
            sink.trace(&format!("selected checkpoint at xid {}", nxsb.header.xid));
        }

        let omap = ObjectMap::read(device.as_ref(), nxsb.omap_oid, nxsb.block_size)?;
        let container_uuid = Uuid::from_bytes(nxsb.uuid);
        let keybag_location = if nxsb.keylocker_block != 0 && nxsb.keylocker_blocks != 0 {
            Some((nxsb.keylocker_block, nxsb.keylocker_blocks as u32))
        } else {
            None
        };

        Ok(Container {
            device,
            nxsb,
            omap,
            container_uuid,
            keybag_location,
            keybag_cache: RwLock::new(None),
            trace,
        })
    }

    /// Number of non-empty volume slots (`fs_oids`) in this container.
    pub fn volume_count(&self) -> usize {
        self.nxsb.number_of_volumes()
    }

    pub fn is_fusion(&self) -> bool {
        self.nxsb.is_fusion()
    }

    pub fn uuid(&self) -> Uuid {
        self.container_uuid
    }

    /// Open the `index`-th non-empty volume (1-based, in `fs_oids` order).
    pub fn volume(&self, index: usize) -> Result<Volume<'_, D>> {
        if index == 0 {
            return Err(ApfsError::NoVolume);
        }
        let vol_oid = self
            .nxsb
            .fs_oids
            .iter()
            .copied()
            .filter(|&oid| oid != 0)
            .nth(index - 1)
            .ok_or(ApfsError::NoVolume)?;

        let container_resolver = Omap::new(self.omap.tree_root, self.nxsb.block_size, self.nxsb.header.xid);
        let vol_block = container_resolver.lookup(self.device.as_ref(), vol_oid)?;
        let vol_block_data = object::read_block(self.device.as_ref(), vol_block, self.nxsb.block_size)?;
        let sb = ApfsSuperblock::parse(&vol_block_data)?;
        self.build_volume(sb)
    }

    fn build_volume(&self, sb: ApfsSuperblock) -> Result<Volume<'_, D>> {
        let vol_omap = ObjectMap::read(self.device.as_ref(), sb.omap_oid, self.nxsb.block_size)?;
        let target_xid = sb.header.xid;
        let catalog_resolver = Omap::new(vol_omap.tree_root, self.nxsb.block_size, target_xid);
        let catalog_root_block = catalog_resolver.lookup(self.device.as_ref(), sb.root_tree_oid)?;
        let locked = !sb.is_unencrypted();

        Ok(Volume {
            container: self,
            sb,
            vol_omap_tree_root: vol_omap.tree_root,
            target_xid,
            catalog_root_block,
            crypto: None,
            locked,
        })
    }

    /// Read and cache the container keybag on first use. Every volume
    /// handle derived from this container shares the one decrypted copy.
    fn container_keybag(&self) -> Result<Arc<Keybag>> {
        if let Some(kb) = self.keybag_cache.read().as_ref() {
            return Ok(kb.clone());
        }
        let mut guard = self.keybag_cache.write();
        if let Some(kb) = guard.as_ref() {
            return Ok(kb.clone());
        }
        let (block, blocks) = self
            .keybag_location
            .ok_or_else(|| ApfsError::NotFound("container has no key bag".into()))?;
        let kb = Arc::new(keybag::read_keybag(self.device.as_ref(), self.nxsb.block_size, block, blocks, &self.container_uuid)?);
        *guard = Some(kb.clone());
        Ok(kb)
    }
}

impl<R: Read + Seek + Send> Container<ReaderDevice<R>> {
    /// Convenience constructor for the common case: any `Read + Seek`
    /// handle (a file, a `Cursor<Vec<u8>>`), wrapped in [`ReaderDevice`].
    pub fn open_reader(reader: R) -> Result<Self> {
        Container::open(ReaderDevice::new(reader))
    }
}

/// One file-system volume within a container: its own superblock, object
/// map, catalog tree, and (if encrypted) decryption context. Borrows the
/// container's block device and object map rather than owning a second
/// handle to either.
pub struct Volume<'c, D: BlockDevice> {
    container: &'c Container<D>,
    sb: ApfsSuperblock,
    vol_omap_tree_root: u64,
    target_xid: u64,
    catalog_root_block: u64,
    crypto: Option<XtsContext>,
    locked: bool,
}

impl<'c, D: BlockDevice> Volume<'c, D> {
    pub fn name(&self) -> &str {
        &self.sb.volume_name
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.sb.uuid)
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.sb.is_case_insensitive()
    }

    pub fn is_encrypted(&self) -> bool {
        !self.sb.is_unencrypted()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn file_count(&self) -> u64 {
        self.sb.num_files
    }

    pub fn directory_count(&self) -> u64 {
        self.sb.num_directories
    }

    fn resolver(&self) -> Omap {
        Omap::new(self.vol_omap_tree_root, self.container.nxsb.block_size, self.target_xid)
    }

    fn device(&self) -> &dyn BlockDevice {
        self.container.device.as_ref()
    }

    fn block_size(&self) -> u32 {
        self.container.nxsb.block_size
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.locked {
            Err(ApfsError::Locked)
        } else {
            Ok(())
        }
    }

    /// Attempt to unlock this volume with a credential. An unencrypted
    /// volume always reports `true` without consulting any keybag. A bad
    /// password/recovery-password returns `Ok(false)` rather than an error;
    /// a malformed or missing keybag structure still surfaces as `Err`.
    pub fn unlock(&mut self, credential: Credential) -> Result<bool> {
        if self.sb.is_unencrypted() {
            self.locked = false;
            return Ok(true);
        }

        let container_keybag = self.container.container_keybag()?;
        let volume_uuid = self.uuid();
        let (secret, kind) = match &credential {
            Credential::Password(s) => (s, CredentialKind::Password),
            Credential::RecoveryPassword(s) => (s, CredentialKind::RecoveryPassword),
        };

        if let Some(sink) = &self.container.trace {
            sink.trace(&format!("attempting unlock of volume {volume_uuid}"));
        }

        let unwrap_result = keybag::unlock_vek(
            self.device(),
            self.block_size(),
            &container_keybag,
            &self.container.container_uuid,
            &volume_uuid,
            secret.as_bytes(),
            kind,
        );

        match unwrap_result {
            Ok(vek_bytes) => {
                let vek: [u8; 32] = vek_bytes
                    .as_bytes()
                    .try_into()
                    .map_err(|_| ApfsError::Malformed("unwrapped volume key is not 32 bytes".into()))?;
                self.crypto = Some(XtsContext::new(&vek));
                self.locked = false;
                Ok(true)
            }
            Err(ApfsError::BadCredential) | Err(ApfsError::Locked) => Ok(false),
            Err(other) => Err(other),
        }
    }

    pub fn root(&self) -> Result<FileEntry<'_, 'c, D>> {
        self.ensure_unlocked()?;
        self.by_identifier(catalog::ROOT_DIR_RECORD)
    }

    /// Look up a file-system object by its catalog identifier.
    pub fn by_identifier(&self, fsid: u64) -> Result<FileEntry<'_, 'c, D>> {
        self.ensure_unlocked()?;
        let resolver = self.resolver();
        let inode = catalog::lookup_inode(self.device(), self.catalog_root_block, self.block_size(), &resolver, fsid)?;
        let name = inode.name.clone().unwrap_or_default();
        Ok(FileEntry { volume: self, inode, oid: fsid, name })
    }

    /// Resolve a `/`-separated path from the volume root, honoring the
    /// volume's case-folding mode at each component.
    pub fn lookup(&self, path: &str) -> Result<FileEntry<'_, 'c, D>> {
        self.ensure_unlocked()?;

        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return self.root();
        }

        let resolver = self.resolver();
        let mut parent_oid = catalog::ROOT_DIR_RECORD;
        let mut current = None;

        for component in components {
            let drec = catalog::lookup_drec_by_name(
                self.device(),
                self.catalog_root_block,
                self.block_size(),
                &resolver,
                parent_oid,
                component,
                self.sb.is_case_insensitive(),
            )?;
            let inode = catalog::lookup_inode(self.device(), self.catalog_root_block, self.block_size(), &resolver, drec.file_id)?;
            parent_oid = drec.file_id;
            current = Some(FileEntry { volume: self, inode, oid: drec.file_id, name: component.to_string() });
        }

        current.ok_or_else(|| ApfsError::NotFound(path.to_string()))
    }

    /// Enumerate every snapshot recorded for this volume, oldest first.
    pub fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let resolver = self.resolver();
        let snap_tree_root = resolver.lookup(self.device(), self.sb.snap_meta_tree_oid)?;
        snapshot::list_snapshots(self.device(), snap_tree_root, self.block_size(), &resolver)
    }

    /// Open a volume exactly as it existed at a prior snapshot's
    /// transaction id. The returned handle shares this volume's decryption
    /// context and lock state — a snapshot of an encrypted volume needs the
    /// same VEK as the live volume.
    pub fn open_snapshot(&self, xid: u64) -> Result<Volume<'c, D>> {
        let resolver = self.resolver();
        let snap_tree_root = resolver.lookup(self.device(), self.sb.snap_meta_tree_oid)?;
        let info = snapshot::lookup_snapshot(self.device(), snap_tree_root, self.block_size(), &resolver, xid)?;

        let block = object::read_block(self.device(), info.volume_superblock_block, self.block_size())?;
        let sb = ApfsSuperblock::parse(&block)?;
        let vol_omap = ObjectMap::read(self.device(), sb.omap_oid, self.block_size())?;
        let catalog_resolver = Omap::new(vol_omap.tree_root, self.block_size(), sb.header.xid);
        let catalog_root_block = catalog_resolver.lookup(self.device(), sb.root_tree_oid)?;

        Ok(Volume {
            container: self.container,
            target_xid: sb.header.xid,
            vol_omap_tree_root: vol_omap.tree_root,
            catalog_root_block,
            sb,
            crypto: self.crypto.clone(),
            locked: self.locked,
        })
    }
}

/// A single file-system object (file, directory, or symlink) within a
/// volume, as returned by [`Volume::root`], [`Volume::lookup`],
/// [`Volume::by_identifier`], or [`FileEntry::children`].
pub struct FileEntry<'v, 'c, D: BlockDevice> {
    volume: &'v Volume<'c, D>,
    inode: InodeVal,
    oid: u64,
    name: String,
}

impl<'v, 'c, D: BlockDevice> FileEntry<'v, 'c, D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> u64 {
        self.oid
    }

    pub fn parent_identifier(&self) -> u64 {
        self.inode.parent_id
    }

    /// Full BSD mode, including the file-type bits (`S_IFDIR`/`S_IFREG`/`S_IFLNK`).
    pub fn mode(&self) -> u16 {
        self.inode.mode
    }

    pub fn uid(&self) -> u32 {
        self.inode.uid
    }

    pub fn gid(&self) -> u32 {
        self.inode.gid
    }

    pub fn size(&self) -> u64 {
        self.inode.size()
    }

    pub fn flags(&self) -> u64 {
        self.inode.internal_flags
    }

    pub fn create_time_ns(&self) -> i64 {
        self.inode.create_time
    }

    pub fn modify_time_ns(&self) -> i64 {
        self.inode.modify_time
    }

    pub fn change_time_ns(&self) -> i64 {
        self.inode.change_time
    }

    pub fn access_time_ns(&self) -> i64 {
        self.inode.access_time
    }

    pub fn is_directory(&self) -> bool {
        self.inode.kind() == catalog::INODE_DIR_TYPE
    }

    pub fn is_symlink(&self) -> bool {
        self.inode.kind() == catalog::INODE_SYMLINK_TYPE
    }

    pub fn is_regular_file(&self) -> bool {
        self.inode.kind() == catalog::INODE_FILE_TYPE
    }

    /// List the directory entries below this object. Scanning a
    /// non-directory simply returns no rows — there is no dedicated error
    /// for it, since no `DIR_REC` row can ever name a non-directory parent.
    pub fn children(&self) -> Result<Vec<FileEntry<'v, 'c, D>>> {
        self.volume.ensure_unlocked()?;
        let resolver = self.volume.resolver();
        let drecs =
            catalog::list_children(self.volume.device(), self.volume.catalog_root_block, self.volume.block_size(), &resolver, self.oid)?;

        let mut out = Vec::with_capacity(drecs.len());
        for (name, drec) in drecs {
            let inode =
                catalog::lookup_inode(self.volume.device(), self.volume.catalog_root_block, self.volume.block_size(), &resolver, drec.file_id)?;
            out.push(FileEntry { volume: self.volume, inode, oid: drec.file_id, name });
        }
        Ok(out)
    }

    /// List every extended attribute on this object, fully materialized
    /// (external data-stream references are resolved and read in full).
    pub fn attributes(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.volume.ensure_unlocked()?;
        let resolver = self.volume.resolver();
        let xattrs =
            catalog::list_xattrs(self.volume.device(), self.volume.catalog_root_block, self.volume.block_size(), &resolver, self.oid)?;

        let mut out = Vec::with_capacity(xattrs.len());
        for (name, val) in &xattrs {
            out.push((name.clone(), self.materialize_xattr(val)?));
        }
        Ok(out)
    }

    fn materialize_xattr(&self, val: &XattrVal) -> Result<Vec<u8>> {
        if val.is_stream_reference() {
            let stream = XattrStreamRef::parse(&val.data)?;
            self.read_dstream(stream.xattr_obj_id, &stream.dstream)
        } else {
            Ok(val.data.clone())
        }
    }

    fn read_dstream(&self, data_stream_oid: u64, dstream: &DstreamAttr) -> Result<Vec<u8>> {
        let resolver = self.volume.resolver();
        let extents = catalog::lookup_extents(
            self.volume.device(),
            self.volume.catalog_root_block,
            self.volume.block_size(),
            &resolver,
            data_stream_oid,
        )?;
        let extent_map = ExtentMap::build(&extents, dstream.size);
        let mut out = vec![0u8; dstream.size as usize];
        extent_map.read_at(self.volume.device(), self.volume.block_size(), self.volume.crypto.as_ref(), 0, &mut out)?;
        Ok(out)
    }

    /// If this object carries a `com.apple.decmpfs` attribute, return its
    /// parsed header plus the sibling resource-fork bytes the method needs
    /// (if any). `None` means the file is stored uncompressed.
    fn decmpfs(&self) -> Result<Option<(DecmpfsHeader, Option<Vec<u8>>)>> {
        let resolver = self.volume.resolver();
        let decmpfs_val = catalog::lookup_xattr(
            self.volume.device(),
            self.volume.catalog_root_block,
            self.volume.block_size(),
            &resolver,
            self.oid,
            compress::DECMPFS_XATTR_NAME,
        )?;
        let Some(decmpfs_val) = decmpfs_val else {
            return Ok(None);
        };

        let header = DecmpfsHeader::parse(&self.materialize_xattr(&decmpfs_val)?)?;
        let resource_fork = if header.method.uses_resource_fork() {
            let rf_val = catalog::lookup_xattr(
                self.volume.device(),
                self.volume.catalog_root_block,
                self.volume.block_size(),
                &resolver,
                self.oid,
                compress::RESOURCE_FORK_XATTR_NAME,
            )?
            .ok_or_else(|| ApfsError::Malformed("compressed file missing resource fork".into()))?;
            Some(self.materialize_xattr(&rf_val)?)
        } else {
            None
        };

        Ok(Some((header, resource_fork)))
    }

    /// Read up to `buf.len()` bytes starting at logical `offset`,
    /// transparently decompressing `com.apple.decmpfs` files and decrypting
    /// extents on an unlocked encrypted volume.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.volume.ensure_unlocked()?;

        if let Some((header, resource_fork)) = self.decmpfs()? {
            let reader = CompressedReader::new(&header, resource_fork.as_deref())?;
            return Ok(reader.read_at(offset, buf));
        }

        let resolver = self.volume.resolver();
        let extents = catalog::lookup_extents(
            self.volume.device(),
            self.volume.catalog_root_block,
            self.volume.block_size(),
            &resolver,
            self.inode.private_id,
        )?;
        let extent_map = ExtentMap::build(&extents, self.inode.size());
        extent_map.read_at(self.volume.device(), self.volume.block_size(), self.volume.crypto.as_ref(), offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_fixture() -> Option<Container<ReaderDevice<std::fs::File>>> {
        let file = std::fs::File::open("tests/appfs.raw").ok()?;
        Container::open_reader(file).ok()
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_open_container_and_root() {
        let container = open_fixture().unwrap();
        assert!(container.volume_count() >= 1);
        let volume = container.volume(1).unwrap();
        let root = volume.root().unwrap();
        assert!(root.is_directory());
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_lookup_and_read_file() {
        let container = open_fixture().unwrap();
        let volume = container.volume(1).unwrap();
        let entry = volume.lookup("/Users/test/hello.txt").unwrap();
        let mut buf = vec![0u8; entry.size() as usize];
        let n = entry.read(0, &mut buf).unwrap();
        assert_eq!(n, buf.len());
    }

    #[test]
    fn test_credential_constructors_pick_the_right_variant() {
        assert!(matches!(Credential::password(b"x".to_vec()), Credential::Password(_)));
        assert!(matches!(Credential::recovery_password(b"y".to_vec()), Credential::RecoveryPassword(_)));
    }
}
