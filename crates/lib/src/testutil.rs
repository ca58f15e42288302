//! Test doubles for the external systems and fixture helpers.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

use crate::bootloader::BootRegistry;
use crate::bundle::Layer;
use crate::config::Config;
use crate::deploy::Deployer;
use crate::initramfs::InitramfsBuilder;
use crate::repo::{Compression, ManifestEntry, Repository};
use crate::snapshot::{readonly_property_args, SnapshotFilesystem};
use crate::store::Storage;

/// Kernel version shipped in fixture bundles.
pub(crate) const KVER: &str = "6.9.0";

pub(crate) fn utf8_tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let td = tempfile::tempdir()?;
    let p = Utf8PathBuf::try_from(td.path().to_path_buf())?;
    Ok((td, p))
}

pub(crate) fn tar_of(files: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut b = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut h = tar::Header::new_gnu();
        h.set_size(data.len() as u64);
        h.set_mode(0o644);
        b.append_data(&mut h, path, *data)?;
    }
    Ok(b.into_inner()?)
}

/// Fixture layer images are tar archives, which [`FakeFilesystem`]
/// unpacks on receive.
fn layer_image(layer: Layer, with_kernel: bool) -> Result<Vec<u8>> {
    let kernel = format!("usr/lib/modules/{KVER}/vmlinuz");
    match layer {
        Layer::Root if with_kernel => tar_of(&[
            ("usr/bin/true", b"".as_slice()),
            (kernel.as_str(), b"kernel image".as_slice()),
        ]),
        Layer::Root => tar_of(&[("usr/bin/true", b"".as_slice())]),
        Layer::Etc => tar_of(&[("hostname", b"rootsnap\n".as_slice())]),
        Layer::Var => tar_of(&[("lib/state", b"".as_slice())]),
    }
}

fn write_bundle_impl(
    dir: &Utf8Path,
    id: &str,
    version: &str,
    compression: Compression,
    layers: &[Layer],
    with_kernel: bool,
) -> Result<(Utf8PathBuf, ManifestEntry)> {
    let images = layers
        .iter()
        .map(|l| Ok((l.stream_name(id), layer_image(*l, with_kernel)?)))
        .collect::<Result<Vec<_>>>()?;
    let files: Vec<(&str, &[u8])> = images
        .iter()
        .map(|(n, d)| (n.as_str(), d.as_slice()))
        .collect();
    let archive = tar_of(&files)?;
    let compressed = match compression {
        Compression::Zstd => zstd::stream::encode_all(archive.as_slice(), 0)?,
        Compression::Gzip => {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(&archive)?;
            enc.finish()?
        }
    };
    let entry = ManifestEntry {
        id: id.to_owned(),
        compression,
        version: version.to_owned(),
        digest: hex::encode(Sha256::digest(&compressed)),
    };
    let path = dir.join(entry.bundle_name());
    std::fs::write(&path, compressed).with_context(|| format!("Writing {path}"))?;
    Ok((path, entry))
}

/// Write a bundle with only `layers` into `dir`.
pub(crate) fn write_bundle_with(
    dir: &Utf8Path,
    id: &str,
    version: &str,
    compression: Compression,
    layers: &[Layer],
) -> Result<(Utf8PathBuf, ManifestEntry)> {
    write_bundle_impl(dir, id, version, compression, layers, true)
}

/// Write a complete bundle into `dir`.
pub(crate) fn write_bundle(
    dir: &Utf8Path,
    id: &str,
    version: &str,
    compression: Compression,
) -> Result<(Utf8PathBuf, ManifestEntry)> {
    write_bundle_with(dir, id, version, compression, &Layer::ALL)
}

/// Write a bundle whose root layer has no kernel.
pub(crate) fn write_bundle_without_kernel(
    dir: &Utf8Path,
    id: &str,
) -> Result<(Utf8PathBuf, ManifestEntry)> {
    write_bundle_impl(dir, id, "v1", Compression::Zstd, &Layer::ALL, false)
}

/// Subvolumes as plain directories, tracked in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeFilesystem {
    /// Subvolume path to its read-only flag
    subvolumes: RefCell<BTreeMap<Utf8PathBuf, bool>>,
    /// Subvolumes created by a stream, which carry a `received_uuid`
    received_paths: RefCell<BTreeSet<Utf8PathBuf>>,
    received: RefCell<Vec<String>>,
    unseals: RefCell<BTreeMap<Utf8PathBuf, u32>>,
    /// Name whose receive fails, and whether it leaves a partial subvolume
    fail_receive: RefCell<Option<(String, bool)>>,
    fail_delete: Cell<bool>,
}

impl FakeFilesystem {
    /// Whether the innermost subvolume containing `path` is read-only.
    fn in_readonly(&self, path: &Utf8Path) -> bool {
        self.subvolumes
            .borrow()
            .iter()
            .filter(|(sv, _)| path.starts_with(sv))
            .max_by_key(|(sv, _)| sv.components().count())
            .is_some_and(|(_, ro)| *ro)
    }

    pub(crate) fn is_readonly(&self, path: &Utf8Path) -> bool {
        self.subvolumes.borrow().get(path).copied().unwrap_or(false)
    }

    /// All subvolumes, parents before their children.
    pub(crate) fn subvolumes(&self) -> Vec<Utf8PathBuf> {
        self.subvolumes.borrow().keys().cloned().collect()
    }

    /// How many streams named `name` were received.
    pub(crate) fn received(&self, name: &str) -> usize {
        self.received.borrow().iter().filter(|n| *n == name).count()
    }

    /// How often `path` was made writable.
    pub(crate) fn unseal_count(&self, path: &Utf8Path) -> u32 {
        self.unseals.borrow().get(path).copied().unwrap_or_default()
    }

    pub(crate) fn fail_receive(&self, name: &str, partial: bool) {
        *self.fail_receive.borrow_mut() = Some((name.to_owned(), partial));
    }

    pub(crate) fn fail_receive_clear(&self) {
        *self.fail_receive.borrow_mut() = None;
    }

    pub(crate) fn fail_delete(&self, fail: bool) {
        self.fail_delete.set(fail);
    }

    /// Create an empty, writable subvolume at `path`, as `btrfs subvolume
    /// create` would.
    pub(crate) fn create(&self, path: &Utf8Path) -> Result<()> {
        anyhow::ensure!(!path.exists(), "{path} exists");
        anyhow::ensure!(!self.in_readonly(path), "{path}: read-only filesystem");
        std::fs::create_dir_all(path)?;
        self.subvolumes.borrow_mut().insert(path.to_owned(), false);
        Ok(())
    }

    /// Apply `btrfs` arguments setting the `ro` property of `path`,
    /// refusing unforced ro->rw flips of received subvolumes like btrfs does.
    pub(crate) fn property_set(&self, path: &Utf8Path, args: &[&str]) -> Result<()> {
        let readonly = match args.last() {
            Some(&"true") => true,
            Some(&"false") => false,
            o => anyhow::bail!("Invalid property value {o:?}"),
        };
        anyhow::ensure!(args.contains(&path.as_str()), "No path in {args:?}");
        let forced = args.contains(&"-f");
        let mut svs = self.subvolumes.borrow_mut();
        let Some(ro) = svs.get_mut(path) else {
            anyhow::bail!("{path} is not a subvolume");
        };
        if *ro && !readonly && !forced && self.received_paths.borrow().contains(path) {
            anyhow::bail!("cannot flip ro->rw with received_uuid set, use force option -f");
        }
        *ro = readonly;
        if !readonly {
            *self.unseals.borrow_mut().entry(path.to_owned()).or_default() += 1;
        }
        Ok(())
    }
}

impl SnapshotFilesystem for FakeFilesystem {
    fn receive(&self, stream: &Utf8Path, parent: &Utf8Path, name: &str) -> Result<Utf8PathBuf> {
        anyhow::ensure!(parent.is_dir(), "{parent} is not a directory");
        anyhow::ensure!(!self.in_readonly(parent), "{parent}: read-only filesystem");
        let dest = parent.join(name);
        anyhow::ensure!(!dest.exists(), "{dest} exists");
        let fail = self.fail_receive.borrow().clone();
        if let Some((fail_name, partial)) = fail {
            if fail_name == name {
                if partial {
                    std::fs::create_dir(&dest)?;
                    self.received_paths.borrow_mut().insert(dest.clone());
                    self.subvolumes.borrow_mut().insert(dest, true);
                }
                anyhow::bail!("injected receive failure for {name}");
            }
        }
        std::fs::create_dir(&dest)?;
        tar::Archive::new(File::open(stream)?).unpack(&dest)?;
        self.received_paths.borrow_mut().insert(dest.clone());
        self.subvolumes.borrow_mut().insert(dest.clone(), true);
        self.received.borrow_mut().push(name.to_owned());
        Ok(dest)
    }

    fn set_readonly(&self, path: &Utf8Path, readonly: bool) -> Result<()> {
        self.property_set(path, &readonly_property_args(path, readonly))
    }

    fn list_subvolumes(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        Ok(self
            .subvolumes
            .borrow()
            .keys()
            .filter(|sv| sv.starts_with(path))
            .cloned()
            .collect())
    }

    fn delete(&self, path: &Utf8Path) -> Result<()> {
        anyhow::ensure!(!self.fail_delete.get(), "injected delete failure for {path}");
        anyhow::ensure!(
            self.subvolumes.borrow().contains_key(path),
            "{path} is not a subvolume"
        );
        let has_children = self
            .subvolumes
            .borrow()
            .keys()
            .any(|sv| sv != path && sv.starts_with(path));
        anyhow::ensure!(!has_children, "{path} contains subvolumes");
        let parent = path.parent().context("No parent")?;
        anyhow::ensure!(!self.in_readonly(parent), "{parent}: read-only filesystem");
        std::fs::remove_dir_all(path)?;
        self.subvolumes.borrow_mut().remove(path);
        self.received_paths.borrow_mut().remove(path);
        Ok(())
    }
}

/// Boot entries in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeBootRegistry {
    entries: RefCell<BTreeMap<String, String>>,
    next_boot: RefCell<Option<String>>,
    fail_next_boot: Cell<bool>,
}

impl FakeBootRegistry {
    pub(crate) fn entries(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub(crate) fn entry(&self, id: &str) -> Option<String> {
        self.entries.borrow().get(id).cloned()
    }

    pub(crate) fn next_boot(&self) -> Option<String> {
        self.next_boot.borrow().clone()
    }

    pub(crate) fn fail_next_boot(&self, fail: bool) {
        self.fail_next_boot.set(fail);
    }
}

impl BootRegistry for FakeBootRegistry {
    fn write_entry(&self, id: &str, contents: &str) -> Result<()> {
        self.entries
            .borrow_mut()
            .insert(id.to_owned(), contents.to_owned());
        Ok(())
    }

    fn set_next_boot(&self, id: &str) -> Result<()> {
        anyhow::ensure!(!self.fail_next_boot.get(), "injected bootctl failure");
        anyhow::ensure!(self.entries.borrow().contains_key(id), "No entry {id}");
        *self.next_boot.borrow_mut() = Some(id.to_owned());
        Ok(())
    }

    fn remove_entry(&self, id: &str) -> Result<()> {
        self.entries.borrow_mut().remove(id);
        Ok(())
    }
}

/// Records requests and writes a placeholder image.
#[derive(Debug, Default)]
pub(crate) struct FakeInitramfs {
    generated: RefCell<Vec<String>>,
}

impl FakeInitramfs {
    /// Kernel versions an initramfs was generated for.
    pub(crate) fn generated(&self) -> Vec<String> {
        self.generated.borrow().clone()
    }
}

impl InitramfsBuilder for FakeInitramfs {
    fn generate(&self, sysroot: &Utf8Path, kver: &str, output: &Utf8Path) -> Result<()> {
        anyhow::ensure!(sysroot.join("usr/lib/modules").join(kver).is_dir());
        std::fs::write(output, format!("initramfs for {kver}\n"))?;
        self.generated.borrow_mut().push(kver.to_owned());
        Ok(())
    }
}

/// An initialized state root, a local repository offering the `base`
/// target, and fakes for every external system.
#[derive(Debug)]
pub(crate) struct TestEnv {
    _td: tempfile::TempDir,
    pub(crate) repo_dir: Utf8PathBuf,
    pub(crate) config: Config,
    pub(crate) storage: Storage,
    pub(crate) repo: Repository,
    pub(crate) fs: FakeFilesystem,
    pub(crate) registry: FakeBootRegistry,
    pub(crate) initramfs: FakeInitramfs,
}

impl TestEnv {
    pub(crate) const TARGET: &'static str = "base";

    pub(crate) fn new() -> Result<Self> {
        let (td, dir) = utf8_tempdir()?;
        let repo_dir = dir.join("repo");
        std::fs::create_dir_all(repo_dir.join(Self::TARGET))?;
        std::fs::write(repo_dir.join("list"), format!("{}\n", Self::TARGET))?;
        let config = Config {
            repo_url: format!("file://{repo_dir}"),
            repo_default_image: Self::TARGET.to_owned(),
            ..Default::default()
        };
        let storage = Storage::init(&dir.join("state"), &dir.join("boot"), &config)?;
        let repo = Repository::new(&config.repo_url);
        Ok(Self {
            _td: td,
            repo_dir,
            config,
            storage,
            repo,
            fs: Default::default(),
            registry: Default::default(),
            initramfs: Default::default(),
        })
    }

    pub(crate) fn cache_dir(&self) -> Utf8PathBuf {
        self.storage.cache_dir()
    }

    /// Publish `versions` (newest first) as the version index, with a
    /// bundle each; their ids are `base-{version}`.
    pub(crate) fn publish(&self, versions: &[&str]) -> Result<()> {
        let dir = self.repo_dir.join(Self::TARGET);
        let mut db = String::new();
        for v in versions {
            let id = format!("{}-{v}", Self::TARGET);
            let (_, e) = write_bundle(&dir, &id, v, Compression::Zstd)?;
            db.push_str(&format!("{}:{}:{}:{}\n", e.id, e.compression, e.version, e.digest));
        }
        std::fs::write(dir.join("database"), db)?;
        Ok(())
    }

    /// Corrupt the published bundle of `id`.
    pub(crate) fn tamper(&self, id: &str) -> Result<()> {
        let path = self.repo_dir.join(Self::TARGET).join(format!("{id}.tar.zst"));
        let mut f = File::options().append(true).open(&path)?;
        f.write_all(b"trailing garbage")?;
        Ok(())
    }

    /// Lay out a deployment the way the materializer would, without any
    /// layer content.
    pub(crate) fn fake_deployment(&self, id: &str) -> Result<()> {
        std::fs::create_dir_all(self.storage.deployment_dir(id))?;
        let rootfs = self.storage.rootfs(id);
        self.fs.create(&rootfs)?;
        self.fs.create(&rootfs.join("etc"))?;
        self.fs.set_readonly(&rootfs, true)?;
        let kdir = self.storage.kernel_dir(id);
        std::fs::create_dir_all(&kdir)?;
        std::fs::write(kdir.join(crate::kernel::VMLINUZ), b"kernel image")?;
        self.registry
            .write_entry(id, &format!("linux /{id}/vmlinuz\n"))?;
        Ok(())
    }

    pub(crate) fn deployer(&self) -> Deployer<'_> {
        Deployer {
            config: &self.config,
            storage: &self.storage,
            repo: &self.repo,
            fs: &self.fs,
            registry: &self.registry,
            initramfs: &self.initramfs,
        }
    }
}
