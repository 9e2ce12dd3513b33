//! On-disk array store.
//!
//! Layout, one directory per array under the store root:
//! - `meta.json`: dtype, shape, length, growth bound and the `processed` attribute
//! - `meta.backup.json`: previous copy of `meta.json`
//! - `data.bin`: fixed-width little-endian elements, `len * item_size` bytes
//!
//! Element writes are synced before `write` returns and metadata is replaced
//! atomically (write-then-rename), so a watermark on disk never certifies
//! data that is not there.

use super::{
    ArrayInfo, ArrayLayout, ArrayStore, check_index, check_resize, check_watermark, data_len,
    validate_name,
};
use crate::models::{AstackError, DType, Result, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const META_BACKUP_FILE: &str = "meta.backup.json";
const META_TEMP_FILE: &str = "meta.tmp.json";
const DATA_FILE: &str = "data.bin";

/// Scalar attributes attached to an array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArrayAttrs {
    #[serde(default)]
    pub processed: u64,
}

/// Persisted array metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub name: String,
    pub dtype: DType,
    #[serde(default)]
    pub item_shape: Vec<usize>,
    pub len: u64,
    #[serde(default)]
    pub max_len: Option<u64>,
    pub chunk_len: u64,
    #[serde(default)]
    pub attrs: ArrayAttrs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArrayMeta {
    fn new(name: &str, layout: &ArrayLayout) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            dtype: layout.dtype,
            item_shape: layout.item_shape.clone(),
            len: layout.len,
            max_len: layout.max_len,
            chunk_len: layout.chunk_len,
            attrs: ArrayAttrs::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn info(&self) -> ArrayInfo {
        ArrayInfo {
            name: self.name.clone(),
            dtype: self.dtype,
            item_shape: self.item_shape.clone(),
            len: self.len,
            max_len: self.max_len,
            chunk_len: self.chunk_len,
            processed: self.attrs.processed,
        }
    }

    fn item_size(&self) -> Result<u64> {
        data_len(&self.name, self.dtype, &self.item_shape, 1)
    }
}

/// Array store rooted at a directory.
pub struct DirStore {
    /// Store root
    root: PathBuf,
    /// Metadata of every array, kept in sync with `meta.json`
    arrays: BTreeMap<String, ArrayMeta>,
}

impl DirStore {
    /// Open (or create) a store at `root` and load all array metadata.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| AstackError::io("creating store dir", e))?;

        let pattern = Path::new(&glob::Pattern::escape(&root.to_string_lossy()))
            .join("*")
            .join(META_FILE);
        let pattern_str = pattern.to_string_lossy();

        let meta_files: Vec<_> = glob::glob(&pattern_str)
            .map_err(|e| AstackError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        let mut arrays = BTreeMap::new();
        for meta_path in meta_files {
            let Some(dir) = meta_path.parent() else {
                continue;
            };
            let meta = load_meta(dir)?;
            arrays.insert(meta.name.clone(), meta);
        }

        info!(root = %root.display(), arrays = arrays.len(), "Opened array store");
        Ok(Self {
            root: root.to_path_buf(),
            arrays,
        })
    }

    /// Persisted metadata of an array.
    pub fn meta(&self, name: &str) -> Result<&ArrayMeta> {
        self.arrays
            .get(name)
            .ok_or_else(|| AstackError::ArrayNotFound(name.to_string()))
    }

    fn array_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.array_dir(name).join(DATA_FILE)
    }

    /// Save metadata (atomic write, previous copy kept as backup).
    fn save_meta(&self, meta: &ArrayMeta) -> Result<()> {
        let dir = self.array_dir(&meta.name);
        let meta_path = dir.join(META_FILE);

        // Backup existing metadata
        if meta_path.exists() {
            fs::copy(&meta_path, dir.join(META_BACKUP_FILE))
                .map_err(|e| AstackError::io("backing up array metadata", e))?;
        }

        // Write to temp file
        let temp_path = dir.join(META_TEMP_FILE);
        let file = File::create(&temp_path)
            .map_err(|e| AstackError::io("creating temp array metadata", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, meta)
            .map_err(|e| AstackError::Internal(format!("Serializing array metadata: {e}")))?;
        let file = writer
            .into_inner()
            .map_err(|e| AstackError::io("flushing temp array metadata", e.into_error()))?;
        file.sync_all()
            .map_err(|e| AstackError::io("syncing temp array metadata", e))?;

        // Atomic rename
        fs::rename(&temp_path, &meta_path)
            .map_err(|e| AstackError::io("renaming array metadata", e))?;

        debug!(array = %meta.name, processed = meta.attrs.processed, "Array metadata saved");
        Ok(())
    }

    /// Apply `update` to an array's metadata and persist it.
    fn update_meta(&mut self, name: &str, update: impl FnOnce(&mut ArrayMeta)) -> Result<()> {
        let mut meta = self.meta(name)?.clone();
        update(&mut meta);
        meta.updated_at = Utc::now();
        self.save_meta(&meta)?;
        self.arrays.insert(name.to_string(), meta);
        Ok(())
    }

    fn set_data_len(&self, name: &str, bytes: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.data_path(name))
            .map_err(|e| AstackError::io("opening array data", e))?;
        file.set_len(bytes)
            .map_err(|e| AstackError::io("resizing array data", e))?;
        file.sync_all()
            .map_err(|e| AstackError::io("syncing array data", e))
    }
}

/// Load `meta.json`, falling back to the backup when the main copy is unreadable.
fn load_meta(dir: &Path) -> Result<ArrayMeta> {
    let meta = match read_meta(&dir.join(META_FILE)) {
        Ok(meta) => meta,
        Err(err) => {
            let backup = dir.join(META_BACKUP_FILE);
            if !backup.exists() {
                return Err(err);
            }
            warn!(dir = %dir.display(), error = %err, "Array metadata unreadable, using backup");
            read_meta(&backup)?
        }
    };
    data_len(&meta.name, meta.dtype, &meta.item_shape, meta.len)?;
    Ok(meta)
}

fn read_meta(path: &Path) -> Result<ArrayMeta> {
    let file = File::open(path).map_err(|e| AstackError::io("opening array metadata", e))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| {
        AstackError::ParseError(format!("Invalid array metadata {}: {e}", path.display()))
    })
}

impl ArrayStore for DirStore {
    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.arrays.contains_key(name))
    }

    fn create(&mut self, name: &str, layout: &ArrayLayout) -> Result<()> {
        validate_name(name)?;
        if self.arrays.contains_key(name) {
            return Err(AstackError::ArrayExists(name.to_string()));
        }
        let bytes = data_len(name, layout.dtype, &layout.item_shape, layout.len)?;

        // Leftovers of a create that crashed before its metadata was saved.
        let dir = self.array_dir(name);
        if dir.exists() {
            warn!(array = %name, "Removing incomplete array dir");
            fs::remove_dir_all(&dir).map_err(|e| AstackError::io("removing incomplete array dir", e))?;
        }
        fs::create_dir_all(&dir).map_err(|e| AstackError::io("creating array dir", e))?;

        // Data first: an array only exists once its metadata is on disk.
        let meta = ArrayMeta::new(name, layout);
        self.set_data_len(name, bytes)?;
        self.save_meta(&meta)?;
        self.arrays.insert(name.to_string(), meta);

        debug!(array = %name, len = layout.len, dtype = %layout.dtype, "Created array");
        Ok(())
    }

    fn info(&self, name: &str) -> Result<ArrayInfo> {
        Ok(self.meta(name)?.info())
    }

    fn resize(&mut self, name: &str, len: u64) -> Result<()> {
        let meta = self.meta(name)?;
        check_resize(&meta.info(), len)?;
        let bytes = data_len(name, meta.dtype, &meta.item_shape, len)?;
        self.set_data_len(name, bytes)?;
        self.update_meta(name, |meta| meta.len = len)
    }

    fn read(&self, name: &str, index: u64) -> Result<Value> {
        let meta = self.meta(name)?;
        check_index(&meta.info(), index)?;

        let size = meta.item_size()?;
        let mut file =
            File::open(self.data_path(name)).map_err(|e| AstackError::io("opening array data", e))?;
        file.seek(SeekFrom::Start(index * size))
            .map_err(|e| AstackError::io("seeking array data", e))?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf)
            .map_err(|e| AstackError::io("reading array data", e))?;

        Ok(meta.dtype.decode(&meta.item_shape, &buf)?)
    }

    fn write(&mut self, name: &str, index: u64, value: &Value) -> Result<()> {
        let meta = self.meta(name)?;
        check_index(&meta.info(), index)?;

        let value = meta.dtype.coerce_element(&meta.item_shape, value)?;
        let size = meta.item_size()?;
        let mut buf = Vec::with_capacity(size as usize);
        meta.dtype.encode(&meta.item_shape, &value, &mut buf)?;

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.data_path(name))
            .map_err(|e| AstackError::io("opening array data", e))?;
        file.seek(SeekFrom::Start(index * size))
            .map_err(|e| AstackError::io("seeking array data", e))?;
        file.write_all(&buf)
            .map_err(|e| AstackError::io("writing array data", e))?;
        file.sync_data()
            .map_err(|e| AstackError::io("syncing array data", e))?;
        Ok(())
    }

    fn set_processed(&mut self, name: &str, index: u64) -> Result<()> {
        check_watermark(&self.meta(name)?.info(), index)?;
        self.update_meta(name, |meta| meta.attrs.processed = index)
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        if self.arrays.remove(name).is_none() {
            return Err(AstackError::ArrayNotFound(name.to_string()));
        }
        fs::remove_dir_all(self.array_dir(name))
            .map_err(|e| AstackError::io("removing array dir", e))?;
        debug!(array = %name, "Deleted array");
        Ok(())
    }

    fn names(&self) -> Result<Vec<String>> {
        Ok(self.arrays.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(dtype: DType, shape: Vec<usize>, len: u64) -> ArrayLayout {
        ArrayLayout::new(dtype, shape, len)
    }

    #[test]
    fn test_create_write_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("store");

        {
            let mut store = DirStore::open(&root).unwrap();
            store
                .create("pairs", &layout(DType::Int32, vec![2], 3))
                .unwrap();
            store.write("pairs", 1, &Value::from(vec![-5, 9])).unwrap();
            store.set_processed("pairs", 1).unwrap();
        }

        let store = DirStore::open(&root).unwrap();
        assert_eq!(store.names().unwrap(), vec!["pairs"]);
        let info = store.info("pairs").unwrap();
        assert_eq!(info.len, 3);
        assert_eq!(info.processed, 1);
        assert_eq!(info.item_shape, vec![2]);
        assert_eq!(store.read("pairs", 1).unwrap(), Value::from(vec![-5, 9]));
        assert_eq!(store.read("pairs", 0).unwrap(), Value::from(vec![0, 0]));

        let data_len = fs::metadata(root.join("pairs").join(DATA_FILE)).unwrap().len();
        assert_eq!(data_len, 3 * 2 * 4);
    }

    #[test]
    fn test_resize_grows_data_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = DirStore::open(temp_dir.path()).unwrap();
        store.create("s", &layout(DType::Str(4), vec![], 2)).unwrap();
        store.write("s", 1, &Value::from("abc")).unwrap();
        store.resize("s", 5).unwrap();

        assert_eq!(store.info("s").unwrap().len, 5);
        assert_eq!(store.read("s", 1).unwrap(), Value::from("abc"));
        assert_eq!(store.read("s", 4).unwrap(), Value::from(""));
        let data_len = fs::metadata(temp_dir.path().join("s").join(DATA_FILE))
            .unwrap()
            .len();
        assert_eq!(data_len, 5 * 4);
    }

    #[test]
    fn test_resize_beyond_bound_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = DirStore::open(temp_dir.path()).unwrap();
        let bounded = ArrayLayout {
            max_len: Some(3),
            ..layout(DType::Float64, vec![], 3)
        };
        store.create("b", &bounded).unwrap();
        assert!(matches!(
            store.resize("b", 4),
            Err(AstackError::ResizeExceedsBound { .. })
        ));
        assert_eq!(store.info("b").unwrap().len, 3);
    }

    #[test]
    fn test_corrupt_meta_falls_back_to_backup() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut store = DirStore::open(temp_dir.path()).unwrap();
            store.create("x", &layout(DType::UInt8, vec![], 4)).unwrap();
            store.set_processed("x", 2).unwrap();
        }
        fs::write(temp_dir.path().join("x").join(META_FILE), "{ truncated").unwrap();

        let store = DirStore::open(temp_dir.path()).unwrap();
        // The backup holds the state before the last save.
        assert_eq!(store.processed("x").unwrap(), 0);
    }

    #[test]
    fn test_delete_removes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = DirStore::open(temp_dir.path()).unwrap();
        store.create("gone", &layout(DType::Bool, vec![], 1)).unwrap();
        store.delete("gone").unwrap();
        assert!(!temp_dir.path().join("gone").exists());
        assert!(!store.contains("gone").unwrap());

        let reopened = DirStore::open(temp_dir.path()).unwrap();
        assert!(reopened.names().unwrap().is_empty());
    }

    #[test]
    fn test_create_discards_incomplete_array() {
        let temp_dir = TempDir::new().unwrap();
        let stale = temp_dir.path().join("z");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join(DATA_FILE), [0xffu8; 4]).unwrap();

        let mut store = DirStore::open(temp_dir.path()).unwrap();
        assert!(!store.contains("z").unwrap());
        store.create("z", &layout(DType::UInt8, vec![], 4)).unwrap();
        assert_eq!(store.read("z", 0).unwrap(), Value::UInt(0));
    }

    #[test]
    fn test_type_error_leaves_data_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = DirStore::open(temp_dir.path()).unwrap();
        store.create("i", &layout(DType::Int8, vec![], 1)).unwrap();
        store.write("i", 0, &Value::Int(5)).unwrap();
        assert!(matches!(
            store.write("i", 0, &Value::Int(1000)),
            Err(AstackError::Type(_))
        ));
        assert_eq!(store.read("i", 0).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_zero_width_elements_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = DirStore::open(temp_dir.path()).unwrap();
        store.create("z", &layout(DType::Float32, vec![2, 0], 2)).unwrap();
        let empty_pair = Value::List(vec![Value::List(vec![]), Value::List(vec![])]);
        store.write("z", 0, &empty_pair).unwrap();
        store.set_processed("z", 0).unwrap();

        let reopened = DirStore::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.read("z", 0).unwrap(), empty_pair);
        assert_eq!(reopened.read("z", 1).unwrap(), empty_pair);
    }

    #[test]
    fn test_oversized_layout_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = DirStore::open(temp_dir.path()).unwrap();
        assert!(matches!(
            store.create("big", &layout(DType::Float64, vec![usize::MAX, 2], 1)),
            Err(AstackError::InvalidInput(_))
        ));
        assert!(!temp_dir.path().join("big").exists());

        store.create("wide", &layout(DType::Float64, vec![4], 1)).unwrap();
        assert!(matches!(
            store.resize("wide", u64::MAX),
            Err(AstackError::InvalidInput(_))
        ));
        assert_eq!(store.info("wide").unwrap().len, 1);
    }
}
