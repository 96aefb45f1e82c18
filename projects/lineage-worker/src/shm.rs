// Shared-memory array channel
//
// Every named array is a C-order `.npy` file living in a directory that is
// shared with the host process (tmpfs on Linux). Files are created at full
// size and memory-mapped, so the host can open them with numpy directly.

use crate::error::PipelineError;
use anyhow::{Context, Result};
use memmap2::{Mmap, MmapMut};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};
use ndarray_npy::{
    write_zeroed_npy, ViewElement, ViewMutElement, ViewMutNpyExt, ViewNpyExt, WritableElement,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Element types that may cross the process boundary.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Uint8,
    Uint16,
    Uint32,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementType::Uint8 => "uint8",
            ElementType::Uint16 => "uint16",
            ElementType::Uint32 => "uint32",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Reference to a named array in the shared directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArrayRef {
    pub name: String,
    pub dtype: ElementType,
    pub shape: Vec<usize>,
}

/// Rust element types with a shared-memory representation.
pub trait SharedElement:
    WritableElement + ViewElement + ViewMutElement + Copy + 'static
{
    const DTYPE: ElementType;
}

macro_rules! shared_element {
    ($ty:ty, $dtype:expr) => {
        impl SharedElement for $ty {
            const DTYPE: ElementType = $dtype;
        }
    };
}

shared_element!(u8, ElementType::Uint8);
shared_element!(u16, ElementType::Uint16);
shared_element!(u32, ElementType::Uint32);
shared_element!(i32, ElementType::Int32);
shared_element!(i64, ElementType::Int64);
shared_element!(f32, ElementType::Float32);
shared_element!(f64, ElementType::Float64);

/// Directory of named shared arrays used by one invocation.
///
/// Arrays created through this handle are remembered so that a failed
/// invocation can remove them and leave no partial output behind.
pub struct SharedArrayDir {
    root: PathBuf,
    created: RefCell<Vec<String>>,
}

impl SharedArrayDir {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create shared array directory {:?}", root))?;
        Ok(Self {
            root: root.to_path_buf(),
            created: RefCell::new(Vec::new()),
        })
    }

    /// `/dev/shm` when available, the system temp directory otherwise.
    pub fn default_root() -> PathBuf {
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.join("lineage-worker")
        } else {
            std::env::temp_dir().join("lineage-worker")
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.npy", name))
    }

    /// Write `data` as a new named array, replacing any previous array of that name.
    pub fn write<T: SharedElement>(&self, name: &str, data: &ArrayD<T>) -> Result<ArrayRef> {
        let path = self.path_of(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create shared array {:?}", path))?;
        self.created.borrow_mut().push(name.to_string());

        write_zeroed_npy::<T, _>(&file, data.raw_dim())
            .with_context(|| format!("Failed to allocate shared array '{}'", name))?;

        // SAFETY: the file was just created by us and is not resized while mapped.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        {
            let mut view = ArrayViewMutD::<T>::view_mut_npy(&mut mmap)
                .with_context(|| format!("Failed to map shared array '{}'", name))?;
            view.assign(data);
        }
        mmap.flush()?;

        tracing::debug!("Wrote shared array '{}' {:?} ({})", name, data.shape(), T::DTYPE);
        Ok(array_ref(name, T::DTYPE, data.shape()))
    }

    /// Read an array whose element type matches `T` exactly.
    pub fn read<T: SharedElement>(&self, array: &ArrayRef) -> Result<ArrayD<T>> {
        if array.dtype != T::DTYPE {
            anyhow::bail!(
                "Shared array '{}' has element type {}, expected {}",
                array.name,
                array.dtype,
                T::DTYPE
            );
        }
        let path = self.path_of(&array.name);
        let file = fs::File::open(&path)
            .with_context(|| format!("Shared array '{}' not found at {:?}", array.name, path))?;
        // SAFETY: the host writes inputs before invoking the worker and does not
        // touch them until the invocation has finished.
        let mmap = unsafe { Mmap::map(&file)? };
        let view = ArrayViewD::<T>::view_npy(&mmap)
            .with_context(|| format!("Failed to map shared array '{}'", array.name))?;

        if view.shape() != array.shape.as_slice() {
            return Err(PipelineError::ShapeMismatch {
                what: array.name.clone(),
                expected: array.shape.clone(),
                actual: view.shape().to_vec(),
            }
            .into());
        }
        Ok(view.to_owned())
    }

    /// Read any supported element type, casting to `f32`.
    pub fn read_f32(&self, array: &ArrayRef) -> Result<ArrayD<f32>> {
        Ok(match array.dtype {
            ElementType::Uint8 => self.read::<u8>(array)?.mapv(|v| v as f32),
            ElementType::Uint16 => self.read::<u16>(array)?.mapv(|v| v as f32),
            ElementType::Uint32 => self.read::<u32>(array)?.mapv(|v| v as f32),
            ElementType::Int32 => self.read::<i32>(array)?.mapv(|v| v as f32),
            ElementType::Int64 => self.read::<i64>(array)?.mapv(|v| v as f32),
            ElementType::Float32 => self.read::<f32>(array)?,
            ElementType::Float64 => self.read::<f64>(array)?.mapv(|v| v as f32),
        })
    }

    /// Read any supported element type, casting to `i32`. Floats are truncated.
    pub fn read_i32(&self, array: &ArrayRef) -> Result<ArrayD<i32>> {
        Ok(match array.dtype {
            ElementType::Uint8 => self.read::<u8>(array)?.mapv(|v| v as i32),
            ElementType::Uint16 => self.read::<u16>(array)?.mapv(|v| v as i32),
            ElementType::Uint32 => self.read::<u32>(array)?.mapv(|v| v as i32),
            ElementType::Int32 => self.read::<i32>(array)?,
            ElementType::Int64 => self.read::<i64>(array)?.mapv(|v| v as i32),
            ElementType::Float32 => self.read::<f32>(array)?.mapv(|v| v as i32),
            ElementType::Float64 => self.read::<f64>(array)?.mapv(|v| v as i32),
        })
    }

    /// Write integer labels using the requested element type.
    pub fn write_labels_as(
        &self,
        name: &str,
        labels: &ArrayD<i32>,
        dtype: ElementType,
    ) -> Result<ArrayRef> {
        match dtype {
            ElementType::Uint8 => self.write(name, &labels.mapv(|v| v as u8)),
            ElementType::Uint16 => self.write(name, &labels.mapv(|v| v as u16)),
            ElementType::Uint32 => self.write(name, &labels.mapv(|v| v as u32)),
            ElementType::Int32 => self.write(name, labels),
            ElementType::Int64 => self.write(name, &labels.mapv(|v| v as i64)),
            ElementType::Float32 => self.write(name, &labels.mapv(|v| v as f32)),
            ElementType::Float64 => self.write(name, &labels.mapv(|v| v as f64)),
        }
    }

    /// Remove a named array. Missing arrays are ignored.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove shared array {:?}", path))?;
        }
        Ok(())
    }

    /// Treat every array written so far as final; it is no longer discarded.
    pub fn keep_created(&self) {
        self.created.borrow_mut().clear();
    }

    /// Remove every array written through this handle since the last `keep_created`.
    pub fn discard_created(&self) {
        for name in self.created.borrow_mut().drain(..) {
            if let Err(e) = self.remove(&name) {
                tracing::warn!("Failed to discard shared array '{}': {}", name, e);
            }
        }
    }

    /// Names of all arrays currently present in the directory.
    pub fn list(&self) -> Vec<String> {
        WalkDir::new(&self.root)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|s| s.to_str()) == Some("npy") {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(|s| s.to_string())
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Convenience for building an `ArrayRef` without touching the filesystem.
pub fn array_ref(name: &str, dtype: ElementType, shape: &[usize]) -> ArrayRef {
    ArrayRef {
        name: name.to_string(),
        dtype,
        shape: shape.to_vec(),
    }
}
