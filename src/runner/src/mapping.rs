use std::convert::TryInto;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::slice;

use anyhow::{bail, Context, Result};
use libc::c_void;
use tempfile::NamedTempFile;

use crate::constants::*;

enum Backing {
    /// Created by us. The file is removed when dropped.
    Owned(NamedTempFile),
    /// Handed to us by the parent process. Nothing to clean up besides closing it.
    Inherited(File),
}

/// Shared memory file mapped into both the runner and the testee.
///
/// Layout is positional: coverage, then input, then sonar. Neither side takes a lock; the
/// request/reply protocol guarantees only one side touches a region at a time.
pub struct Mapping {
    ptr: *mut c_void,
    len: usize,
    backing: Backing,
}

// The mapping is plain memory. Turn-taking over the pipes is what keeps accesses ordered.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Create a fresh temporary comm file and map it
    pub fn create() -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("sqlfuzz-comm")
            .tempfile()
            .with_context(|| "Failed to create comm file".to_string())?;
        file.as_file()
            .set_len(COMM_SIZE.try_into()?)
            .with_context(|| "Failed to truncate comm file".to_string())?;

        let ptr = map(file.as_file().as_raw_fd())?;

        Ok(Self {
            ptr,
            len: COMM_SIZE,
            backing: Backing::Owned(file),
        })
    }

    /// Map a comm file inherited from the parent
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor for a comm file that nothing else owns.
    pub unsafe fn inherit(fd: RawFd) -> Result<Self> {
        let file = File::from_raw_fd(fd);
        let len: usize = file
            .metadata()
            .with_context(|| "Failed to stat inherited comm file".to_string())?
            .len()
            .try_into()?;
        if len != COMM_SIZE {
            bail!(
                "Comm file has size {}, expected {}. Runner and testee disagree on layout",
                len,
                COMM_SIZE
            );
        }

        let ptr = map(fd)?;

        Ok(Self {
            ptr,
            len,
            backing: Backing::Inherited(file),
        })
    }

    /// Path of the backing file, if we own it
    pub fn path(&self) -> Option<&std::path::Path> {
        match &self.backing {
            Backing::Owned(f) => Some(f.path()),
            Backing::Inherited(_) => None,
        }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }

    pub fn coverage(&self) -> &[u8] {
        &self.bytes()[..COVER_SIZE]
    }

    pub fn coverage_mut(&mut self) -> &mut [u8] {
        &mut self.bytes_mut()[..COVER_SIZE]
    }

    pub fn input(&self) -> &[u8] {
        &self.bytes()[COVER_SIZE..COVER_SIZE + MAX_INPUT_SIZE]
    }

    pub fn input_mut(&mut self) -> &mut [u8] {
        &mut self.bytes_mut()[COVER_SIZE..COVER_SIZE + MAX_INPUT_SIZE]
    }

    pub fn sonar(&self) -> &[u8] {
        &self.bytes()[COVER_SIZE + MAX_INPUT_SIZE..]
    }

    pub fn sonar_mut(&mut self) -> &mut [u8] {
        &mut self.bytes_mut()[COVER_SIZE + MAX_INPUT_SIZE..]
    }
}

impl AsRawFd for Mapping {
    fn as_raw_fd(&self) -> RawFd {
        match &self.backing {
            Backing::Owned(f) => f.as_file().as_raw_fd(),
            Backing::Inherited(f) => f.as_raw_fd(),
        }
    }
}

fn map(fd: RawFd) -> Result<*mut c_void> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            COMM_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        bail!("Failed to mmap comm file");
    }

    Ok(ptr)
}

impl Drop for Mapping {
    /// Unmap before the backing file goes away. Panic rather than slowly leak mappings.
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr, self.len) } != 0 {
            panic!("Failed to munmap comm file");
        }
    }
}

#[test]
fn test_regions_are_disjoint() {
    let mut mapping = Mapping::create().expect("failed to create mapping");

    mapping.coverage_mut().iter_mut().for_each(|b| *b = 1);
    mapping.input_mut().iter_mut().for_each(|b| *b = 2);
    mapping.sonar_mut().iter_mut().for_each(|b| *b = 3);

    assert_eq!(mapping.coverage().len(), COVER_SIZE);
    assert_eq!(mapping.input().len(), MAX_INPUT_SIZE);
    assert_eq!(mapping.sonar().len(), SONAR_REGION_SIZE);
    assert!(mapping.coverage().iter().all(|&b| b == 1));
    assert!(mapping.input().iter().all(|&b| b == 2));
    assert!(mapping.sonar().iter().all(|&b| b == 3));
}

#[test]
fn test_comm_file_is_shared_and_removed() {
    use std::fs;
    use std::io::{Read, Seek, SeekFrom};

    let mut mapping = Mapping::create().expect("failed to create mapping");
    let path = mapping.path().expect("owned mapping has a path").to_path_buf();
    assert_eq!(fs::metadata(&path).unwrap().len(), COMM_SIZE as u64);

    mapping.input_mut()[..5].copy_from_slice(b"hello");

    // Anyone else opening the file sees the same bytes
    let mut file = File::open(&path).unwrap();
    file.seek(SeekFrom::Start(COVER_SIZE as u64)).unwrap();
    let mut buf = [0u8; 5];
    file.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    drop(mapping);
    assert!(!path.exists());
}
