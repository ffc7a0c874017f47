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

use std::io::{self, Write};
use std::path::Path;

/// Write `data` into the file at `path`, atomically.
///
/// The file is first staged within `tmp`, which must be on the same file
/// system as `path`. Anything already at `path` is replaced.
pub fn spit(
    tmp: impl AsRef<Path>,
    path: impl AsRef<Path>,
    data: &[u8],
) -> io::Result<()> {
    let mut tf = tempfile::NamedTempFile::new_in(tmp)?;
    tf.as_file_mut().write_all(data)?;
    tf.as_file_mut().sync_all()?;
    tf.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remove the file at `path`, treating its absence as success.
pub fn remove_if_exists(path: impl AsRef<Path>) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(()),
        r => r,
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn spit_replaces_and_remove_tolerates_missing() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("f");

        spit(root.path(), &path, b"one").unwrap();
        spit(root.path(), &path, b"two").unwrap();
        assert_eq!(b"two".to_vec(), std::fs::read(&path).unwrap());

        remove_if_exists(&path).unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
