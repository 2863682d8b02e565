use std::{
    collections::HashSet,
    io::{Error, ErrorKind, Read, Result, Write},
    path::{Component, Path, PathBuf},
};

use cap_std::fs::{Dir, OpenOptions};
use rand::{distr::Alphanumeric, Rng, RngCore};
use rustix::fs::{fchmod, mkdirat, Mode};
use rustix::io::Errno;
use sha2::{Digest, Sha256};

/// This function reads as many bytes as are available to fill the buffer, possibly performing
/// multiple reads to do so (and also retrying if required to deal with EINTR).
///
/// Unlike `Read::read_exact()`, hitting EOF early is not an error: the number of bytes actually
/// read is returned, and is smaller than the buffer only if the stream ended.
pub(crate) fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

fn generate_tmpname(prefix: &str) -> String {
    let rand_string: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{prefix}{rand_string}")
}

/// Replace `name` (relative to `dir`) with `data` so that readers see either the old or the new
/// contents, never a mix: the data goes to a temporary file next to the target which is then
/// renamed over it.  The resulting file has mode 0600.
pub(crate) fn atomic_write(dir: &Dir, name: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let name = name.as_ref();
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    for _ in 0..16 {
        let tmp = name.with_file_name(generate_tmpname(".tmp-"));
        let mut file = match dir.open_with(&tmp, &options) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        };
        let result = fchmod(&file, Mode::RUSR | Mode::WUSR)
            .map_err(Error::from)
            .and_then(|()| file.write_all(data))
            .and_then(|()| file.sync_all())
            .and_then(|()| dir.rename(&tmp, dir, name));
        if result.is_err() {
            let _ = dir.remove_file(&tmp);
        }
        return result;
    }
    Err(Error::new(
        ErrorKind::AlreadyExists,
        format!("no free temporary name next to {name:?}"),
    ))
}

/// Create `path` below `dir`, along with any missing parents, each with mode 0700.
pub(crate) fn create_private_dir_at(dir: &Dir, path: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        match mkdirat(dir, current.as_path(), Mode::RWXU) {
            Ok(()) | Err(Errno::EXIST) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Generate a random 64-character hex identifier.
///
/// Identifiers whose 12-character short form would parse as a decimal number are rejected and
/// regenerated, so a short ID can never be confused with a number.
pub fn generate_random_id() -> String {
    loop {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);
        if !id[..12].bytes().all(|b| b.is_ascii_digit()) {
            return id;
        }
    }
}

/// Lexically normalize a path.  Repeated separators collapse, `.` components are dropped and
/// `..` cancels the component before it; an empty result becomes `.`.
pub(crate) fn clean_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let mut out = PathBuf::new();
    let mut depth = 0usize;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !path.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(name) => {
                out.push(name);
                depth += 1;
            }
        }
    }

    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Running sha256 digest and byte count of a stream.
#[derive(Debug, Default)]
pub(crate) struct Digester {
    hasher: Sha256,
    size: u64,
}

impl Digester {
    pub(crate) fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    /// Returns the `sha256:<hex>` digest and the number of bytes seen.
    pub(crate) fn finish(self) -> (String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (digest, self.size)
    }
}

/// Pass-through reader that feeds everything read into a [`Digester`].
pub(crate) struct DigestReader<'d, R> {
    inner: R,
    digester: &'d mut Digester,
}

impl<'d, R: Read> DigestReader<'d, R> {
    pub(crate) fn new(inner: R, digester: &'d mut Digester) -> Self {
        Self { inner, digester }
    }
}

impl<R: Read> Read for DigestReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}

/// Drop repeated names, keeping the first occurrence of each.
pub(crate) fn dedup_names(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read_up_to() {
        let mut r: &[u8] = b"eighteen(18) bytes";
        let mut buf = [0u8; 10];
        assert_eq!(read_up_to(&mut r, &mut buf).unwrap(), 10);
        assert_eq!(read_up_to(&mut r, &mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], b"8) bytes");
        assert_eq!(read_up_to(&mut r, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_up_to_broken_reader() {
        struct BrokenReader;
        impl Read for BrokenReader {
            fn read(&mut self, _buffer: &mut [u8]) -> Result<usize> {
                Err(ErrorKind::NetworkDown.into())
            }
        }

        assert_eq!(
            read_up_to(&mut BrokenReader, &mut [0; 9]).unwrap_err().kind(),
            ErrorKind::NetworkDown
        );
    }

    #[test]
    fn test_atomic_write_replaces() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), cap_std::ambient_authority()).unwrap();
        atomic_write(&dir, "records.json", b"[1]").unwrap();
        atomic_write(&dir, "records.json", b"[1,2]").unwrap();
        assert_eq!(dir.read("records.json").unwrap(), b"[1,2]");
        // no temporary files left behind
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
        let mode = std::fs::metadata(tmp.path().join("records.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_atomic_write_in_subdirectory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), cap_std::ambient_authority()).unwrap();
        dir.create_dir("sub").unwrap();
        atomic_write(&dir, "sub/blob", b"data").unwrap();
        assert_eq!(std::fs::read(tmp.path().join("sub/blob")).unwrap(), b"data");
        assert_eq!(std::fs::read_dir(tmp.path().join("sub")).unwrap().count(), 1);

        // the parent has to exist; nothing is created on failure
        assert_eq!(
            atomic_write(&dir, "missing/blob", b"data").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(!tmp.path().join("missing").exists());
    }

    #[test]
    fn test_create_private_dir_at() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), cap_std::ambient_authority()).unwrap();
        create_private_dir_at(&dir, Path::new("a/b")).unwrap();
        // existing directories are fine
        create_private_dir_at(&dir, Path::new("a/b")).unwrap();
        for sub in ["a", "a/b"] {
            let meta = std::fs::metadata(tmp.path().join(sub)).unwrap();
            assert!(meta.is_dir());
            assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        }
    }

    #[test]
    fn test_generate_random_id() {
        let a = generate_random_id();
        let b = generate_random_id();
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/run//x/./y/"), PathBuf::from("/run/x/y"));
        assert_eq!(clean_path("/run/x/../y"), PathBuf::from("/run/y"));
        assert_eq!(clean_path("/../a"), PathBuf::from("/a"));
        assert_eq!(clean_path("a/../../b"), PathBuf::from("../b"));
        assert_eq!(clean_path(""), PathBuf::from("."));
    }

    #[test]
    fn test_digest_reader() {
        let mut digester = Digester::default();
        let mut out = vec![];
        std::io::copy(&mut DigestReader::new(&b"abc"[..], &mut digester), &mut out).unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(
            digester.finish(),
            (
                "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into(),
                3
            )
        );
    }

    #[test]
    fn test_dedup_names() {
        let names = ["a", "b", "a", "c", "b"].map(String::from);
        assert_eq!(dedup_names(&names), ["a", "b", "c"].map(String::from));
    }
}
