use std::{
    env,
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Resolve `program` the way a shell would: paths with a directory component
/// are checked directly, bare names are searched for on `PATH`.
pub fn which(program: &Path) -> Option<PathBuf> {
    which_in(program, env::var_os("PATH").as_deref())
}

pub(crate) fn which_in(program: &Path, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if program.as_os_str().is_empty() {
        return None;
    }

    let has_directory = program
        .parent()
        .is_some_and(|parent| !parent.as_os_str().is_empty());
    if has_directory {
        return is_executable(program).then(|| program.to_path_buf());
    }

    env::split_paths(search_path?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{ffi::OsString, fs, os::unix::fs::PermissionsExt};

    use tempfile::TempDir;

    use super::*;

    fn write_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").expect("write");
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod");
        path
    }

    #[test]
    fn finds_bare_names_on_search_path() {
        let first = TempDir::new().expect("tmp");
        let second = TempDir::new().expect("tmp");
        let expected = write_file(second.path(), "worker", 0o755);
        let search: OsString =
            env::join_paths([first.path(), second.path()]).expect("join paths");

        assert_eq!(
            which_in(Path::new("worker"), Some(search.as_os_str())),
            Some(expected)
        );
    }

    #[test]
    fn skips_non_executable_candidates() {
        let dir = TempDir::new().expect("tmp");
        write_file(dir.path(), "worker", 0o644);
        let search = dir.path().as_os_str().to_owned();

        assert_eq!(which_in(Path::new("worker"), Some(search.as_os_str())), None);
    }

    #[test]
    fn explicit_paths_bypass_search() {
        let dir = TempDir::new().expect("tmp");
        let path = write_file(dir.path(), "worker", 0o700);

        assert_eq!(which_in(&path, None), Some(path.clone()));
        assert_eq!(which_in(&dir.path().join("missing"), None), None);
        assert_eq!(which_in(dir.path(), None), None);
    }

    #[test]
    fn missing_search_path_finds_nothing() {
        assert_eq!(which_in(Path::new("sh"), None), None);
        assert_eq!(which_in(Path::new(""), None), None);
    }
}
